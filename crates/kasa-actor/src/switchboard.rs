//! In-process addressed channels.
//!
//! The switchboard maps a [`ChannelAddress`] to a typed fan-out channel.
//! Every [`Subscription`] gets its own bounded queue, and publishing waits
//! for room in each of them, so a slow subscriber slows its publisher down
//! instead of missing items. A [`Publisher`] owns the binding: binding an
//! address that is already bound fails with [`SwitchboardError::AddressInUse`],
//! and dropping the publisher releases the address and closes the channel
//! for every subscription once they have drained it.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use kasa_core::{ChannelAddress, ErrorCode};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Values that can travel through a switchboard channel.
pub trait Item: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Item for T {}

/// Errors raised by bind/connect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwitchboardError {
    #[error("address already in use: {0}")]
    AddressInUse(ChannelAddress),

    #[error("nothing bound at {0}")]
    NotBound(ChannelAddress),

    #[error("channel at {0} carries a different item type")]
    TypeMismatch(ChannelAddress),
}

impl SwitchboardError {
    /// Maps the error onto the shared failure taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AddressInUse(_) => ErrorCode::AddressInUse,
            Self::NotBound(_) | Self::TypeMismatch(_) => ErrorCode::InvalidRequest,
        }
    }
}

/// Per-subscriber queues of one channel, shared by the publisher and the binding.
type Subscribers<T> = Arc<Mutex<Vec<mpsc::Sender<T>>>>;

fn lock<T>(subscribers: &Mutex<Vec<mpsc::Sender<T>>>) -> MutexGuard<'_, Vec<mpsc::Sender<T>>> {
    subscribers
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Binding {
    id: u64,
    subscribers: Box<dyn Any + Send + Sync>,
}

struct Inner {
    bindings: Mutex<HashMap<ChannelAddress, Binding>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// Registry of bound channel addresses. Cheap to clone.
#[derive(Clone)]
pub struct Switchboard {
    inner: Arc<Inner>,
}

impl Switchboard {
    /// Creates a switchboard whose channels buffer `capacity` items per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                bindings: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                capacity: capacity.max(1),
            }),
        }
    }

    fn bindings(&self) -> MutexGuard<'_, HashMap<ChannelAddress, Binding>> {
        // Every mutation is a single insert/remove, so a poisoned map is still consistent.
        self.inner
            .bindings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Binds `address` and returns the publishing end.
    pub fn bind<T: Item>(&self, address: ChannelAddress) -> Result<Publisher<T>, SwitchboardError> {
        let mut bindings = self.bindings();
        if bindings.contains_key(&address) {
            return Err(SwitchboardError::AddressInUse(address));
        }

        let subscribers: Subscribers<T> = Arc::new(Mutex::new(Vec::new()));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        bindings.insert(
            address.clone(),
            Binding {
                id,
                subscribers: Box::new(Arc::clone(&subscribers)),
            },
        );
        drop(bindings);

        debug!(address = %address, "Bound channel");

        Ok(Publisher {
            address,
            id,
            subscribers,
            board: self.clone(),
        })
    }

    /// Subscribes to the channel bound at `address`.
    ///
    /// Only items published after this call are received.
    pub fn connect<T: Item>(
        &self,
        address: &ChannelAddress,
    ) -> Result<Subscription<T>, SwitchboardError> {
        let bindings = self.bindings();
        let binding = bindings
            .get(address)
            .ok_or_else(|| SwitchboardError::NotBound(address.clone()))?;
        let subscribers = binding
            .subscribers
            .downcast_ref::<Subscribers<T>>()
            .ok_or_else(|| SwitchboardError::TypeMismatch(address.clone()))?;

        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        lock(subscribers).push(sender);

        Ok(Subscription {
            address: address.clone(),
            receiver,
        })
    }

    /// Returns true if something is bound at `address`.
    pub fn is_bound(&self, address: &ChannelAddress) -> bool {
        self.bindings().contains_key(address)
    }

    /// Returns all bound addresses, sorted.
    pub fn addresses(&self) -> Vec<ChannelAddress> {
        let mut addresses: Vec<_> = self.bindings().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    fn release(&self, address: &ChannelAddress, id: u64) {
        let mut bindings = self.bindings();
        if bindings.get(address).is_some_and(|b| b.id == id) {
            bindings.remove(address);
            debug!(address = %address, "Released channel");
        }
    }
}

impl Default for Switchboard {
    fn default() -> Self {
        Self::new(kasa_core::ActorConfig::default().channel_capacity)
    }
}

/// Publishing end of a bound channel. Dropping it releases the address.
pub struct Publisher<T: Item> {
    address: ChannelAddress,
    id: u64,
    subscribers: Subscribers<T>,
    board: Switchboard,
}

impl<T: Item> Publisher<T> {
    /// Publishes an item, returning how many subscribers received it.
    ///
    /// Waits while any subscriber's queue is full. Subscribers that have
    /// gone away are pruned.
    pub async fn send(&self, item: T) -> usize {
        // The lock is never held across an await.
        let targets: Vec<mpsc::Sender<T>> = lock(&self.subscribers).clone();

        let mut delivered = 0;
        let mut pruned = false;
        for target in &targets {
            match target.send(item.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => pruned = true,
            }
        }

        if pruned {
            lock(&self.subscribers).retain(|sender| !sender.is_closed());
            debug!(address = %self.address, "Pruned closed subscribers");
        }

        // No subscribers is not an error: outputs may be unwired.
        delivered
    }

    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers)
            .iter()
            .filter(|sender| !sender.is_closed())
            .count()
    }
}

impl<T: Item> Drop for Publisher<T> {
    fn drop(&mut self) {
        self.board.release(&self.address, self.id);
        // Closes every queue; subscribers still drain what is buffered.
        lock(&self.subscribers).clear();
    }
}

/// Receiving end of a channel.
pub struct Subscription<T: Item> {
    address: ChannelAddress,
    receiver: mpsc::Receiver<T>,
}

impl<T: Item> Subscription<T> {
    /// Waits for the next item.
    ///
    /// Returns `None` once the publisher is gone and the backlog is drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(s: &str) -> ChannelAddress {
        ChannelAddress::new(s)
    }

    #[tokio::test]
    async fn test_bind_and_receive_in_order() {
        let board = Switchboard::new(16);
        let publisher = board.bind::<u32>(addr("inproc://a/out")).unwrap();
        let mut sub = board.connect::<u32>(&addr("inproc://a/out")).unwrap();

        for i in 0..5 {
            publisher.send(i).await;
        }

        for i in 0..5 {
            assert_eq!(sub.recv().await, Some(i));
        }
    }

    #[test]
    fn test_double_bind_is_address_in_use() {
        let board = Switchboard::new(16);
        let _first = board.bind::<u32>(addr("inproc://dup/out")).unwrap();
        let second = board.bind::<u32>(addr("inproc://dup/out"));

        let err = second.err().unwrap();
        assert_eq!(err, SwitchboardError::AddressInUse(addr("inproc://dup/out")));
        assert_eq!(err.code(), ErrorCode::AddressInUse);
    }

    #[test]
    fn test_connect_unbound_and_wrong_type() {
        let board = Switchboard::new(16);
        assert!(matches!(
            board.connect::<u32>(&addr("inproc://missing/out")),
            Err(SwitchboardError::NotBound(_))
        ));

        let _publisher = board.bind::<String>(addr("inproc://text/out")).unwrap();
        assert!(matches!(
            board.connect::<u32>(&addr("inproc://text/out")),
            Err(SwitchboardError::TypeMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_dropping_publisher_releases_and_closes() {
        let board = Switchboard::new(16);
        let publisher = board.bind::<u32>(addr("inproc://gone/out")).unwrap();
        let mut sub = board.connect::<u32>(&addr("inproc://gone/out")).unwrap();

        publisher.send(7).await;
        drop(publisher);

        assert!(!board.is_bound(&addr("inproc://gone/out")));
        assert_eq!(sub.recv().await, Some(7));
        assert_eq!(sub.recv().await, None);

        // Address is free again
        assert!(board.bind::<u32>(addr("inproc://gone/out")).is_ok());
    }

    #[tokio::test]
    async fn test_send_without_subscribers_is_not_an_error() {
        let board = Switchboard::new(4);
        let publisher = board.bind::<u32>(addr("inproc://lonely/out")).unwrap();
        assert_eq!(publisher.send(1).await, 0);
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_full_subscriber_blocks_publisher_without_losing_items() {
        let board = Switchboard::new(2);
        let publisher = board.bind::<u32>(addr("inproc://fast/out")).unwrap();
        let mut sub = board.connect::<u32>(&addr("inproc://fast/out")).unwrap();

        publisher.send(0).await;
        publisher.send(1).await;

        // Queue is full: the third send waits for the subscriber.
        let blocked = tokio::time::timeout(Duration::from_millis(50), publisher.send(2)).await;
        assert!(blocked.is_err());

        let producer = tokio::spawn(async move {
            for i in 2..10 {
                publisher.send(i).await;
            }
        });

        let mut seen = Vec::new();
        while let Some(i) = sub.recv().await {
            seen.push(i);
        }
        producer.await.unwrap();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let board = Switchboard::new(1);
        let publisher = board.bind::<u32>(addr("inproc://pruned/out")).unwrap();
        let mut kept = board.connect::<u32>(&addr("inproc://pruned/out")).unwrap();
        let gone = board.connect::<u32>(&addr("inproc://pruned/out")).unwrap();
        assert_eq!(publisher.subscriber_count(), 2);

        drop(gone);
        assert_eq!(publisher.send(1).await, 1);
        assert_eq!(publisher.subscriber_count(), 1);
        assert_eq!(kept.recv().await, Some(1));
    }
}
