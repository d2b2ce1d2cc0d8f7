//! Actors: named concurrent units with one output and an optional input.
//!
//! An actor is built with a [`Behavior`] chosen up front:
//!
//! - [`Behavior::FreeRunning`]: a [`Process`] with full control over its
//!   input and output through the [`ActorContext`]
//! - [`Behavior::PerItem`]: a [`Transform`] invoked once per inbound item,
//!   or repeatedly with `None` when the actor has no input (a source)
//!
//! Construction binds the output at `inproc://<name>/out`. Nothing runs
//! until [`Actor::start`] (or [`ActorHandle::subscribe`], which wires and
//! starts the downstream actor). The actor stops when its stop flag is
//! observed, its transform returns [`Step::Done`], or its input closes.
//! Stopping releases the output address, which in turn closes the input
//! of every downstream actor.

use std::fmt;
use std::marker::PhantomData;

use async_trait::async_trait;
use kasa_core::{ChannelAddress, ErrorCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::ActorRegistry;
use crate::switchboard::{Item, Publisher, Subscription, SwitchboardError};

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while building or wiring actors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActorError {
    /// Another live actor already publishes at this address.
    #[error("actor '{name}' cannot bind {address}: address in use")]
    AddressInUse {
        name: String,
        address: ChannelAddress,
    },

    /// The actor already has an input.
    #[error("actor '{0}' is already wired to an input")]
    AlreadyWired(String),

    /// Wiring to an upstream failed.
    #[error("actor '{name}' cannot subscribe: {source}")]
    Wiring {
        name: String,
        #[source]
        source: SwitchboardError,
    },
}

impl ActorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AddressInUse { .. } => ErrorCode::AddressInUse,
            Self::AlreadyWired(_) => ErrorCode::InvalidRequest,
            Self::Wiring { source, .. } => source.code(),
        }
    }
}

// ============================================================================
// Behaviors
// ============================================================================

/// Result of one transform invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<O> {
    /// Publish this item downstream
    Emit(O),
    /// Publish nothing for this input
    Skip,
    /// The transform is exhausted; stop the actor
    Done,
}

/// Per-item behavior: one input in, at most one output out.
pub trait Transform<I, O>: Send + 'static {
    fn apply(&mut self, input: Option<I>) -> Step<O>;
}

impl<I, O, F> Transform<I, O> for F
where
    F: FnMut(Option<I>) -> Step<O> + Send + 'static,
{
    fn apply(&mut self, input: Option<I>) -> Step<O> {
        self(input)
    }
}

/// Free-running behavior with full control of the actor's channels.
///
/// Implementations should check [`ActorContext::is_stopped`] (or rely on
/// [`ActorContext::recv`] / [`ActorContext::sleep`] returning early) once
/// per iteration.
#[async_trait]
pub trait Process<I: Item, O: Item>: Send + 'static {
    async fn run(&mut self, ctx: &mut ActorContext<I, O>);
}

/// The execution mode of an actor, fixed at construction.
pub enum Behavior<I: Item, O: Item> {
    FreeRunning(Box<dyn Process<I, O>>),
    PerItem(Box<dyn Transform<I, O>>),
}

impl<I: Item, O: Item> Behavior<I, O> {
    pub fn free_running(process: impl Process<I, O>) -> Self {
        Self::FreeRunning(Box::new(process))
    }

    pub fn per_item(transform: impl Transform<I, O>) -> Self {
        Self::PerItem(Box::new(transform))
    }

    fn mode(&self) -> &'static str {
        match self {
            Self::FreeRunning(_) => "free-running",
            Self::PerItem(_) => "per-item",
        }
    }
}

impl<I: Item, O: Item> fmt::Debug for Behavior<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mode())
    }
}

// ============================================================================
// Context
// ============================================================================

/// What a running actor sees of itself.
pub struct ActorContext<I: Item, O: Item> {
    name: String,
    input: Option<Subscription<I>>,
    output: Publisher<O>,
    stop: CancellationToken,
}

impl<I: Item, O: Item> ActorContext<I, O> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_input(&self) -> bool {
        self.input.is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Waits for the next input item.
    ///
    /// Returns `None` when the actor has no input, its upstream has
    /// closed, or the actor was asked to stop while waiting.
    pub async fn recv(&mut self) -> Option<I> {
        let input = self.input.as_mut()?;
        tokio::select! {
            _ = self.stop.cancelled() => None,
            item = input.recv() => item,
        }
    }

    /// Publishes an item to all subscribers, waiting while any of them is full.
    ///
    /// Returns how many subscribers received it; 0 if the actor was asked
    /// to stop while waiting.
    pub async fn emit(&self, item: O) -> usize {
        tokio::select! {
            _ = self.stop.cancelled() => 0,
            delivered = self.output.send(item) => delivered,
        }
    }

    /// Sleeps for `duration`, returning `false` if stopped meanwhile.
    pub async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

// ============================================================================
// Actor (not yet started)
// ============================================================================

/// An actor that has been built but not started.
pub struct Actor<I: Item, O: Item> {
    name: String,
    behavior: Behavior<I, O>,
    input: Option<Subscription<I>>,
    output: Publisher<O>,
    stop: CancellationToken,
    finished: CancellationToken,
    registry: ActorRegistry,
}

impl<I: Item, O: Item> Actor<I, O> {
    /// Builds an actor whose name must be unique among live actors.
    pub fn new(
        registry: &ActorRegistry,
        name: impl Into<String>,
        behavior: Behavior<I, O>,
    ) -> Result<Self, ActorError> {
        let name = name.into();
        let address = ChannelAddress::actor_output(&name);

        let output = registry
            .switchboard()
            .bind::<O>(address.clone())
            .map_err(|_| {
                warn!(actor = %name, address = %address, "Output address in use, actor not created");
                ActorError::AddressInUse {
                    name: name.clone(),
                    address,
                }
            })?;

        debug!(actor = %name, mode = behavior.mode(), "Actor created");

        Ok(Self {
            name,
            behavior,
            input: None,
            output,
            stop: CancellationToken::new(),
            finished: CancellationToken::new(),
            registry: registry.clone(),
        })
    }

    /// Builds an actor from a base name that may be reused; a unique
    /// suffix is appended.
    pub fn reusable(
        registry: &ActorRegistry,
        base_name: &str,
        behavior: Behavior<I, O>,
    ) -> Result<Self, ActorError> {
        let name = registry.unique_name(base_name);
        Self::new(registry, name, behavior)
    }

    /// Wires this actor's input to an upstream output address.
    pub fn with_upstream(mut self, upstream: &ChannelAddress) -> Result<Self, ActorError> {
        self.connect_input(upstream)?;
        Ok(self)
    }

    fn connect_input(&mut self, upstream: &ChannelAddress) -> Result<(), ActorError> {
        if self.input.is_some() {
            return Err(ActorError::AlreadyWired(self.name.clone()));
        }
        let subscription = self
            .registry
            .switchboard()
            .connect::<I>(upstream)
            .map_err(|source| ActorError::Wiring {
                name: self.name.clone(),
                source,
            })?;
        debug!(actor = %self.name, upstream = %upstream, "Input wired");
        self.input = Some(subscription);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_address(&self) -> &ChannelAddress {
        self.output.address()
    }

    /// Wires `other` to this actor's output and starts it.
    ///
    /// This actor itself is not started; items it publishes before being
    /// started cannot exist, so `other` sees everything.
    pub fn subscribe<P: Item>(&self, other: Actor<O, P>) -> Result<ActorHandle<P>, ActorError> {
        wire_and_start(self.output.address(), other)
    }

    /// Subscribes an external consumer to this actor's output.
    pub fn listen(&self) -> Result<Subscription<O>, ActorError> {
        listen_at(&self.registry, &self.name, self.output.address())
    }

    /// Starts the actor on its own task.
    pub fn start(self) -> ActorHandle<O> {
        let handle = ActorHandle {
            name: self.name.clone(),
            output_address: self.output.address().clone(),
            stop: self.stop.clone(),
            finished: self.finished.clone(),
            registry: self.registry.clone(),
            _output: PhantomData,
        };

        let registry = self.registry.clone();
        let name = self.name.clone();
        let id = registry.register(&name, self.stop.clone(), self.finished.clone());
        let task = tokio::spawn(self.run(id));
        registry.attach_task(&name, id, task);

        handle
    }

    async fn run(self, id: u64) {
        let Actor {
            name,
            behavior,
            input,
            output,
            stop,
            finished,
            registry,
        } = self;

        // Released on every exit path, including a panicking behavior.
        let _teardown = Teardown {
            name: name.clone(),
            id,
            registry,
            finished,
        };

        info!(actor = %name, mode = behavior.mode(), "Actor started");

        let mut ctx = ActorContext {
            name,
            input,
            output,
            stop,
        };

        match behavior {
            Behavior::FreeRunning(mut process) => process.run(&mut ctx).await,
            Behavior::PerItem(mut transform) => run_per_item(transform.as_mut(), &mut ctx).await,
        }

        info!(actor = %ctx.name, "Actor stopping");
        // ctx drops here: output address released, input closed
    }
}

async fn run_per_item<I: Item, O: Item>(
    transform: &mut dyn Transform<I, O>,
    ctx: &mut ActorContext<I, O>,
) {
    loop {
        if ctx.is_stopped() {
            break;
        }

        let input = if ctx.has_input() {
            match ctx.recv().await {
                Some(item) => Some(item),
                None => break,
            }
        } else {
            // Sources never block, give other tasks a turn
            tokio::task::yield_now().await;
            None
        };

        match transform.apply(input) {
            Step::Emit(item) => {
                ctx.emit(item).await;
            }
            Step::Skip => {}
            Step::Done => {
                debug!(actor = %ctx.name, "Transform exhausted");
                break;
            }
        }
    }
}

struct Teardown {
    name: String,
    id: u64,
    registry: ActorRegistry,
    finished: CancellationToken,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.registry.release(&self.name, self.id);
        self.finished.cancel();
    }
}

fn wire_and_start<O: Item, P: Item>(
    address: &ChannelAddress,
    mut other: Actor<O, P>,
) -> Result<ActorHandle<P>, ActorError> {
    other.connect_input(address)?;
    Ok(other.start())
}

fn listen_at<O: Item>(
    registry: &ActorRegistry,
    name: &str,
    address: &ChannelAddress,
) -> Result<Subscription<O>, ActorError> {
    registry
        .switchboard()
        .connect::<O>(address)
        .map_err(|source| ActorError::Wiring {
            name: name.to_string(),
            source,
        })
}

// ============================================================================
// Handle (running actor)
// ============================================================================

/// Handle to a started actor. Dropping it does not stop the actor.
#[derive(Clone)]
pub struct ActorHandle<O: Item> {
    name: String,
    output_address: ChannelAddress,
    stop: CancellationToken,
    finished: CancellationToken,
    registry: ActorRegistry,
    _output: PhantomData<fn() -> O>,
}

impl<O: Item> ActorHandle<O> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output_address(&self) -> &ChannelAddress {
        &self.output_address
    }

    /// Wires `other` to this actor's output and starts it, returning
    /// `other`'s handle so pipelines compose left to right.
    pub fn subscribe<P: Item>(&self, other: Actor<O, P>) -> Result<ActorHandle<P>, ActorError> {
        wire_and_start(&self.output_address, other)
    }

    /// Subscribes an external consumer to this actor's output.
    pub fn listen(&self) -> Result<Subscription<O>, ActorError> {
        listen_at(&self.registry, &self.name, &self.output_address)
    }

    /// Asks the actor to stop at its next check.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.finished.is_cancelled()
    }

    /// Waits until the actor has terminated and cleaned up.
    pub async fn join(&self) {
        self.finished.cancelled().await;
    }
}

impl<O: Item> fmt::Debug for ActorHandle<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorHandle")
            .field("name", &self.name)
            .field("output", &self.output_address)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages;
    use kasa_core::ActorConfig;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::timeout;

    fn registry() -> ActorRegistry {
        ActorRegistry::new(&ActorConfig::default())
    }

    fn times_ten() -> Behavior<u32, u32> {
        Behavior::per_item(|x: Option<u32>| match x {
            Some(x) => Step::Emit(x * 10),
            None => Step::Skip,
        })
    }

    #[tokio::test]
    async fn test_pipeline_preserves_order() {
        let registry = registry();
        let sink = Arc::new(Mutex::new(Vec::new()));

        let source = Actor::new(&registry, "numbers", stages::from_iter(1..=50u32)).unwrap();
        let scale = Actor::new(&registry, "scale", times_ten()).unwrap();
        let collect = Actor::new(&registry, "collect", stages::collect(Arc::clone(&sink))).unwrap();

        let tail = source.subscribe(scale).unwrap().subscribe(collect).unwrap();
        source.start();

        timeout(Duration::from_secs(5), tail.join())
            .await
            .expect("pipeline should drain and stop");

        let items = sink.lock().unwrap().clone();
        let expected: Vec<u32> = (1..=50).map(|x| x * 10).collect();
        assert_eq!(items, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_consumer_receives_every_item() {
        struct Slow(Arc<Mutex<Vec<u32>>>);

        #[async_trait]
        impl Process<u32, ()> for Slow {
            async fn run(&mut self, ctx: &mut ActorContext<u32, ()>) {
                while let Some(x) = ctx.recv().await {
                    self.0.lock().unwrap().push(x);
                    tokio::time::sleep(Duration::from_micros(200)).await;
                }
            }
        }

        // Far more items than any queue in the chain can hold
        let registry = ActorRegistry::new(&ActorConfig { channel_capacity: 16 });
        let sink = Arc::new(Mutex::new(Vec::new()));

        let source = Actor::new(&registry, "burst", stages::from_iter(0..400u32)).unwrap();
        let pass = Actor::new(&registry, "pass", stages::filter(|_: &u32| true)).unwrap();
        let slow = Actor::new(&registry, "slow", Behavior::free_running(Slow(Arc::clone(&sink)))).unwrap();

        let tail = source.subscribe(pass).unwrap().subscribe(slow).unwrap();
        source.start();

        timeout(Duration::from_secs(10), tail.join())
            .await
            .expect("slow consumer should drain the whole pipeline");

        let items = sink.lock().unwrap().clone();
        assert_eq!(items, (0..400).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_stop_interrupts_blocked_emit() {
        let registry = ActorRegistry::new(&ActorConfig { channel_capacity: 1 });
        let source = Actor::new(&registry, "endless", stages::from_iter(0u32..)).unwrap();
        // Held but never read, so the source fills the queue and blocks
        let _stalled = source.listen().unwrap();
        let handle = source.start();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.is_running());

        handle.stop();
        timeout(Duration::from_secs(1), handle.join())
            .await
            .expect("stop should interrupt a blocked emit");
    }

    #[tokio::test]
    async fn test_name_collision_fails_only_that_actor() {
        let registry = registry();
        let first = Actor::new(&registry, "producer", stages::from_iter(0..3u32)).unwrap();
        let second = Actor::new(&registry, "producer", stages::from_iter(0..3u32));

        let err = second.err().unwrap();
        assert_eq!(err.code(), ErrorCode::AddressInUse);

        // The first actor is unaffected
        let handle = first.start();
        timeout(Duration::from_secs(1), handle.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_reusable_names_do_not_collide() {
        let registry = registry();
        let a = Actor::reusable(&registry, "Echo", stages::echo::<u32>("a")).unwrap();
        let b = Actor::reusable(&registry, "Echo", stages::echo::<u32>("b")).unwrap();
        assert_ne!(a.name(), b.name());
        assert!(a.name().starts_with("Echo"));
        assert_ne!(a.output_address(), b.output_address());
    }

    #[tokio::test]
    async fn test_stop_interrupts_blocked_input_wait() {
        let registry = registry();
        // Upstream that never emits until stopped
        let idle = Actor::new(
            &registry,
            "idle",
            Behavior::per_item(|_: Option<()>| Step::<u32>::Skip),
        )
        .unwrap();
        let downstream = Actor::new(&registry, "waiting", times_ten()).unwrap();

        let idle_handle = idle.start();
        let down_handle = idle_handle.subscribe(downstream).unwrap();

        down_handle.stop();
        timeout(Duration::from_secs(1), down_handle.join())
            .await
            .expect("stop should interrupt the input wait");
        assert!(!down_handle.is_running());

        idle_handle.stop();
        timeout(Duration::from_secs(1), idle_handle.join()).await.unwrap();
    }

    #[tokio::test]
    async fn test_upstream_exit_closes_downstream() {
        let registry = registry();
        let source = Actor::new(&registry, "short", stages::from_iter(vec![1u32])).unwrap();
        let down = Actor::new(&registry, "follower", times_ten()).unwrap();

        let down_handle = source.subscribe(down).unwrap();
        source.start();

        timeout(Duration::from_secs(1), down_handle.join())
            .await
            .expect("downstream should stop when upstream closes");
        assert!(!registry.switchboard().is_bound(&ChannelAddress::actor_output("follower")));
    }

    #[tokio::test]
    async fn test_subscribe_to_finished_actor_fails() {
        let registry = registry();
        let source = Actor::new(&registry, "done-early", stages::from_iter(Vec::<u32>::new())).unwrap();
        let handle = source.start();
        handle.join().await;

        let late = Actor::new(&registry, "late", times_ten()).unwrap();
        let err = handle.subscribe(late).unwrap_err();
        assert!(matches!(
            err,
            ActorError::Wiring {
                source: SwitchboardError::NotBound(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_free_running_process() {
        struct Doubler;

        #[async_trait]
        impl Process<u32, u32> for Doubler {
            async fn run(&mut self, ctx: &mut ActorContext<u32, u32>) {
                while let Some(x) = ctx.recv().await {
                    ctx.emit(x * 2).await;
                    ctx.emit(x * 2 + 1).await;
                }
            }
        }

        let registry = registry();
        let sink = Arc::new(Mutex::new(Vec::new()));
        let source = Actor::new(&registry, "seed", stages::from_iter(vec![1u32, 5])).unwrap();
        let doubler = Actor::new(&registry, "doubler", Behavior::free_running(Doubler)).unwrap();
        let collect = Actor::new(&registry, "out", stages::collect(Arc::clone(&sink))).unwrap();

        let tail = source.subscribe(doubler).unwrap().subscribe(collect).unwrap();
        source.start();
        timeout(Duration::from_secs(1), tail.join()).await.unwrap();

        assert_eq!(*sink.lock().unwrap(), vec![2, 3, 10, 11]);
    }

    #[tokio::test]
    async fn test_double_wiring_rejected() {
        let registry = registry();
        let a = Actor::new(&registry, "a", stages::from_iter(0..1u32)).unwrap();
        let b = Actor::new(&registry, "b", stages::from_iter(0..1u32)).unwrap();
        let c = Actor::new(&registry, "c", times_ten())
            .unwrap()
            .with_upstream(a.output_address())
            .unwrap();

        let err = b.subscribe(c).unwrap_err();
        assert!(matches!(err, ActorError::AlreadyWired(name) if name == "c"));
    }
}
