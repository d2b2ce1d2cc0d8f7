//! Small reusable pipeline stages.
//!
//! The name constants are meant for [`Actor::reusable`](crate::Actor::reusable),
//! since a pipeline usually holds more than one of each.

use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::actor::{ActorContext, Behavior, Process, Step};
use crate::switchboard::Item;

pub const ECHO: &str = "Echo";
pub const FILTER: &str = "Filter";
pub const FILTER_BOOL: &str = "FilterBool";
pub const READ_EVERY: &str = "ReadEvery";
pub const COLLECT: &str = "Collect";

/// Logs every item under `label` and passes it through unchanged.
pub fn echo<T: Item + Debug>(label: impl Into<String>) -> Behavior<T, T> {
    let label = label.into();
    Behavior::per_item(move |item: Option<T>| match item {
        Some(item) => {
            info!(label = %label, item = ?item, "Echo");
            Step::Emit(item)
        }
        None => Step::Skip,
    })
}

/// Passes items for which `predicate` holds.
pub fn filter<T, F>(mut predicate: F) -> Behavior<T, T>
where
    T: Item,
    F: FnMut(&T) -> bool + Send + 'static,
{
    Behavior::per_item(move |item: Option<T>| match item {
        Some(item) if predicate(&item) => Step::Emit(item),
        _ => Step::Skip,
    })
}

/// Maps every item to whether `predicate` holds for it.
pub fn filter_bool<T, F>(mut predicate: F) -> Behavior<T, bool>
where
    T: Item,
    F: FnMut(&T) -> bool + Send + 'static,
{
    Behavior::per_item(move |item: Option<T>| match item {
        Some(item) => Step::Emit(predicate(&item)),
        None => Step::Skip,
    })
}

/// A source emitting every item of `items`, then stopping.
pub fn from_iter<T, It>(items: It) -> Behavior<(), T>
where
    T: Item,
    It: IntoIterator<Item = T>,
    It::IntoIter: Send + 'static,
{
    let mut items = items.into_iter();
    Behavior::per_item(move |_: Option<()>| match items.next() {
        Some(item) => Step::Emit(item),
        None => Step::Done,
    })
}

/// A sink appending every item to `sink`.
pub fn collect<T: Item>(sink: Arc<Mutex<Vec<T>>>) -> Behavior<T, ()> {
    Behavior::per_item(move |item: Option<T>| {
        if let Some(item) = item {
            sink.lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(item);
        }
        Step::Skip
    })
}

/// Samples a readable source at a fixed period.
///
/// Each tick calls the reader; `Some` is published, `None` is skipped.
/// Runs until stopped.
pub struct ReadEvery<F> {
    period: Duration,
    reader: F,
}

impl<F> ReadEvery<F> {
    pub fn new(period: Duration, reader: F) -> Self {
        Self { period, reader }
    }
}

#[async_trait]
impl<O, F> Process<(), O> for ReadEvery<F>
where
    O: Item,
    F: FnMut() -> Option<O> + Send + 'static,
{
    async fn run(&mut self, ctx: &mut ActorContext<(), O>) {
        debug!(actor = %ctx.name(), period_ms = self.period.as_millis() as u64, "Sampling");
        while !ctx.is_stopped() {
            if let Some(value) = (self.reader)() {
                ctx.emit(value).await;
            }
            if !ctx.sleep(self.period).await {
                break;
            }
        }
    }
}

/// Convenience constructor for a [`ReadEvery`] behavior.
pub fn read_every<O, F>(period: Duration, reader: F) -> Behavior<(), O>
where
    O: Item,
    F: FnMut() -> Option<O> + Send + 'static,
{
    Behavior::free_running(ReadEvery::new(period, reader))
}
