//! Registry of live actors.
//!
//! Owns the [`Switchboard`] actors publish on and tracks every started
//! actor by name, so a process can list, stop, and join its actors
//! without holding their handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use kasa_core::ActorConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::switchboard::Switchboard;

struct ActorEntry {
    id: u64,
    stop: CancellationToken,
    finished: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    switchboard: Switchboard,
    actors: Mutex<HashMap<String, ActorEntry>>,
    suffix: AtomicU64,
    next_id: AtomicU64,
}

/// Shared registry of actors. Cheap to clone.
#[derive(Clone)]
pub struct ActorRegistry {
    inner: Arc<Inner>,
}

impl ActorRegistry {
    pub fn new(config: &ActorConfig) -> Self {
        Self::with_switchboard(Switchboard::new(config.channel_capacity))
    }

    pub fn with_switchboard(switchboard: Switchboard) -> Self {
        Self {
            inner: Arc::new(Inner {
                switchboard,
                actors: Mutex::new(HashMap::new()),
                suffix: AtomicU64::new(0),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn switchboard(&self) -> &Switchboard {
        &self.inner.switchboard
    }

    fn actors(&self) -> MutexGuard<'_, HashMap<String, ActorEntry>> {
        self.inner
            .actors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns `base` with a process-unique numeric suffix.
    pub fn unique_name(&self, base: &str) -> String {
        let n = self.inner.suffix.fetch_add(1, Ordering::Relaxed);
        format!("{base}-{n}")
    }

    /// Records a starting actor; the returned id scopes later updates to
    /// this incarnation of the name.
    pub(crate) fn register(
        &self,
        name: &str,
        stop: CancellationToken,
        finished: CancellationToken,
    ) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.actors().insert(
            name.to_string(),
            ActorEntry {
                id,
                stop,
                finished,
                task: None,
            },
        );
        debug!(actor = %name, "Actor registered");
        id
    }

    pub(crate) fn attach_task(&self, name: &str, id: u64, task: JoinHandle<()>) {
        // The actor may already have finished and released its entry.
        if let Some(entry) = self.actors().get_mut(name).filter(|e| e.id == id) {
            entry.task = Some(task);
        }
    }

    pub(crate) fn release(&self, name: &str, id: u64) {
        let mut actors = self.actors();
        if actors.get(name).is_some_and(|e| e.id == id) {
            actors.remove(name);
            debug!(actor = %name, "Actor released");
        }
    }

    /// Names of live actors, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.actors().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.actors().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.actors().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors().is_empty()
    }

    /// Asks one actor to stop. Returns false if no such actor is live.
    pub fn stop(&self, name: &str) -> bool {
        match self.actors().get(name) {
            Some(entry) => {
                entry.stop.cancel();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let actors = self.actors();
        info!(count = actors.len(), "Stopping all actors");
        for entry in actors.values() {
            entry.stop.cancel();
        }
    }

    /// Waits for every currently live actor to finish.
    pub async fn join_all(&self) {
        let pending: Vec<(CancellationToken, Option<JoinHandle<()>>)> = self
            .actors()
            .values_mut()
            .map(|entry| (entry.finished.clone(), entry.task.take()))
            .collect();

        for (finished, task) in pending {
            match task {
                Some(task) => {
                    // A panicked actor still counts as finished
                    let _ = task.await;
                }
                None => finished.cancelled().await,
            }
        }
    }
}

impl Default for ActorRegistry {
    fn default() -> Self {
        Self::new(&ActorConfig::default())
    }
}
