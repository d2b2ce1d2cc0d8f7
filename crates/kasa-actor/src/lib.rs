//! Kasa Actor - addressed channels and composable actors
//!
//! - `switchboard` - in-process addressed publish/subscribe channels
//! - `actor` - actors with an optional input and one output, running either
//!   a free-running loop or a per-item transform
//! - `registry` - explicit registry of live actors (enumerate, stop, join)
//! - `stages` - small reusable pipeline stages
//!
//! # Pipelines
//!
//! ```text
//! ┌──────────┐  inproc://source/out  ┌──────────┐  inproc://scale/out  ┌──────────┐
//! │  source  │──────────────────────▶│  scale   │─────────────────────▶│  print   │
//! └──────────┘                        └──────────┘                      └──────────┘
//! ```
//!
//! ```no_run
//! use kasa_actor::{stages, Actor, ActorRegistry, Behavior, Step};
//! use kasa_core::ActorConfig;
//!
//! # async fn demo() -> Result<(), kasa_actor::ActorError> {
//! let registry = ActorRegistry::new(&ActorConfig::default());
//!
//! let source = Actor::new(&registry, "source", stages::from_iter(1..=3))?;
//! let scale = Actor::new(&registry, "scale", Behavior::per_item(|x: Option<i32>| match x {
//!     Some(x) => Step::Emit(x * 10),
//!     None => Step::Skip,
//! }))?;
//! let print = Actor::reusable(&registry, stages::ECHO, stages::echo::<i32>("got"))?;
//!
//! let tail = source.subscribe(scale)?.subscribe(print)?;
//! source.start();
//! tail.join().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Lock poisoning is recovered, channel closure ends the owning actor

pub mod actor;
pub mod registry;
pub mod stages;
pub mod switchboard;

pub use actor::{Actor, ActorContext, ActorError, ActorHandle, Behavior, Process, Step, Transform};
pub use registry::ActorRegistry;
pub use switchboard::{Item, Publisher, Subscription, Switchboard, SwitchboardError};
