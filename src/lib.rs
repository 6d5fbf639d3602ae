//! # Stream Spy
//!
//! Runtime instrumentation for push-based reactive streams: every
//! subscribe, next, error, complete and unsubscribe passes through a
//! [`Session`] that dispatches it to an ordered list of plugins.
//!
//! ## Core Concepts
//!
//! - **Session**: interception context; advances a logical tick per event
//! - **Graph**: sink/source/flattening topology rebuilt from event order
//! - **Snapshots**: immutable, serializable copies of the live graph
//! - **Queries**: predicate expressions evaluated against snapshot records
//! - **Decks**: pausable buffers spliced into matching subscriptions
//!
//! ## Example
//!
//! ```ignore
//! use streamspy::{Notification, Observable, QueryRequest, Session, SpyConfig};
//! use serde_json::json;
//!
//! let session = Session::new(SpyConfig::default());
//!
//! let people = Observable::of(vec![json!("ada"), json!("grace")]).with_tag("people");
//! let subscription = session.subscribe(&people.map(|v| v), |n: Notification| println!("{n:?}"));
//!
//! // Pause anything tagged "people" and step through its values
//! let deck = session.pause("people");
//! deck.step();
//!
//! // Find incomplete streams, most recently active first
//! session.query(QueryRequest::new("incomplete").order_by("age asc"))?;
//! ```

pub mod auditor;
pub mod config;
pub mod deck;
pub mod error;
pub mod events;
pub mod graph;
pub mod identity;
pub mod logger;
pub mod plugins;
pub mod query;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod stream;
pub mod types;

// Re-exports
pub use auditor::Auditor;
pub use config::{Retention, SpyConfig};
pub use deck::{Deck, DeckStats, PausePlugin};
pub use error::{Result, SpyError};
pub use events::{DropReason, EventFilter, EventsHandle, EventsPlugin, ListenerId, SpyEvent};
pub use graph::{GraphPlugin, GraphRecord};
pub use identity::Match;
pub use logger::{LogLevel, LogLine, Logger, MemoryLogger, TracingLogger};
pub use plugins::{
    BufferPlugin, CachingResolver, CyclePlugin, LogPlugin, Plugin, PluginId, StackResolver,
    StackTracePlugin, StatsPlugin, SubscriptionStats, SweepPlugin,
};
pub use query::{QValue, QueryMatch, QueryRecord, QueryRequest, QueryResult};
pub use scheduler::{ManualScheduler, Scheduler, ThreadScheduler, TimerId};
pub use session::relay::{Emit, Stage, Transform};
pub use session::{install, installed, Event, Session, WeakSession};
pub use snapshot::{
    ObservableSnapshot, Snapshot, SnapshotDiff, SnapshotOptions, SnapshotPlugin,
    SubscriberSnapshot, SubscriptionSnapshot,
};
pub use stream::{Observable, Observer, Subject, Subscriber, Subscription, SubscriptionRef, Teardown};
pub use types::*;
