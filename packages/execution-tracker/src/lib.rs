// Execution Tracker
//
// Keeps one consistent, monotonic view of a remote scraping execution by
// reconciling a push event channel with periodically fetched snapshots.
// The view is owned by a single-writer runtime loop per execution and
// published to observers as immutable copies.

pub mod backoff;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod publisher;
pub mod reconciler;
pub mod runtime;
pub mod snapshot;
pub mod tracker;
pub mod types;
pub mod view;

pub use channel::{ChannelSignal, EventTransport, NatsTransport, TestTransport};
pub use config::TrackerConfig;
pub use error::TrackerError;
pub use events::{CompletionSummary, EventKind, ExecutionEvent};
pub use publisher::{SubscriptionId, ViewPublisher, ViewSubscription};
pub use reconciler::{Admission, Reconciler};
pub use snapshot::{ExecutionSnapshot, SnapshotError, SnapshotSource, TestSnapshotSource};
pub use tracker::{ExecutionLauncher, ExecutionTracker, TrackerHandle};
pub use types::*;
pub use view::ExecutionView;
