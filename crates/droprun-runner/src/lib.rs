//! droprun execution engine.
//!
//! Runs checkout tasks as independent state machines, one [`TaskRunner`] per
//! run, supervised by a [`TaskManager`]. Site-specific behavior is supplied by
//! [`SiteDriver`] implementations looked up by platform.

pub mod config;
pub mod context;
pub mod driver;
pub mod handoff;
pub mod manager;
pub mod metrics;
pub mod notify;
pub mod output;
pub mod proxy;
pub mod runner;
pub mod session;
pub mod store;

pub use config::RunnerConfig;
pub use context::{RunContext, ABORTED_REASON};
pub use driver::{
    Availability, Challenge, CheckoutOutcome, DriverError, DriverRegistry, SimulatedDriver,
    SiteDriver,
};
pub use handoff::{AsyncHandoffQueue, HandoffError, HandoffRequest};
pub use manager::{ManagerError, TaskManager};
pub use metrics::collect_metrics;
pub use notify::{NotificationSink, TracingSink};
pub use proxy::ProxyPool;
pub use runner::{RunOutcome, RunnerCommand, RunnerHandle, StopKind, TaskRunner};
pub use session::{Session, SessionError};
pub use store::{JsonFileStore, MemoryStore, StoreError, TaskStore};
