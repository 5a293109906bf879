//! droprun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Async runtime
//! - Storage backends
//!
//! All types here describe what a task is, what state a run is in, and what
//! a run reports back to its supervisor.

pub mod checkout;
pub mod error;
pub mod event;
pub mod history;
pub mod ids;
pub mod proxy;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use checkout::{CheckoutSummary, OrderInfo, ProductInfo};
pub use error::CoreError;
pub use event::{StatusEvent, StatusEventType};
pub use history::HistoryBuffer;
pub use ids::{EventId, RunId, TaskId};
pub use proxy::Proxy;
pub use status::{HarvestState, RequestStatus, TaskState};
pub use task::{ProductSelector, SiteDescriptor, Task, TaskRecord};
