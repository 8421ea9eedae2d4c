//! # jobmill Dashboard
//!
//! Read-only queries over storage plus the operator actions `requeue`,
//! `delete`, `trigger` and `remove`, which run through the same state
//! machine transitions as the engine's own. [`routes::create_router`]
//! exposes all of it as JSON over HTTP.

pub mod dashboard;
pub mod error;
pub mod routes;
pub mod server;

pub use dashboard::{Dashboard, DashboardStats, JobPage, RecurringSummary, SubmitRequest};
pub use error::DashboardError;
pub use routes::create_router;
pub use server::{DashboardConfig, DashboardServer};
