//! # jobmill Scheduler
//!
//! Single logical actor on a polling loop. Each tick it:
//!
//! - promotes delayed jobs and pending retries whose time has come,
//! - fires recurring entries at their cron boundaries, guarded by a stored
//!   watermark so replicas never fire the same boundary twice,
//! - and, on a slower cadence, sends expired leases back through the retry
//!   path and sweeps exhausted failures past their retention window.

pub mod config;
pub mod scheduler;

pub use config::{MisfirePolicy, SchedulerConfig};
pub use scheduler::{Scheduler, TickReport};
