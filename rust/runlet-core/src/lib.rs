//! Runlet core: procedure store, sandboxed script engine and live cron
//! scheduler.
//!
//! ```text
//! HTTP request / cron tick
//!         │
//!         ▼
//!   ┌───────────┐   globals, crons   ┌─────────┐
//!   │  Sandbox  │ ─────────────────▶ │  Store  │
//!   └───────────┘                    └─────────┘
//!         ▲                               │ reload signal
//!         │ job                           ▼
//!   ┌──────────────────────────────────────────┐
//!   │               CronScheduler              │
//!   └──────────────────────────────────────────┘
//! ```

pub mod sandbox;
pub mod scheduler;
pub mod store;

pub use sandbox::{
    CapabilityConfig, ExecutionError, ExecutionResult, NetworkCapability, RequestContext, Sandbox,
};
pub use scheduler::{CronParser, CronScheduler, SchedulerState};
pub use store::{CronDefinition, Procedure, SearchResult, Store, StoreError, StoreResult};
