//! unitd - unit orchestration engine for a minimal init
//!
//! Starts units in dependency order, supervises their processes and
//! restarts them by policy, and runs units on timers and filesystem events.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                     unitd                        │
//! ├──────────────────────────────────────────────────┤
//! │  Unit Loader  │  Orchestrator  │  Command layer  │
//! ├──────────────────────────────────────────────────┤
//! │ Supervisor │ Timer engine │ Path watcher         │
//! ├──────────────────────────────────────────────────┤
//! │           Exit watcher (pid1::reaper)            │
//! └──────────────────────────────────────────────────┘
//! ```

pub mod manager;
pub mod pid1;
pub mod protocol;
pub mod units;

pub use manager::{Manager, ManagerConfig, ManagerError};
pub use units::{UnitDef, UnitKind};
