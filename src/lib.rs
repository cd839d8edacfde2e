//! tsm - game server supervisor
//!
//! Runs one game server executable and makes sure anything that needs the
//! server offline happens under a single lock with a clean stop/start:
//! - Launches the server in its own process group and stops it with SIGTERM
//! - Serializes restart, backup, restore and update behind one gate
//! - Takes an automatic backup every night at local midnight
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              tsmd (control socket)               │
//! ├─────────────────────────────────────────────────┤
//! │   Operations (exclusive lock)  │  Scheduler      │
//! ├─────────────────────────────────────────────────┤
//! │  Supervisor + Launcher  │  Backup store/archive  │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod backup;
pub mod config;
pub mod logging;
pub mod operations;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod supervisor;

pub use backup::{BackupRecord, BackupStore, SaveTarget};
pub use operations::{ExclusiveLock, OperationError, Operations};
pub use scheduler::AutoBackupScheduler;
pub use supervisor::{ProcessSupervisor, SupervisorError};
