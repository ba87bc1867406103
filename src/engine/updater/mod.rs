//! Firmware Self-Update
//!
//! A log-anchored, rollback-protected update pipeline.
//!
//! Components:
//! - `fetch` - Follows the firmware log for new releases
//! - `http` - HTTP transport to the log
//! - `orchestrator` - Compare, fetch, verify, install, reboot
//! - `local` - Directory-backed installer
//! - `state` - Per-component update state
//! - `scheduler` - Periodic update loop

pub mod error;
pub mod fetch;
pub mod http;
pub mod local;
pub mod orchestrator;
pub mod scheduler;
pub mod state;

pub use error::{InstallError, UpdateError};
pub use fetch::{LogClient, UpdateFetcher};
pub use http::HttpLogClient;
pub use local::DirectoryInstaller;
pub use orchestrator::{Local, Remote, Stage, TrackOutcome, UpdateReport, Updater, Versions};
pub use scheduler::run_update_loop;
pub use state::{TrackState, UpdateState};
