// Witness Engine - Core module structure
pub mod api;
pub mod cli;
pub mod config;
pub mod firmware;
pub mod storage;
pub mod updater;

pub use config::Config;
pub use storage::SlotPersistence;
pub use updater::Updater;
