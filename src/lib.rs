//! Database backup orchestration: dumps a database through external tools,
//! streams the dump through processors into storage, and restores or deletes
//! stored backups, with background watchers for planned, failed and
//! cancelled tasks.

// dbvault/src/lib.rs
pub mod backup;
pub mod config;
pub mod entities;
pub mod errors;
pub mod processor;
pub mod storage;
pub mod store;
pub mod stream;
pub mod tasks;
pub mod telemetry;
pub mod watchers;
