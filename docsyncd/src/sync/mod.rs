pub mod backoff;
pub mod config;
pub mod conflict;
pub mod disk_fs;
pub mod engine;
pub mod error;
pub mod filters;
pub mod fingerprint;
mod lifecycle;
pub mod local_detector;
pub mod local_fs;
pub mod local_watcher;
pub mod operation;
pub mod paths;
pub mod processor;
pub mod reconciler;
pub mod remote;
pub mod remote_detector;
pub mod scanner;
pub mod store;

#[cfg(test)]
mod testing;
