pub mod activity_index;
pub mod config;
pub mod device_profile;
pub mod error;
pub mod error_codes;
pub mod fit_summary;
pub mod input_validation;
pub mod logging;
pub mod notifier;
pub mod path_validation;
pub mod stores;
pub mod system_integration;
pub mod transfer_engine;
pub mod watcher;
pub mod worker;

pub use config::{AppPaths, RunMode, Settings};
pub use error::{WorkerError, WorkerResult};
pub use worker::{
    RunRequest, RunResult, RunStatus, SelectionReply, WorkerDeps, WorkerHandle, WorkerLauncher, WorkerMessage,
};

#[cfg(test)]
mod lib_tests;
