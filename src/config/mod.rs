//! Configuration module.
//!
//! Provides `AppConfig` (top-level settings), sub-configs for the server,
//! the upload transport and the audio devices, `AppPaths` for the
//! cross-platform settings location, and TOML persistence via
//! `AppConfig::load` / `AppConfig::save`.  `Args` is the command line.

pub mod args;
pub mod paths;
pub mod settings;

pub use args::{Args, Command};
pub use paths::AppPaths;
pub use settings::{
    AppConfig, AudioConfig, ConfigError, ServerConfig, UploadConfig, TOKEN_ENV_VAR,
};
