use anyhow::Result;
use faceforge_core::Config;
use std::path::Path;

pub mod config;
pub mod generate;
pub mod pull;
pub mod serve;

/// Load the file given with `--config`, or the default config file
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}
