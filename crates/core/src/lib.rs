//! faceforge_core - Core library for the inference service
//!
//! This crate provides:
//! - Service configuration (TOML, with defaults for every setting)
//! - HuggingFace file downloads into a local model store
//! - Remote image fetching for inference requests

pub mod config;
pub mod downloaders;
pub mod fetch;

pub use config::Config;
pub use fetch::{FetchError, HttpImageSource, ImageSource};
