//! faceforge_daemon - HTTP inference server
//!
//! This crate provides the server that:
//! - Loads the diffusion pipeline and face analysis models at startup
//! - Exposes the `/ping` health check and the `/invocations` endpoint
//! - Turns each invocation into a generated, base64-encoded JPEG

pub mod api;
pub mod error;
pub mod generator;
pub mod loader;
pub mod server;
pub mod state;

pub use generator::{GenerateError, GenerationInputs, ImageGenerator};
pub use loader::load_models;
pub use server::{router, run_server};
pub use state::AppState;
