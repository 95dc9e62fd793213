pub mod config;
pub mod conversation;
pub mod decoder;
pub mod directory;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod retry;
pub mod transport;

pub use error::{Result, VedaError};
