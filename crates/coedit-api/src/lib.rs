//! coedit-api - HTTP and WebSocket surface for coedit

pub mod config;
pub mod error;
pub mod identity;
pub mod routes;
pub mod ws;

pub use config::{AppConfig, ConfigError};
pub use error::AppError;
pub use routes::{app_router, AppState};
