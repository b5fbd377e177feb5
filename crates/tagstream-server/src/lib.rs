//! TagStream Server
//!
//! HTTP front end for the classification engine: job control, item and
//! feed ingestion, and clue inspection.

pub mod auth;
pub mod cli;
pub mod config;
pub mod routes;
pub mod state;
pub mod xml;

pub use cli::Cli;
pub use config::ServerConfig;
pub use routes::create_router;
pub use state::{AppContext, AppState};
