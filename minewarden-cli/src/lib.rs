pub mod commands;
pub mod config;
pub mod engine;
pub mod status_file;
pub mod watch;

// Re-export commonly used types
pub use config::{load_config, load_wallet, FileConfig};
pub use engine::EngineMode;
