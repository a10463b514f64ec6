// Client-side chat synchronization for the job board
pub mod aggregator;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod pins;
pub mod poll;
pub mod read_state;
pub mod remote;
pub mod services;
pub mod timeline;

// Re-export main types for convenience
pub use engine::{ChatEngine, EngineOptions, Outgoing};
pub use error::{Result, SyncError};
pub use events::SyncEvent;
pub use models::*;
pub use remote::{HttpRemote, InMemoryRemote, RemoteApi, RemoteError};
