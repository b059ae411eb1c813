pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{GantryError, Result};
pub use event::{EngineEvent, EventBus};
pub use types::*;
