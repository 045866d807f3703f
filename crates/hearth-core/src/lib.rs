pub mod chain;
pub mod config;
pub mod error;
pub mod event;
pub mod permissions;
pub mod record;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{ErrorKind, HearthError, Result};
pub use event::EventBus;
pub use types::*;
