pub mod config;
pub mod error;
pub mod types;

pub use config::RainbowConfig;
pub use error::{RainbowError, Result};
pub use types::{AiId, SessionId, UserId};
