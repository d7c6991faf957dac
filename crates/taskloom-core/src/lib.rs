pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;
pub mod workflow;

pub use config::AppConfig;
pub use error::{LoomError, Result};
pub use event::EventBus;
pub use traits::{FnProcessor, TaskProcessor};
pub use types::*;
pub use workflow::*;
