pub mod config;
pub mod error;
pub mod event;
pub mod reducer;
pub mod traits;
pub mod types;

pub use config::WorkflowConfig;
pub use error::{ConvoyError, Result};
pub use event::EventBus;
pub use reducer::merge;
pub use types::*;
