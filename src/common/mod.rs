//! Common utilities and types shared across tablecoord

pub mod config;
pub mod error;
pub mod logging;
pub mod utils;

pub use config::CoordinatorSettings;
pub use error::{Error, Result};
pub use logging::init_tracing;
pub use utils::{crc32, interruptible, nap};
