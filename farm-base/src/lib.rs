mod config;
mod error;
mod gaddr;
mod status;

pub use config::{Config, ConfigBuilder, LogLevel};
pub use error::{err, Error, Result};
pub use gaddr::{GAddr, WorkerId, COORDINATOR_WID};
pub use status::Status;
