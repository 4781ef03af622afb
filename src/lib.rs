pub mod config;
pub mod db;
pub mod error;
pub mod legacy;
pub mod logging;
pub mod migrate;
pub mod startup;
pub mod threads;
pub mod time;

pub use error::{AppError, AppResult};
pub use logging::init_logging;
