pub mod artifact;
pub mod config;
pub mod credentials;
pub mod device;
pub mod environment;
pub mod error;
pub mod executor;
pub mod log_scrub;
pub mod logging;
pub mod planner;
pub mod profile;
pub mod provision;
pub mod version;
pub mod workspace;

pub use error::{Error, Result};
