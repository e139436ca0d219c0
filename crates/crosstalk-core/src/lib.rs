//! Shared foundation for the crosstalk gateway: config tree, raw config
//! file handling, the error taxonomy, and id newtypes.

pub mod conffile;
pub mod config;
pub mod error;
pub mod types;

pub use error::{GatewayError, Result};
