pub mod commands;
pub mod config;
pub mod datasource;
pub mod error;
pub mod host;
pub mod plugin;
pub mod propagation;
pub mod rpc;

pub use error::{PluginError, Result};
