//! Configuration storage for the gray gateway.
//!
//! Holds the active configuration generation. Writers are the gRPC config
//! API and the startup file load; readers are in-flight requests.

mod config_store;

pub use config_store::{ConfigStore, Generation};
