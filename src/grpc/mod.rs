//! gRPC server for configuration management.
//!
//! Provides the GrayConfigService server that receives gray rollout
//! configuration pushes from the control plane.

mod config_service;

pub use config_service::GrayConfigServiceImpl;
