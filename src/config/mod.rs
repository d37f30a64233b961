//! Gray rollout configuration.
//!
//! The JSON document is parsed into [`document::ConfigDocument`] and then
//! validated into an immutable [`GrayConfig`] registry that is shared by
//! reference across all requests of one configuration generation.

pub mod document;
mod registry;

pub use registry::{
    Condition, Deployment, GrayConfig, Injection, Operator, Rewrite, RouteTemplate,
    SelectionMode, WeightedPool, VERSION_PLACEHOLDER,
};
