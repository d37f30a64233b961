//! Gray (canary) rollout engine for versioned front-end applications,
//! hosted in a Pingora reverse proxy.
//!
//! Requests are assigned a deployment version by condition rules or by a
//! deterministic weighted split, kept on that version through a sticky
//! cookie, and have their resource paths rewritten to the version's
//! assets. Page responses can carry injected HTML fragments and missing
//! pages can be replaced by fallback content.

pub mod config;
pub mod error;
pub mod gray;
pub mod grpc;
pub mod health;
pub mod proxy;
pub mod store;

/// Generated types for the `gray.v1` configuration API.
pub mod gray_api {
    tonic::include_proto!("gray.v1");
}
