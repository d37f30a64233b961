//! Pingora hosting for the gray rollout engine.
//!
//! The gateway takes a configuration snapshot per request, applies the
//! request and response plans to Pingora's headers and buffers page bodies
//! that need injection or fallback replacement.

mod gateway;
mod upstream;

pub use gateway::{request_signals, Downstream, GatewayCtx, GatewayProxy};
pub use upstream::{parse_backend_address, Upstream};
