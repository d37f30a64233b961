//! Per-request gray routing: identity, selection, rewriting, and the
//! response-side transforms.

pub mod decision;
pub mod fallback;
pub mod headers;
pub mod identity;
pub mod inject;
pub mod matcher;
pub mod rewrite;
pub mod weighted;

pub use decision::{
    finish_body, plan_request, plan_response, BodyAction, Decision, RequestPlan, ResponsePlan,
};
pub use fallback::{
    run_fallback, ContentFetcher, FallbackRequest, FallbackResolution, FallbackState,
    HyperFetcher, FALLBACK_TIMEOUT,
};
pub use headers::{apply_mutations, HeaderBag, HeaderMutation, HeaderSink};
pub use identity::{ClientIdentity, RequestSignals, StickyAssignment, STICKY_COOKIE, VERSION_HEADER};
