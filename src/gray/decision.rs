//! Per-request decision and the header plans derived from it.
//!
//! [`plan_request`] runs in the request-header phase and produces a typed
//! [`Decision`] plus the request mutations. [`plan_response`] runs in the
//! response-header phase against that decision. [`finish_body`] produces
//! the final body once it is fully buffered.

use std::sync::Arc;

use hyper::body::Bytes;

use super::fallback::{FallbackRequest, FallbackState};
use super::headers::HeaderMutation;
use super::identity::{ClientIdentity, RequestSignals, StickyAssignment, VERSION_HEADER};
use super::inject::inject;
use super::matcher::{select_by_rules, RuleInput};
use super::rewrite::{is_page_request, rewrite_path};
use super::weighted::select_weighted;
use crate::config::{Deployment, GrayConfig, Injection, SelectionMode};

/// Typed state of one request, from request headers to response completion.
#[derive(Debug, Clone)]
pub struct Decision {
    pub identity: ClientIdentity,
    pub deployment: Arc<Deployment>,
    pub is_page: bool,
    pub not_found: bool,
}

impl Decision {
    pub fn version(&self) -> &str {
        &self.deployment.version
    }

    pub fn sticky_assignment(&self) -> StickyAssignment {
        StickyAssignment {
            version: self.deployment.version.clone(),
            client_id: self.identity.client_id.clone(),
        }
    }
}

/// Output of the request-header phase.
#[derive(Debug, Clone)]
pub struct RequestPlan {
    pub decision: Decision,
    pub mutations: Vec<HeaderMutation>,
}

impl RequestPlan {
    /// The rewritten request target, if any.
    pub fn rewritten_path(&self) -> Option<&str> {
        self.mutations.iter().find_map(|m| match m {
            HeaderMutation::Set(name, value) if name == ":path" => Some(value.as_str()),
            _ => None,
        })
    }
}

/// What to do with the response body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum BodyAction {
    #[default]
    PassThrough,
    /// Buffer the page and inject fragments.
    Inject,
    /// Hold the response and replace the body with fallback content.
    Fallback(FallbackRequest),
}

impl BodyAction {
    pub fn buffers(&self) -> bool {
        !matches!(self, Self::PassThrough)
    }
}

/// Output of the response-header phase.
#[derive(Debug, Clone)]
pub struct ResponsePlan {
    pub mutations: Vec<HeaderMutation>,
    pub body: BodyAction,
}

/// Chooses the deployment for a request.
///
/// Page requests run rule or weighted selection. Sub-resource requests
/// reuse the version their page load recorded in the sticky cookie while
/// that version is registered; otherwise they select as a page would.
/// The cookie is client-controlled, so an unregistered version never
/// reaches a path template. Returns `None` only when gray routing is
/// disabled.
pub fn select_deployment(
    config: &GrayConfig,
    identity: &ClientIdentity,
    signals: &RequestSignals,
    is_page: bool,
) -> Option<Arc<Deployment>> {
    if !is_page {
        if let Some(previous) = &identity.previous {
            if let Some(deployment) = config.find_version(&previous.version) {
                return Some(deployment.clone());
            }
            tracing::debug!(version = %previous.version, "unregistered sticky version ignored");
        }
    }

    match config.mode() {
        SelectionMode::Disabled => None,
        SelectionMode::Rules { base } => {
            let cookies = signals.cookie();
            let input = RuleInput {
                gray_key: &config.gray_key,
                gray_value: &identity.gray_value,
                cookies: &cookies,
                headers: &signals.headers,
            };
            Some(select_by_rules(config, base, &input))
        }
        SelectionMode::Weighted { pool } => Some(select_weighted(
            config,
            pool,
            identity.previous.as_ref(),
            &identity.client_id,
        )),
    }
}

/// Request-header phase. Returns `None` when gray routing is disabled and
/// the request must pass through untouched.
pub fn plan_request(config: &GrayConfig, signals: &RequestSignals) -> Option<RequestPlan> {
    if !config.is_enabled() {
        return None;
    }

    // Must be settled before any header mutation is produced.
    let has_rewrite = config.rewrite.has_path_rules();

    let is_page = is_page_request(signals.fetch_mode(), &signals.path);
    let identity = ClientIdentity::resolve(config, signals);
    let deployment = select_deployment(config, &identity, signals, is_page)?;

    // Compressed bodies cannot be injected into.
    let mut mutations = vec![HeaderMutation::remove("accept-encoding")];
    // Only a request without a body may lose its framing.
    if !signals.has_body() {
        mutations.push(HeaderMutation::remove("content-length"));
    }
    mutations.push(HeaderMutation::set(VERSION_HEADER, deployment.version.as_str()));

    if !config.rewrite.host.is_empty() {
        mutations.push(HeaderMutation::set("host", config.rewrite.host.as_str()));
    }

    if has_rewrite {
        if let Some(path) = rewrite_path(
            &config.rewrite,
            &signals.path,
            &deployment.version,
            is_page,
            config.versions(),
        ) {
            tracing::debug!(from = %signals.path, to = %path, "rewrite path");
            mutations.push(HeaderMutation::set(":path", path));
        }
    }

    tracing::debug!(
        version = %deployment.version,
        backend = deployment.backend_version_or_empty(),
        page = is_page,
        client = %identity.client_id,
        previous = ?identity.previous,
        "gray decision"
    );

    Some(RequestPlan {
        decision: Decision {
            identity,
            deployment,
            is_page,
            not_found: false,
        },
        mutations,
    })
}

/// Response-header phase.
///
/// Only a `200` gets cookies and injection. A `404` page with a fallback
/// configured is turned into a held `200 text/html` response; any other
/// status passes through.
pub fn plan_response(
    config: &GrayConfig,
    decision: &mut Decision,
    status: u16,
    content_type: &str,
) -> ResponsePlan {
    let mut mutations = Vec::new();

    if !config.rewrite.host.is_empty() {
        // Object stores often mark files as attachments.
        mutations.push(HeaderMutation::remove("content-disposition"));
    }

    if status != 200 {
        if status == 404 && decision.is_page {
            if let Some(request) = FallbackRequest::for_version(&config.rewrite, decision.version()) {
                decision.not_found = true;
                mutations.push(HeaderMutation::set(":status", "200"));
                mutations.push(HeaderMutation::set("content-type", "text/html"));
                mutations.extend(rechunk());
                return ResponsePlan {
                    mutations,
                    body: BodyAction::Fallback(request),
                };
            }
        }
        tracing::debug!(status, version = %decision.version(), "non-200 upstream response passed through");
        return ResponsePlan {
            mutations,
            body: BodyAction::PassThrough,
        };
    }

    let is_html = content_type
        .get(..9)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("text/html"));

    if is_html || decision.is_page {
        mutations.push(HeaderMutation::set("cache-control", "no-cache, no-store"));
        mutations.push(HeaderMutation::append(
            "set-cookie",
            decision
                .sticky_assignment()
                .to_set_cookie(config.user_sticky_max_age),
        ));
        if config.backend_gray_enabled() {
            mutations.push(HeaderMutation::append(
                "set-cookie",
                format!(
                    "{}={}; Max-Age={}; Path=/;",
                    config.backend_gray_tag,
                    decision.deployment.backend_version_or_empty(),
                    config.user_sticky_max_age
                ),
            ));
        }
    }

    let body = if decision.is_page && !config.injection.is_empty() {
        mutations.extend(rechunk());
        BodyAction::Inject
    } else {
        BodyAction::PassThrough
    };

    ResponsePlan { mutations, body }
}

/// Framing for a body whose length changes after the headers are sent.
fn rechunk() -> [HeaderMutation; 2] {
    [
        HeaderMutation::remove("content-length"),
        HeaderMutation::set("transfer-encoding", "chunked"),
    ]
}

/// Final body for a fully buffered response.
///
/// Fetched fallback content replaces the upstream body verbatim; a failed
/// or timed-out fallback keeps what was buffered.
pub fn finish_body(
    action: &BodyAction,
    buffered: &[u8],
    fallback: &FallbackState,
    injection: &Injection,
) -> Bytes {
    match action {
        BodyAction::PassThrough => Bytes::copy_from_slice(buffered),
        BodyAction::Inject => Bytes::from(inject(buffered, injection)),
        BodyAction::Fallback(_) => match fallback.replacement_body() {
            Some(body) => body.clone(),
            None => Bytes::copy_from_slice(buffered),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gray::fallback::FallbackResolution;
    use crate::gray::headers::{apply_mutations, HeaderBag};

    // ========== Test Helpers ==========

    const RULE_CONFIG: &str = r#"{
        "grayKey": "userid",
        "backendGrayTag": "x-mse-tag",
        "userStickyMaxAge": "600",
        "baseDeployment": {"version": "base", "backendVersion": "base-api"},
        "grayDeployments": [
            {"name": "beta", "version": "gray", "backendVersion": "gray-api",
             "conditions": [{"key": "userid", "operator": "in", "values": ["u1"]}]}
        ],
        "rewrite": {
            "host": "cdn.example.com",
            "notFoundUri": "/mfe/{version}/404.html",
            "indexRouting": {"/": "/mfe/{version}/index.html"},
            "fileRouting": {"/": "/mfe/{version}"}
        },
        "injection": {"head": ["<meta name=\"v\">"], "body": {"first": [], "last": ["<script></script>"]}}
    }"#;

    const WEIGHTED_CONFIG: &str = r#"{
        "grayKey": "userid",
        "baseDeployment": {"version": "base"},
        "grayDeployments": [{"version": "gray", "weight": 50}]
    }"#;

    fn config(json: &str) -> GrayConfig {
        GrayConfig::from_json(json).unwrap()
    }

    fn signals(path: &str, headers: &[(&str, &str)]) -> RequestSignals {
        RequestSignals::new(path, headers.iter().copied().collect())
    }

    fn page_plan(config: &GrayConfig, headers: &[(&str, &str)]) -> RequestPlan {
        let mut all = vec![("sec-fetch-mode", "navigate")];
        all.extend_from_slice(headers);
        plan_request(config, &signals("/", &all)).unwrap()
    }

    // ========== Phase 1: Request Plan ==========

    #[test]
    fn test_disabled_config_passes_through() {
        let config = config(r#"{"baseDeployment": {"version": "base"}}"#);
        assert!(plan_request(&config, &signals("/", &[])).is_none());
    }

    #[test]
    fn test_rule_match_rewrites_index() {
        let config = config(RULE_CONFIG);
        let plan = page_plan(&config, &[("cookie", "userid=u1")]);
        assert_eq!(plan.decision.version(), "gray");
        assert!(plan.decision.is_page);
        assert_eq!(plan.rewritten_path(), Some("/mfe/gray/index.html"));

        let mut headers: HeaderBag = [
            ("accept-encoding", "gzip"),
            ("content-length", "0"),
            ("host", "www.example.com"),
        ]
        .into_iter()
        .collect();
        apply_mutations(&mut headers, &plan.mutations);
        assert!(!headers.contains("accept-encoding"));
        assert!(!headers.contains("content-length"));
        assert_eq!(headers.get_or_default("x-higress-tag"), "gray");
        assert_eq!(headers.get_or_default("host"), "cdn.example.com");
    }

    #[test]
    fn test_request_body_keeps_its_framing() {
        let config = config(RULE_CONFIG);
        for framing in [("content-length", "12"), ("transfer-encoding", "chunked")] {
            let plan = plan_request(&config, &signals("/api/form.json", &[framing])).unwrap();
            let mut headers: HeaderBag = [framing].into_iter().collect();
            apply_mutations(&mut headers, &plan.mutations);
            assert_eq!(headers.get_or_default(framing.0), framing.1);
        }
    }

    #[test]
    fn test_rule_miss_uses_base() {
        let config = config(RULE_CONFIG);
        let plan = page_plan(&config, &[("cookie", "userid=u2")]);
        assert_eq!(plan.decision.version(), "base");
        assert_eq!(plan.rewritten_path(), Some("/mfe/base/index.html"));
    }

    #[test]
    fn test_asset_reuses_sticky_version() {
        let config = config(RULE_CONFIG);
        let plan = plan_request(
            &config,
            &signals(
                "/js/app.js",
                &[("sec-fetch-mode", "no-cors"), ("cookie", "x-pre-higress-tag=gray,u9")],
            ),
        )
        .unwrap();
        assert!(!plan.decision.is_page);
        assert_eq!(plan.decision.version(), "gray");
        assert_eq!(plan.decision.deployment.backend_version.as_deref(), Some("gray-api"));
        assert_eq!(plan.rewritten_path(), Some("/mfe/gray/js/app.js"));
    }

    #[test]
    fn test_asset_with_unregistered_sticky_version_reselects() {
        let config = config(RULE_CONFIG);
        let plan = plan_request(
            &config,
            &signals("/app.css", &[("cookie", "x-pre-higress-tag=retired,u1")]),
        )
        .unwrap();
        assert_eq!(plan.decision.version(), "base");
        assert_eq!(plan.rewritten_path(), Some("/mfe/base/app.css"));
    }

    #[test]
    fn test_sticky_version_cannot_leave_file_template() {
        let config = config(
            r#"{
                "grayKey": "userid",
                "baseDeployment": {"version": "base"},
                "grayDeployments": [{"version": "gray", "weight": 50}],
                "rewrite": {"fileRouting": {"/": "/mfe/app1/{version}"}}
            }"#,
        );
        let plan = plan_request(
            &config,
            &signals(
                "/secret.json",
                &[("cookie", "x-pre-higress-tag=..%2F..%2Finternal,u1")],
            ),
        )
        .unwrap();
        let version = plan.decision.version();
        assert!(version == "base" || version == "gray", "{}", version);
        let path = plan.rewritten_path().unwrap();
        assert_eq!(path, format!("/mfe/app1/{}/secret.json", version));
        assert!(!path.contains(".."));
    }

    #[test]
    fn test_asset_without_sticky_selects_like_page() {
        let config = config(RULE_CONFIG);
        let plan = plan_request(&config, &signals("/app.css", &[("userid", "u1")])).unwrap();
        assert_eq!(plan.decision.version(), "gray");
    }

    #[test]
    fn test_already_versioned_asset_not_rewritten() {
        let config = config(RULE_CONFIG);
        let plan = plan_request(
            &config,
            &signals("/mfe/gray/app.css", &[("cookie", "x-pre-higress-tag=gray,u1")]),
        )
        .unwrap();
        assert!(plan.rewritten_path().is_none());
    }

    #[test]
    fn test_no_rewrite_rules_keep_path() {
        let config = config(WEIGHTED_CONFIG);
        let plan = page_plan(&config, &[("x-forwarded-for", "1.2.3.4")]);
        assert!(plan.rewritten_path().is_none());
        assert!(!plan
            .mutations
            .iter()
            .any(|m| m.name() == "host"));
    }

    // ========== Phase 2: Weighted Determinism ==========

    #[test]
    fn test_same_forwarded_address_same_assignment() {
        let config = config(WEIGHTED_CONFIG);
        for i in 0..50 {
            let xff = format!("10.0.{}.{}", i, i * 3 % 255);
            let first = page_plan(&config, &[("x-forwarded-for", xff.as_str())]);
            let second = page_plan(&config, &[("x-forwarded-for", xff.as_str())]);
            assert_eq!(first.decision.version(), second.decision.version());
        }
    }

    #[test]
    fn test_replayed_cookie_keeps_assignment() {
        let config = config(WEIGHTED_CONFIG);
        let first = page_plan(&config, &[("x-forwarded-for", "10.9.8.7")]);
        let cookie = format!(
            "x-pre-higress-tag={},{}",
            first.decision.version(),
            first.decision.identity.client_id
        );
        for _ in 0..5 {
            let next = page_plan(
                &config,
                &[("x-forwarded-for", "10.9.8.7"), ("cookie", cookie.as_str())],
            );
            assert_eq!(next.decision.version(), first.decision.version());
        }
    }

    // ========== Phase 3: Response Plan ==========

    #[test]
    fn test_ok_page_sets_cookies_and_injects() {
        let config = config(RULE_CONFIG);
        let mut decision = page_plan(&config, &[("cookie", "userid=u1")]).decision;
        let plan = plan_response(&config, &mut decision, 200, "text/html; charset=utf-8");
        assert_eq!(plan.body, BodyAction::Inject);

        let mut headers: HeaderBag = [
            ("content-length", "100"),
            ("content-disposition", "attachment"),
            ("cache-control", "max-age=3600"),
        ]
        .into_iter()
        .collect();
        apply_mutations(&mut headers, &plan.mutations);
        assert!(!headers.contains("content-length"));
        assert_eq!(headers.get_or_default("transfer-encoding"), "chunked");
        assert!(!headers.contains("content-disposition"));
        assert_eq!(headers.get_or_default("cache-control"), "no-cache, no-store");
        assert_eq!(
            headers.get_all("set-cookie"),
            [
                "x-pre-higress-tag=gray,u1; Max-Age=600; Path=/;".to_string(),
                "x-mse-tag=gray-api; Max-Age=600; Path=/;".to_string(),
            ]
        );
    }

    #[test]
    fn test_html_asset_gets_cookie_but_no_injection() {
        let config = config(RULE_CONFIG);
        let mut decision = plan_request(
            &config,
            &signals("/frame.htm", &[("cookie", "x-pre-higress-tag=base,1.1.1.1")]),
        )
        .unwrap()
        .decision;
        let plan = plan_response(&config, &mut decision, 200, "TEXT/HTML");
        assert_eq!(plan.body, BodyAction::PassThrough);
        assert!(plan.mutations.iter().any(|m| m.name() == "set-cookie"));
    }

    #[test]
    fn test_ok_asset_gets_no_cookie() {
        let config = config(RULE_CONFIG);
        let mut decision = plan_request(&config, &signals("/a.js", &[])).unwrap().decision;
        let plan = plan_response(&config, &mut decision, 200, "application/javascript");
        assert_eq!(plan.body, BodyAction::PassThrough);
        assert_eq!(plan.mutations, vec![HeaderMutation::remove("content-disposition")]);
    }

    #[test]
    fn test_pass_through_keeps_content_length() {
        let config = config(RULE_CONFIG);
        let mut decision = plan_request(&config, &signals("/frame.htm", &[])).unwrap().decision;
        let plan = plan_response(&config, &mut decision, 200, "text/html");
        assert_eq!(plan.body, BodyAction::PassThrough);

        let mut headers: HeaderBag = [("content-length", "512")].into_iter().collect();
        apply_mutations(&mut headers, &plan.mutations);
        assert_eq!(headers.get_or_default("content-length"), "512");
        assert!(!headers.contains("transfer-encoding"));
    }

    #[test]
    fn test_not_found_page_triggers_fallback() {
        let config = config(RULE_CONFIG);
        let mut decision = page_plan(&config, &[("cookie", "userid=u1")]).decision;
        let plan = plan_response(&config, &mut decision, 404, "text/plain");
        assert!(decision.not_found);
        assert_eq!(
            plan.body,
            BodyAction::Fallback(FallbackRequest {
                host: "cdn.example.com".to_string(),
                path: "/mfe/gray/404.html".to_string(),
            })
        );

        let mut headers: HeaderBag = [(":status", "404"), ("content-type", "text/plain"), ("content-length", "9")]
            .into_iter()
            .collect();
        apply_mutations(&mut headers, &plan.mutations);
        assert_eq!(headers.get_or_default(":status"), "200");
        assert_eq!(headers.get_or_default("content-type"), "text/html");
        assert!(!headers.contains("content-length"));
        assert_eq!(headers.get_or_default("transfer-encoding"), "chunked");
        assert!(!headers.contains("set-cookie"));
    }

    #[test]
    fn test_not_found_asset_passes_through() {
        let config = config(RULE_CONFIG);
        let mut decision = plan_request(&config, &signals("/missing.js", &[])).unwrap().decision;
        let plan = plan_response(&config, &mut decision, 404, "text/plain");
        assert_eq!(plan.body, BodyAction::PassThrough);
        assert!(!decision.not_found);
    }

    #[test]
    fn test_not_found_without_fallback_config_passes_through() {
        let config = config(WEIGHTED_CONFIG);
        let mut decision = page_plan(&config, &[]).decision;
        let plan = plan_response(&config, &mut decision, 404, "text/html");
        assert_eq!(plan.body, BodyAction::PassThrough);
        assert!(plan.mutations.is_empty());
    }

    #[test]
    fn test_server_error_short_circuits() {
        let config = config(RULE_CONFIG);
        let mut decision = page_plan(&config, &[]).decision;
        let plan = plan_response(&config, &mut decision, 502, "text/html");
        assert_eq!(plan.body, BodyAction::PassThrough);
        assert!(!plan.mutations.iter().any(|m| m.name() == "set-cookie"));
    }

    // ========== Phase 4: Body Completion ==========

    #[test]
    fn test_finish_body_injects() {
        let config = config(RULE_CONFIG);
        let body = finish_body(
            &BodyAction::Inject,
            b"<html><head></head><body></body></html>",
            &FallbackState::Idle,
            &config.injection,
        );
        assert_eq!(
            body.as_ref(),
            b"<html><head><meta name=\"v\">\n</head><body><script></script>\n</body></html>"
        );
    }

    #[test]
    fn test_finish_body_uses_fetched_fallback() {
        let config = config(RULE_CONFIG);
        let request = FallbackRequest::for_version(&config.rewrite, "gray").unwrap();
        let mut state = FallbackState::default();
        state.begin(request.clone());
        state.resolve(FallbackResolution::Fetched(Bytes::from_static(b"<p>fallback</p>")));
        let body = finish_body(&BodyAction::Fallback(request), b"Not Found", &state, &config.injection);
        assert_eq!(body.as_ref(), b"<p>fallback</p>");
    }

    #[test]
    fn test_finish_body_keeps_buffer_on_failed_fallback() {
        let config = config(RULE_CONFIG);
        let request = FallbackRequest::for_version(&config.rewrite, "gray").unwrap();
        let mut state = FallbackState::default();
        state.begin(request.clone());
        state.resolve(FallbackResolution::TimedOut);
        let body = finish_body(&BodyAction::Fallback(request), b"Not Found", &state, &config.injection);
        assert_eq!(body.as_ref(), b"Not Found");
    }
}
