//! First-match rule selection.

use std::borrow::Cow;
use std::sync::Arc;

use super::headers::HeaderBag;
use super::identity::cookie_value;
use crate::config::{Deployment, GrayConfig};

/// Values conditions are evaluated against.
///
/// A condition on the configured gray key sees the resolved gray-key value;
/// any other key is looked up in the cookies, then in the headers.
pub struct RuleInput<'a> {
    pub gray_key: &'a str,
    pub gray_value: &'a str,
    pub cookies: &'a str,
    pub headers: &'a HeaderBag,
}

impl<'a> RuleInput<'a> {
    pub fn value_for(&self, key: &str) -> Cow<'a, str> {
        if !self.gray_key.is_empty() && key == self.gray_key {
            return Cow::Borrowed(self.gray_value);
        }
        match cookie_value(self.cookies, key) {
            Some(value) if !value.is_empty() => Cow::Owned(value),
            _ => Cow::Borrowed(self.headers.get_or_default(key)),
        }
    }
}

/// True when the deployment has conditions and all of them hold.
pub fn matches(deployment: &Deployment, input: &RuleInput<'_>) -> bool {
    !deployment.conditions.is_empty()
        && deployment
            .conditions
            .iter()
            .all(|c| c.holds(&input.value_for(&c.key)))
}

/// Returns the first gray deployment, in configured order, whose conditions
/// all hold, or `base` when none does.
pub fn select_by_rules(
    config: &GrayConfig,
    base: &Arc<Deployment>,
    input: &RuleInput<'_>,
) -> Arc<Deployment> {
    config
        .gray_deployments()
        .find(|d| matches(d, input))
        .unwrap_or(base)
        .clone()
}
