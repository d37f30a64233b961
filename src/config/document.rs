//! Serde model of the JSON configuration document.
//!
//! Field names follow the document's camelCase keys. Everything except the
//! deployment versions is optional.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_BACKEND_GRAY_TAG: &str = "x-mse-tag";
pub const DEFAULT_STICKY_MAX_AGE: u64 = 172_800;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub gray_key: String,
    #[serde(default)]
    pub gray_sub_key: String,
    #[serde(default = "default_backend_gray_tag")]
    pub backend_gray_tag: String,
    #[serde(default)]
    pub user_sticky_max_age: Option<MaxAge>,
    #[serde(default)]
    pub base_deployment: Option<DeploymentDocument>,
    #[serde(default)]
    pub gray_deployments: Vec<DeploymentDocument>,
    #[serde(default)]
    pub rewrite: Option<RewriteDocument>,
    #[serde(default)]
    pub injection: Option<InjectionDocument>,
}

/// Cookie lifetime, accepted either as `"172800"` or `172800`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MaxAge {
    Seconds(u64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDocument {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub backend_version: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub conditions: Vec<ConditionDocument>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConditionDocument {
    pub key: String,
    pub operator: OperatorDocument,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorDocument {
    Equal,
    In,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteDocument {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub not_found_uri: String,
    #[serde(default)]
    pub index_routing: BTreeMap<String, String>,
    #[serde(default)]
    pub file_routing: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InjectionDocument {
    #[serde(default)]
    pub head: Vec<String>,
    #[serde(default)]
    pub body: InjectionBodyDocument,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct InjectionBodyDocument {
    #[serde(default)]
    pub first: Vec<String>,
    #[serde(default)]
    pub last: Vec<String>,
}

fn default_backend_gray_tag() -> String {
    DEFAULT_BACKEND_GRAY_TAG.to_string()
}

fn default_enabled() -> bool {
    true
}
