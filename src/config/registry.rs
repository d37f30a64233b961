//! Deployment registry built from a configuration document.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use super::document::{
    ConditionDocument, ConfigDocument, DeploymentDocument, MaxAge, OperatorDocument,
    DEFAULT_STICKY_MAX_AGE,
};
use crate::error::ConfigError;

/// Placeholder substituted with the chosen version in path templates.
pub const VERSION_PLACEHOLDER: &str = "{version}";

/// Share of traffic the base deployment receives when weights are percentages.
const PERCENT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equal,
    In,
}

/// A single `(key, operator, values)` predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Condition {
    /// Evaluates the predicate against a presented value.
    ///
    /// An empty presented value never satisfies a condition.
    pub fn holds(&self, presented: &str) -> bool {
        if presented.is_empty() {
            return false;
        }
        match self.operator {
            Operator::Equal => self.values.first().is_some_and(|v| v == presented),
            Operator::In => self.values.iter().any(|v| v == presented),
        }
    }
}

/// One deployed version of the front-end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub name: String,
    pub version: String,
    pub backend_version: Option<String>,
    pub weight: u32,
    pub conditions: Vec<Condition>,
    pub is_base: bool,
}

impl Deployment {
    /// A deployment known only by the version a client presented back.
    ///
    /// Sub-resource requests keep the version of their page load even when
    /// that version has since left the registry.
    pub fn sticky(version: &str) -> Self {
        Self {
            name: String::new(),
            version: version.to_string(),
            backend_version: None,
            weight: 0,
            conditions: Vec::new(),
            is_base: false,
        }
    }

    pub fn backend_version_or_empty(&self) -> &str {
        self.backend_version.as_deref().unwrap_or("")
    }
}

/// A path prefix and the template it is rewritten to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTemplate {
    pub prefix: String,
    pub template: String,
}

impl RouteTemplate {
    pub fn render(&self, version: &str) -> String {
        self.template.replace(VERSION_PLACEHOLDER, version)
    }
}

/// Rewrite rules. Route lists are sorted longest prefix first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rewrite {
    pub host: String,
    pub not_found: String,
    pub index: Vec<RouteTemplate>,
    pub file: Vec<RouteTemplate>,
}

impl Rewrite {
    pub fn has_path_rules(&self) -> bool {
        !self.index.is_empty() || !self.file.is_empty()
    }

    pub fn has_not_found_fallback(&self) -> bool {
        !self.host.is_empty() && !self.not_found.is_empty()
    }
}

/// HTML fragments inserted into page responses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Injection {
    pub head: Vec<String>,
    pub body_first: Vec<String>,
    pub body_last: Vec<String>,
}

impl Injection {
    pub fn is_empty(&self) -> bool {
        self.head.is_empty() && self.body_first.is_empty() && self.body_last.is_empty()
    }
}

/// Deployments taking part in weighted selection, with their shares.
#[derive(Debug, Clone)]
pub struct WeightedPool {
    entries: Vec<(Arc<Deployment>, u32)>,
    total: u32,
    last: Arc<Deployment>,
}

impl WeightedPool {
    /// Builds a pool from `(deployment, weight)` pairs, skipping zero weights.
    ///
    /// Returns `None` when no entry carries a positive weight.
    pub fn new(candidates: Vec<(Arc<Deployment>, u32)>) -> Option<Self> {
        let entries: Vec<(Arc<Deployment>, u32)> =
            candidates.into_iter().filter(|(_, w)| *w > 0).collect();
        let last = entries.last()?.0.clone();
        let total = entries
            .iter()
            .fold(0u32, |acc, (_, w)| acc.saturating_add(*w));
        Some(Self {
            entries,
            total,
            last,
        })
    }

    /// Sum of all shares; buckets are drawn from `[0, total)`.
    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn entries(&self) -> &[(Arc<Deployment>, u32)] {
        &self.entries
    }

    /// Returns the deployment whose weight interval contains `bucket`.
    pub fn pick(&self, bucket: u32) -> &Arc<Deployment> {
        let mut upper = 0u32;
        for (deployment, weight) in &self.entries {
            upper = upper.saturating_add(*weight);
            if bucket < upper {
                return deployment;
            }
        }
        &self.last
    }
}

/// How page requests choose a deployment.
#[derive(Debug, Clone)]
pub enum SelectionMode {
    /// No gray deployment is configured; traffic passes through.
    Disabled,
    /// First-match condition rules, falling back to `base`.
    Rules { base: Arc<Deployment> },
    /// Deterministic weighted assignment.
    Weighted { pool: WeightedPool },
}

/// Immutable registry for one configuration generation.
#[derive(Debug, Clone)]
pub struct GrayConfig {
    pub gray_key: String,
    pub gray_sub_key: String,
    pub backend_gray_tag: String,
    pub user_sticky_max_age: u64,
    pub rewrite: Rewrite,
    pub injection: Injection,
    deployments: Vec<Arc<Deployment>>,
    total_gray_weight: u32,
    mode: SelectionMode,
    backend_gray_enabled: bool,
}

impl GrayConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let doc: ConfigDocument = serde_json::from_str(json)?;
        Self::from_document(doc)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Validates a document and builds the registry.
    pub fn from_document(doc: ConfigDocument) -> Result<Self, ConfigError> {
        let user_sticky_max_age = match doc.user_sticky_max_age {
            None => DEFAULT_STICKY_MAX_AGE,
            Some(MaxAge::Seconds(secs)) => secs,
            Some(MaxAge::Text(text)) => text
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidMaxAge(text.clone()))?,
        };

        let mut seen = HashSet::new();
        let mut deployments = Vec::new();

        for (index, gray) in doc.gray_deployments.into_iter().enumerate() {
            if !gray.enabled {
                continue;
            }
            let label = deployment_label(&gray, index);
            let deployment = build_deployment(gray, label, false)?;
            if !seen.insert(deployment.version.clone()) {
                return Err(ConfigError::DuplicateVersion(deployment.version));
            }
            deployments.push(Arc::new(deployment));
        }

        let base = match doc.base_deployment {
            Some(base) => {
                let deployment = build_deployment(base, "baseDeployment".to_string(), true)?;
                if !seen.insert(deployment.version.clone()) {
                    return Err(ConfigError::DuplicateVersion(deployment.version));
                }
                let base = Arc::new(deployment);
                deployments.push(base.clone());
                Some(base)
            }
            None => None,
        };

        let gray_count = deployments.iter().filter(|d| !d.is_base).count();
        let total_gray_weight = deployments
            .iter()
            .filter(|d| !d.is_base)
            .fold(0u32, |acc, d| acc.saturating_add(d.weight));

        let mode = if gray_count == 0 {
            SelectionMode::Disabled
        } else if total_gray_weight == 0 {
            let base = base.ok_or(ConfigError::MissingBase)?;
            SelectionMode::Rules { base }
        } else {
            let mut candidates: Vec<(Arc<Deployment>, u32)> = deployments
                .iter()
                .filter(|d| !d.is_base)
                .map(|d| (d.clone(), d.weight))
                .collect();
            if let Some(base) = &base {
                let share = if base.weight > 0 {
                    base.weight
                } else {
                    PERCENT.saturating_sub(total_gray_weight)
                };
                candidates.push((base.clone(), share));
            }
            // total_gray_weight > 0 guarantees at least one positive entry
            match WeightedPool::new(candidates) {
                Some(pool) => SelectionMode::Weighted { pool },
                None => SelectionMode::Disabled,
            }
        };

        let backend_gray_enabled = deployments.iter().any(|d| d.backend_version.is_some());

        let rewrite = doc
            .rewrite
            .map(|r| Rewrite {
                host: r.host,
                not_found: r.not_found_uri,
                index: sorted_routes(r.index_routing),
                file: sorted_routes(r.file_routing),
            })
            .unwrap_or_default();

        let injection = doc
            .injection
            .map(|i| Injection {
                head: i.head,
                body_first: i.body.first,
                body_last: i.body.last,
            })
            .unwrap_or_default();

        Ok(Self {
            gray_key: doc.gray_key,
            gray_sub_key: doc.gray_sub_key,
            backend_gray_tag: doc.backend_gray_tag,
            user_sticky_max_age,
            rewrite,
            injection,
            deployments,
            total_gray_weight,
            mode,
            backend_gray_enabled,
        })
    }

    /// All deployments: gray ones in configured order, then the base.
    pub fn deployments(&self) -> &[Arc<Deployment>] {
        &self.deployments
    }

    pub fn gray_deployments(&self) -> impl Iterator<Item = &Arc<Deployment>> {
        self.deployments.iter().filter(|d| !d.is_base)
    }

    pub fn base(&self) -> Option<&Arc<Deployment>> {
        self.deployments.iter().find(|d| d.is_base)
    }

    pub fn find_version(&self, version: &str) -> Option<&Arc<Deployment>> {
        self.deployments.iter().find(|d| d.version == version)
    }

    pub fn versions(&self) -> impl Iterator<Item = &str> + Clone {
        self.deployments.iter().map(|d| d.version.as_str())
    }

    pub fn total_gray_weight(&self) -> u32 {
        self.total_gray_weight
    }

    pub fn mode(&self) -> &SelectionMode {
        &self.mode
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.mode, SelectionMode::Disabled)
    }

    pub fn is_weighted(&self) -> bool {
        matches!(self.mode, SelectionMode::Weighted { .. })
    }

    pub fn backend_gray_enabled(&self) -> bool {
        self.backend_gray_enabled && !self.backend_gray_tag.is_empty()
    }
}

fn deployment_label(doc: &DeploymentDocument, index: usize) -> String {
    if !doc.name.is_empty() {
        doc.name.clone()
    } else if !doc.version.is_empty() {
        doc.version.clone()
    } else {
        format!("grayDeployments[{}]", index)
    }
}

fn build_deployment(
    doc: DeploymentDocument,
    label: String,
    is_base: bool,
) -> Result<Deployment, ConfigError> {
    let version = doc.version.trim().to_string();
    if version.is_empty() {
        return Err(ConfigError::MissingVersion(label));
    }

    let conditions = doc
        .conditions
        .into_iter()
        .map(|c| build_condition(c, &label))
        .collect::<Result<Vec<_>, _>>()?;

    let backend_version = Some(doc.backend_version.trim().to_string()).filter(|v| !v.is_empty());

    Ok(Deployment {
        name: doc.name,
        version,
        backend_version,
        weight: doc.weight,
        conditions,
        is_base,
    })
}

fn build_condition(doc: ConditionDocument, deployment: &str) -> Result<Condition, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidCondition {
        deployment: deployment.to_string(),
        reason: reason.to_string(),
    };

    if doc.key.trim().is_empty() {
        return Err(invalid("empty key"));
    }
    let operator = match doc.operator {
        OperatorDocument::Equal => {
            if doc.values.len() != 1 {
                return Err(invalid("'equal' takes exactly one value"));
            }
            Operator::Equal
        }
        OperatorDocument::In => {
            if doc.values.is_empty() {
                return Err(invalid("'in' needs at least one value"));
            }
            Operator::In
        }
    };

    Ok(Condition {
        key: doc.key.trim().to_string(),
        operator,
        values: doc.values,
    })
}

fn sorted_routes(routes: impl IntoIterator<Item = (String, String)>) -> Vec<RouteTemplate> {
    let mut routes: Vec<RouteTemplate> = routes
        .into_iter()
        .map(|(prefix, template)| RouteTemplate { prefix, template })
        .collect();
    // Longest prefix first; ties broken lexically so the order is stable.
    routes.sort_by(|a, b| {
        b.prefix
            .len()
            .cmp(&a.prefix.len())
            .then_with(|| a.prefix.cmp(&b.prefix))
    });
    routes
}
