//! Tenant rule repository.
//!
//! The rule document maps tenant → rules, either grouped by event type
//! (`{"t1": {"disk_space": [..]}}`) or as a flat list where each rule names
//! its own `event_type` (`{"t1": [..]}`). Both shapes are normalized into
//! one immutable snapshot at load time.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::info;

use crate::error::{Error, Result};
use crate::model::Rule;
use crate::registry::EventRegistry;

/// Reserved tenant key for the fallback rule set.
pub const DEFAULT_TENANT: &str = "default";

#[derive(Deserialize)]
#[serde(untagged)]
enum TenantDoc {
    ByType(BTreeMap<String, Vec<Rule>>),
    Flat(Vec<Rule>),
}

/// Immutable tenant → event type → ordered rules snapshot.
#[derive(Debug, Clone, Default)]
pub struct RuleRepository {
    tenants: HashMap<String, HashMap<String, Vec<Rule>>>,
    default_tenant: String,
}

impl RuleRepository {
    /// Parse a rule document. `origin` names the source in errors.
    pub fn from_json(doc: &str, origin: &str, default_tenant: &str) -> Result<Self> {
        let load_err = |reason: String| Error::RuleLoad {
            path: origin.to_string(),
            reason,
        };

        let raw: BTreeMap<String, TenantDoc> =
            serde_json::from_str(doc).map_err(|e| load_err(e.to_string()))?;

        let mut tenants = HashMap::with_capacity(raw.len());
        for (tenant_id, tenant_doc) in raw {
            let by_type = normalize(&tenant_id, tenant_doc).map_err(load_err)?;
            tenants.insert(tenant_id, by_type);
        }

        Ok(Self {
            tenants,
            default_tenant: default_tenant.to_string(),
        })
    }

    /// Read and parse the rule document at `path`.
    pub async fn load(path: &Path, default_tenant: &str) -> Result<Self> {
        let origin = path.display().to_string();
        let doc = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::RuleLoad {
                path: origin.clone(),
                reason: e.to_string(),
            })?;
        let repo = Self::from_json(&doc, &origin, default_tenant)?;
        info!(
            path = %origin,
            tenants = repo.tenants.len(),
            rules = repo.rule_count(),
            "rules loaded"
        );
        Ok(repo)
    }

    /// Rules for `(tenant_id, event_type)` in document order.
    ///
    /// Falls back to the default tenant only when `tenant_id` has no entry in
    /// the document at all. A tenant that exists but has nothing for this
    /// type gets an empty slice.
    pub fn get_rules(&self, tenant_id: &str, event_type: &str) -> &[Rule] {
        let tenant = match self.tenants.get(tenant_id) {
            Some(t) => Some(t),
            None => self.tenants.get(&self.default_tenant),
        };
        tenant
            .and_then(|t| t.get(event_type))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn default_tenant(&self) -> &str {
        &self.default_tenant
    }

    pub fn rule_count(&self) -> usize {
        self.tenants
            .values()
            .flat_map(|t| t.values())
            .map(Vec::len)
            .sum()
    }

    /// Check every rule against the registry: its event type must be
    /// registered, and its `payload_fields` must be declared by that type.
    /// Types that declare no fields are not field-checked.
    pub fn validate_payload_fields(&self, registry: &EventRegistry) -> Result<()> {
        let mut tenant_ids: Vec<&String> = self.tenants.keys().collect();
        tenant_ids.sort();

        for tenant_id in tenant_ids {
            let mut types: Vec<(&String, &Vec<Rule>)> = self.tenants[tenant_id].iter().collect();
            types.sort_by_key(|(t, _)| *t);

            for (event_type, rules) in types {
                for rule in rules {
                    let invalid = |reason: String| Error::RuleValidation {
                        tenant_id: tenant_id.clone(),
                        rule_id: rule.id().to_string(),
                        reason,
                    };
                    let declared = registry
                        .fields(event_type)
                        .ok_or_else(|| invalid(format!("unknown event type: {event_type}")))?;
                    if declared.is_empty() {
                        continue;
                    }
                    if let Some(field) = rule
                        .payload_fields
                        .iter()
                        .find(|f| !declared.contains(&f.as_str()))
                    {
                        return Err(invalid(format!(
                            "invalid field '{field}' in payload_fields for event type '{event_type}'"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn normalize(
    tenant_id: &str,
    doc: TenantDoc,
) -> std::result::Result<HashMap<String, Vec<Rule>>, String> {
    let mut by_type: HashMap<String, Vec<Rule>> = HashMap::new();
    match doc {
        TenantDoc::ByType(groups) => {
            for (event_type, rules) in groups {
                let list = by_type.entry(event_type.clone()).or_default();
                for mut rule in rules {
                    if rule.event_type.is_empty() {
                        rule.event_type = event_type.clone();
                    } else if rule.event_type != event_type {
                        return Err(format!(
                            "tenant {tenant_id}: rule '{}' declares event_type '{}' but is listed under '{event_type}'",
                            rule.id(),
                            rule.event_type
                        ));
                    }
                    list.push(rule);
                }
            }
        }
        TenantDoc::Flat(rules) => {
            for rule in rules {
                if rule.event_type.is_empty() {
                    return Err(format!(
                        "tenant {tenant_id}: rule '{}' has no event_type",
                        rule.id()
                    ));
                }
                by_type.entry(rule.event_type.clone()).or_default().push(rule);
            }
        }
    }

    let mut seen = HashSet::new();
    for rule in by_type.values().flatten() {
        if rule.id().is_empty() {
            return Err(format!("tenant {tenant_id}: rule without rule_id or name"));
        }
        if !seen.insert(rule.id().to_string()) {
            return Err(format!("tenant {tenant_id}: duplicate rule id '{}'", rule.id()));
        }
        if rule.deduplication && rule.dedup_window.is_zero() {
            return Err(format!(
                "tenant {tenant_id}: rule '{}' enables deduplication without a dedup_window",
                rule.id()
            ));
        }
    }
    Ok(by_type)
}

/// One-time, first-caller-wins loader for the rule snapshot.
///
/// A failed load leaves the source empty, so the next caller retries.
#[derive(Debug)]
pub struct RuleSource {
    path: Option<PathBuf>,
    default_tenant: String,
    cell: OnceCell<Arc<RuleRepository>>,
}

impl RuleSource {
    pub fn new(path: impl Into<PathBuf>, default_tenant: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            default_tenant: default_tenant.into(),
            cell: OnceCell::new(),
        }
    }

    /// A source that is already initialized with `repo`.
    pub fn from_repository(repo: RuleRepository) -> Self {
        Self {
            path: None,
            default_tenant: repo.default_tenant.clone(),
            cell: OnceCell::new_with(Some(Arc::new(repo))),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    /// The snapshot, loading it on first use.
    pub async fn get(&self) -> Result<Arc<RuleRepository>> {
        let repo = self
            .cell
            .get_or_try_init(|| async {
                let path = self.path.as_deref().ok_or_else(|| Error::RuleLoad {
                    path: "<none>".to_string(),
                    reason: "no rule document configured".to_string(),
                })?;
                RuleRepository::load(path, &self.default_tenant)
                    .await
                    .map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(repo))
    }
}
