//! Read-only operations.
//!
//! Queries only observe committed store files and therefore never take the
//! store lock.

use crate::control::FilterStatus;
use crate::core::{
    Endpoint, Instance, InstanceRecord, RemoteInstance, Rule, Side, TagTarget, Target, Wildcard,
};
use crate::engine::Engine;
use crate::errors::{FwError, Result};
use crate::lookup::{Catalog, LookupTable};
use crate::resolve::{covers_either, side_instances};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A remote instance given either by id (looked up in the store) or as a
/// full record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteRef {
    Id(String),
    Record(InstanceRecord),
}

/// A rule given either by id or in full.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleRef {
    Id(String),
    Rule(Box<Rule>),
}

/// Which values of a tag are referenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagSelector {
    /// Every value (serialized as `true`).
    Any(bool),
    Values(Vec<String>),
}

/// Non-local targets that rules covering local instances refer to. A
/// remote host uses this to decide which of its instances to mirror here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTargets {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, TagSelector>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub instances: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub all_instances: bool,
}

impl RemoteTargets {
    fn add_tag(&mut self, tag: &TagTarget) {
        let Some(value) = &tag.value else {
            self.tags.insert(tag.name.clone(), TagSelector::Any(true));
            return;
        };
        let selector = self
            .tags
            .entry(tag.name.clone())
            .or_insert_with(|| TagSelector::Values(Vec::new()));
        if let TagSelector::Values(values) = selector {
            if !values.contains(value) {
                values.push(value.clone());
                values.sort();
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.instances.is_empty() && !self.all_instances
    }
}

impl Engine {
    /// One rule by id.
    pub async fn get(&self, id: &str) -> Result<Rule> {
        self.store()
            .rules
            .get(id)
            .await?
            .ok_or_else(|| FwError::not_found("rule", id))
    }

    /// One remote instance by id.
    pub async fn get_remote(&self, id: &str) -> Result<RemoteInstance> {
        self.store()
            .mirrors
            .get(id)
            .await?
            .ok_or_else(|| FwError::not_found("remote instance", id))
    }

    /// Serialized rules sorted by id, optionally restricted to `owner` and
    /// projected onto `fields`.
    pub async fn list(
        &self,
        fields: &[String],
        owner: Option<&str>,
    ) -> Result<Vec<serde_json::Value>> {
        let mut rules = self.store().rules.load_all().await?;
        rules.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rules
            .iter()
            .filter(|r| owner.map_or(true, |o| r.owner.as_deref() == Some(o)))
            .map(|r| project(r.serialize(), fields))
            .collect())
    }

    pub async fn list_remote(&self) -> Result<Vec<RemoteInstance>> {
        self.store().mirrors.load_all().await
    }

    /// Every stored rule covering the local or remote instance `id` on
    /// either side, enabled or not.
    pub async fn rules_for(&self, id: &str, instances: Vec<InstanceRecord>) -> Result<Vec<Rule>> {
        let rules = self.store().rules.load_all().await?;
        let (local, errs) = LookupTable::<Instance>::from_records(instances);
        FwError::check(errs)?;

        let matching = match local.get(id) {
            Some(inst) => matching_rules(&rules, inst),
            None => {
                let remote = self.get_remote(id).await.map_err(|e| {
                    if e.is_not_found() {
                        FwError::not_found("instance", id)
                    } else {
                        e
                    }
                })?;
                matching_rules(&rules, &remote)
            }
        };
        debug!(instance = id, count = matching.len(), "Found rules for instance");
        Ok(matching)
    }

    /// Every stored rule covering a remote instance.
    pub async fn remote_rules_for(&self, remote: RemoteRef) -> Result<Vec<Rule>> {
        let remote = match remote {
            RemoteRef::Id(id) => self.get_remote(&id).await?,
            RemoteRef::Record(record) => RemoteInstance::try_from(record)?,
        };
        let rules = self.store().rules.load_all().await?;
        Ok(matching_rules(&rules, &remote))
    }

    /// Ids of the local instances covered by a rule on either side.
    pub async fn instances_for_rule(
        &self,
        rule: RuleRef,
        instances: Vec<InstanceRecord>,
    ) -> Result<Vec<String>> {
        let rule = match rule {
            RuleRef::Id(id) => self.get(&id).await?,
            RuleRef::Rule(rule) => *rule,
        };
        let (local, errs) = LookupTable::<Instance>::from_records(instances);
        FwError::check(errs)?;
        let ids: BTreeSet<&str> = Side::BOTH
            .iter()
            .flat_map(|side| side_instances(&rule, *side, &local))
            .collect();
        Ok(ids.into_iter().map(str::to_string).collect())
    }

    /// Non-local targets on the far side of rules that cover local
    /// instances. Uses the stored rules when `rules` is `None`.
    pub async fn remote_targets(
        &self,
        rules: Option<Vec<Rule>>,
        instances: Vec<InstanceRecord>,
    ) -> Result<RemoteTargets> {
        let rules = match rules {
            Some(rules) => rules,
            None => self.store().rules.load_all().await?,
        };
        let catalog = Catalog::from_records(instances, Vec::new())?;
        Ok(remote_targets(&rules, &catalog))
    }

    /// Live filter status of a local instance.
    pub async fn status(&self, id: &str, instances: Vec<InstanceRecord>) -> Result<FilterStatus> {
        let local = local_table(instances)?;
        let inst = local.get(id).ok_or_else(|| FwError::not_found("instance", id))?;
        self.control().status(inst).await
    }

    /// Live filter counters of a local instance.
    pub async fn stats(&self, id: &str, instances: Vec<InstanceRecord>) -> Result<Vec<String>> {
        let local = local_table(instances)?;
        let inst = local.get(id).ok_or_else(|| FwError::not_found("instance", id))?;
        self.control().stats(inst).await
    }
}

fn local_table(instances: Vec<InstanceRecord>) -> Result<LookupTable<Instance>> {
    let (local, errs) = LookupTable::<Instance>::from_records(instances);
    FwError::check(errs)?;
    Ok(local)
}

fn matching_rules<E: Endpoint + ?Sized>(rules: &[Rule], endpoint: &E) -> Vec<Rule> {
    let mut matching: Vec<Rule> = rules
        .iter()
        .filter(|r| covers_either(*r, endpoint))
        .cloned()
        .collect();
    matching.sort_by(|a, b| a.id.cmp(&b.id));
    matching
}

/// Keeps only `fields` of a serialized object; all of it when empty.
fn project(value: serde_json::Value, fields: &[String]) -> serde_json::Value {
    if fields.is_empty() {
        return value;
    }
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .filter(|(k, _)| fields.iter().any(|f| f == k))
                .collect(),
        ),
        other => other,
    }
}

/// Collects the far-side targets of every rule that covers at least one
/// local instance. A bare tag wins over tag values.
pub fn remote_targets(rules: &[Rule], catalog: &Catalog) -> RemoteTargets {
    let mut targets = RemoteTargets::default();
    for rule in rules {
        for side in Side::BOTH {
            if side_instances(rule, side, &catalog.local).is_empty() {
                continue;
            }
            for target in rule.side(side.opposite()) {
                match target {
                    Target::Tag(tag) => targets.add_tag(tag),
                    Target::Instance(id) if !catalog.local.contains(id) => {
                        targets.instances.insert(id.clone());
                    }
                    Target::Wildcard(Wildcard::AllInstances) => targets.all_instances = true,
                    _ => {}
                }
            }
        }
    }
    targets
}
