//! Affected-set computation.
//!
//! Given the merged rule set and a description of what changed, works out
//! which filter-enabled local instances need their configuration rendered
//! again, and which enabled rules apply to each of them.

use crate::core::{Endpoint, Instance, RemoteInstance, Rule};
use crate::lookup::Catalog;
use crate::resolve::{covers, covers_either};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// Before and after states of one changed entity. `None` on either side
/// means the entity did not exist.
#[derive(Debug, Clone, PartialEq)]
pub struct Change<T> {
    pub old: Option<T>,
    pub new: Option<T>,
}

impl<T> Change<T> {
    pub fn added(new: T) -> Self {
        Self { old: None, new: Some(new) }
    }

    pub fn replaced(old: T, new: T) -> Self {
        Self {
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn removed(old: T) -> Self {
        Self { old: Some(old), new: None }
    }

    /// Both versions, oldest first.
    pub fn versions(&self) -> impl Iterator<Item = &T> {
        self.old.iter().chain(self.new.iter())
    }

    /// The surviving version, or the removed one.
    pub fn latest(&self) -> Option<&T> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

/// What changed in one operation.
#[derive(Debug, Clone, Default)]
pub struct Delta {
    pub rules: Vec<Change<Rule>>,
    pub mirrors: Vec<Change<RemoteInstance>>,
    /// Local instances introduced or re-enabled by this operation.
    pub instances: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.mirrors.is_empty() && self.instances.is_empty()
    }
}

/// Instances to re-render, each with the enabled rules that apply to it in
/// either direction, sorted by id.
#[derive(Debug, Clone, Default)]
pub struct AffectedSet {
    pub instances: BTreeMap<String, Vec<Rule>>,
}

impl AffectedSet {
    pub fn ids(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }
}

/// Local instances receiving statements from `rule`: those on its
/// rendering side. Disabled rules never render.
fn rendered_for<'a>(rule: &Rule, catalog: &'a Catalog) -> Vec<&'a Instance> {
    if !rule.enabled {
        return Vec::new();
    }
    catalog
        .local
        .all()
        .filter(|inst| covers(rule, rule.render_side(), *inst))
        .collect()
}

/// Enabled rules whose non-rendering side references `endpoint`.
fn referencing<'a, E: Endpoint + ?Sized>(
    rules: &'a [Rule],
    endpoint: &'a E,
) -> impl Iterator<Item = &'a Rule> + 'a {
    rules
        .iter()
        .filter(move |r| r.enabled && covers(r, r.render_side().opposite(), endpoint))
}

/// Computes the affected set for `delta` against the merged (post-change)
/// rule set.
pub fn compute(rules: &[Rule], catalog: &Catalog, delta: &Delta) -> AffectedSet {
    let mut ids: BTreeSet<String> = BTreeSet::new();

    // Direct: the rendering side of every version of each changed rule.
    for change in &delta.rules {
        for version in change.versions() {
            for inst in rendered_for(version, catalog) {
                trace!(rule = %version.id, instance = %inst.id, "Directly affected");
                ids.insert(inst.id.clone());
            }
        }
    }

    // Indirect: rules whose opposite side names a changed mirror.
    for change in &delta.mirrors {
        for mirror in change.versions() {
            for rule in referencing(rules, mirror) {
                for inst in rendered_for(rule, catalog) {
                    trace!(
                        rule = %rule.id,
                        mirror = %mirror.id,
                        instance = %inst.id,
                        "Affected through remote instance"
                    );
                    ids.insert(inst.id.clone());
                }
            }
        }
    }

    // Indirect: new local instances and the instances whose rules name them.
    for id in &delta.instances {
        let Some(inst) = catalog.local.get(id) else {
            continue;
        };
        ids.insert(inst.id.clone());
        for rule in referencing(rules, inst) {
            for other in rendered_for(rule, catalog) {
                ids.insert(other.id.clone());
            }
        }
    }

    let instances: BTreeMap<String, Vec<Rule>> = ids
        .into_iter()
        .filter_map(|id| catalog.local.get(&id))
        .filter(|inst| inst.filter_enabled)
        .map(|inst| (inst.id.clone(), rules_for(rules, inst)))
        .collect();

    debug!(
        changed_rules = delta.rules.len(),
        changed_mirrors = delta.mirrors.len(),
        affected = instances.len(),
        "Computed affected set"
    );
    AffectedSet { instances }
}

/// Affected set for a fixed list of instances, regardless of what changed.
pub fn for_instances<'a>(
    rules: &[Rule],
    instances: impl IntoIterator<Item = &'a Instance>,
) -> AffectedSet {
    AffectedSet {
        instances: instances
            .into_iter()
            .filter(|inst| inst.filter_enabled)
            .map(|inst| (inst.id.clone(), rules_for(rules, inst)))
            .collect(),
    }
}

fn rules_for(rules: &[Rule], inst: &Instance) -> Vec<Rule> {
    rules
        .iter()
        .filter(|r| r.enabled && covers_either(r, inst))
        .cloned()
        .collect()
}
