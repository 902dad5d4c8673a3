//! Rule target resolution.
//!
//! Turns the abstract targets on one side of a rule into concrete local and
//! remote descriptors. Tenant scoping is applied here and only here: a rule
//! with an owner only ever resolves to descriptors with the same owner.

use crate::core::{Endpoint, Instance, RemoteInstance, Rule, Side, TagTarget, Target, Wildcard};
use crate::errors::FwError;
use crate::lookup::{Catalog, LookupTable};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// The outcome of resolving one target.
#[derive(Debug)]
pub enum Resolved<'a> {
    /// An IP or subnet, rendered as-is.
    Address(String),
    /// The `any` wildcard on a "from" side: never expanded.
    Unscoped,
    /// Matching descriptors from the local and remote tables.
    Endpoints {
        local: Vec<&'a Instance>,
        remote: Vec<&'a RemoteInstance>,
    },
}

impl Resolved<'_> {
    /// Sorted, de-duplicated addresses of the matched descriptors.
    pub fn ips(&self) -> Vec<IpAddr> {
        match self {
            Resolved::Endpoints { local, remote } => {
                let ips: BTreeSet<IpAddr> = local
                    .iter()
                    .flat_map(|i| i.ips.iter().copied())
                    .chain(remote.iter().flat_map(|r| r.ips.iter().copied()))
                    .collect();
                ips.into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Resolved::Endpoints { local, remote } => local.is_empty() && remote.is_empty(),
            _ => false,
        }
    }
}

/// Whether a rule with `owner` may match `endpoint`.
pub fn visible_to<E: Endpoint + ?Sized>(owner: Option<&str>, endpoint: &E) -> bool {
    match owner {
        None => true,
        Some(owner) => endpoint.owner() == Some(owner),
    }
}

/// Whether `target` names `endpoint`, ignoring ownership.
pub fn target_matches<E: Endpoint + ?Sized>(target: &Target, side: Side, endpoint: &E) -> bool {
    match target {
        Target::Ip(_) | Target::Subnet(_) => false,
        Target::Instance(id) => endpoint.id() == id,
        Target::Tag(TagTarget { name, value: None }) => endpoint.tags().contains_key(name),
        Target::Tag(TagTarget {
            name,
            value: Some(value),
        }) => endpoint
            .tags()
            .get(name)
            .map_or(false, |v| v.key() == *value),
        Target::Wildcard(Wildcard::Any) => side == Side::To,
        Target::Wildcard(Wildcard::AllInstances) => true,
    }
}

/// Whether `endpoint` is covered by the `side` of `rule`, owner scoping
/// included.
pub fn covers<E: Endpoint + ?Sized>(rule: &Rule, side: Side, endpoint: &E) -> bool {
    visible_to(rule.owner.as_deref(), endpoint)
        && rule
            .side(side)
            .iter()
            .any(|t| target_matches(t, side, endpoint))
}

/// Whether `endpoint` is covered by either side of `rule`.
pub fn covers_either<E: Endpoint + ?Sized>(rule: &Rule, endpoint: &E) -> bool {
    Side::BOTH.iter().any(|side| covers(rule, *side, endpoint))
}

fn lookup<'a, T: Endpoint>(
    table: &'a LookupTable<T>,
    owner: Option<&str>,
    side: Side,
    target: &Target,
) -> Vec<&'a T> {
    let candidates: Vec<&'a T> = match target {
        Target::Instance(id) => table.get(id).into_iter().collect(),
        Target::Tag(TagTarget { name, value: None }) => table.with_tag(name).collect(),
        Target::Tag(TagTarget {
            name,
            value: Some(value),
        }) => table.with_tag_value(name, value).collect(),
        Target::Wildcard(Wildcard::Any) if side == Side::To => table.all().collect(),
        Target::Wildcard(Wildcard::AllInstances) => table.all().collect(),
        _ => Vec::new(),
    };
    candidates
        .into_iter()
        .filter(|e| visible_to(owner, *e))
        .collect()
}

/// Resolves one target found on `side` of `rule`.
pub fn resolve<'a>(rule: &Rule, side: Side, target: &Target, catalog: &'a Catalog) -> Resolved<'a> {
    match target {
        Target::Ip(ip) => Resolved::Address(ip.to_string()),
        Target::Subnet(net) => Resolved::Address(net.to_string()),
        Target::Wildcard(Wildcard::Any) if side == Side::From => Resolved::Unscoped,
        _ => {
            let owner = rule.owner.as_deref();
            Resolved::Endpoints {
                local: lookup(&catalog.local, owner, side, target),
                remote: lookup(&catalog.remote, owner, side, target),
            }
        }
    }
}

/// Ids of the local instances covered by `side` of `rule`.
pub fn side_instances<'a>(
    rule: &Rule,
    side: Side,
    table: &'a LookupTable<Instance>,
) -> BTreeSet<&'a str> {
    let owner = rule.owner.as_deref();
    rule.side(side)
        .iter()
        .flat_map(|target| lookup(table, owner, side, target))
        .map(|inst| inst.id.as_str())
        .collect()
}

/// Instance and tag targets of `rule` that resolve to nothing in `catalog`.
pub fn unresolved_targets(rule: &Rule, catalog: &Catalog) -> Vec<FwError> {
    let mut errs = Vec::new();
    for side in Side::BOTH {
        for target in rule.side(side) {
            if !matches!(target, Target::Instance(_) | Target::Tag(_)) {
                continue;
            }
            if resolve(rule, side, target, catalog).is_empty() {
                let (kind, value) = target.annotation();
                errs.push(FwError::validation(format!(
                    "rule \"{}\": missing {} \"{}\" on \"{}\" side",
                    rule.id, kind, value, side
                )));
            }
        }
    }
    errs
}
