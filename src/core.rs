//! Core domain types for the firewall convergence engine.
//!
//! This module defines the rule model, the instance descriptors the engine
//! receives from its caller, and the deserialization-only records those
//! descriptors are validated from.

use crate::errors::{FwError, Result};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Maximum number of targets on one side of a rule.
pub const MAX_TARGETS_PER_SIDE: usize = 24;
/// Maximum number of ports or ICMP types on one rule.
pub const MAX_PROTO_TARGETS: usize = 8;

/// Checks that `id` can name a store entry: non-empty, free of path
/// separators and NUL, and not starting with a dot.
pub fn check_id(kind: &str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(FwError::validation(format!("{} id must not be empty", kind)));
    }
    if id.starts_with('.') || id.contains(['/', '\\', '\0']) {
        return Err(FwError::validation(format!(
            "{} id \"{}\" must not start with a dot or contain path separators",
            kind,
            id.escape_default()
        )));
    }
    Ok(())
}

/// Generates a fresh rule version token: `<unix-millis>.<pid>`.
pub fn generate_version() -> String {
    format!(
        "{}.{:06}",
        chrono::Utc::now().timestamp_millis(),
        std::process::id()
    )
}

// =============================================================================
// Rules
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Block,
}

/// One side of a rule. Instances matched on the `From` side are filtered on
/// their outbound traffic, those on the `To` side on their inbound traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Side {
    From,
    To,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::From, Side::To];

    pub fn opposite(self) -> Side {
        match self {
            Side::From => Side::To,
            Side::To => Side::From,
        }
    }

    /// The packet-filter direction keyword for instances on this side.
    pub fn keyword(self) -> &'static str {
        match self {
            Side::From => "out",
            Side::To => "in",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::From => "from",
            Side::To => "to",
        })
    }
}

/// A TCP or UDP port, or the literal `all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortTarget {
    Port(u16),
    All,
}

impl fmt::Display for PortTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortTarget::Port(p) => write!(f, "{}", p),
            PortTarget::All => f.write_str("all"),
        }
    }
}

impl FromStr for PortTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(PortTarget::All);
        }
        match s.parse::<u16>() {
            Ok(0) | Err(_) => Err(format!("invalid port \"{}\"", s)),
            Ok(p) => Ok(PortTarget::Port(p)),
        }
    }
}

/// An ICMP type with an optional code, written `T` or `T:C`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IcmpTarget {
    pub icmp_type: u8,
    pub code: Option<u8>,
}

impl fmt::Display for IcmpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}:{}", self.icmp_type, code),
            None => write!(f, "{}", self.icmp_type),
        }
    }
}

impl FromStr for IcmpTarget {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = || format!("invalid ICMP type \"{}\"", s);
        let mut parts = s.splitn(2, ':');
        let icmp_type = parts
            .next()
            .and_then(|t| t.parse::<u8>().ok())
            .ok_or_else(invalid)?;
        let code = match parts.next() {
            Some(c) => Some(c.parse::<u8>().map_err(|_| invalid())?),
            None => None,
        };
        Ok(IcmpTarget { icmp_type, code })
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum Protocol {
    Tcp {
        #[serde_as(as = "Vec<DisplayFromStr>")]
        ports: Vec<PortTarget>,
    },
    Udp {
        #[serde_as(as = "Vec<DisplayFromStr>")]
        ports: Vec<PortTarget>,
    },
    Icmp {
        #[serde_as(as = "Vec<DisplayFromStr>")]
        types: Vec<IcmpTarget>,
    },
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Tcp { .. } => "tcp",
            Protocol::Udp { .. } => "udp",
            Protocol::Icmp { .. } => "icmp",
        }
    }

    /// Number of ports or ICMP types carried.
    pub fn target_count(&self) -> usize {
        match self {
            Protocol::Tcp { ports } | Protocol::Udp { ports } => ports.len(),
            Protocol::Icmp { types } => types.len(),
        }
    }

    fn normalize(&mut self) {
        match self {
            Protocol::Tcp { ports } | Protocol::Udp { ports } => {
                ports.sort();
                ports.dedup();
            }
            Protocol::Icmp { types } => {
                types.sort();
                types.dedup();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Wildcard {
    /// Unscoped on the "from" side; every instance on the "to" side.
    Any,
    /// Every instance visible to the rule's owner.
    AllInstances,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagTarget {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// One endpoint specifier in a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Target {
    Ip(IpAddr),
    Subnet(IpNetwork),
    Instance(String),
    Tag(TagTarget),
    Wildcard(Wildcard),
}

impl Target {
    pub fn tag(name: &str) -> Self {
        Target::Tag(TagTarget {
            name: name.to_string(),
            value: None,
        })
    }

    pub fn tag_value(name: &str, value: &str) -> Self {
        Target::Tag(TagTarget {
            name: name.to_string(),
            value: Some(value.to_string()),
        })
    }

    /// Whether this target can match instances (as opposed to raw addresses).
    pub fn names_instances(&self) -> bool {
        !matches!(self, Target::Ip(_) | Target::Subnet(_))
    }

    /// The `type` and `value` used in rendered annotations.
    pub fn annotation(&self) -> (&'static str, String) {
        match self {
            Target::Ip(ip) => ("ip", ip.to_string()),
            Target::Subnet(net) => ("subnet", net.to_string()),
            Target::Instance(id) => ("instance", id.clone()),
            Target::Tag(TagTarget { name, value: None }) => ("tag", name.clone()),
            Target::Tag(TagTarget {
                name,
                value: Some(value),
            }) => ("tag", format!("{}={}", name, value)),
            Target::Wildcard(Wildcard::Any) => ("wildcard", "any".to_string()),
            Target::Wildcard(Wildcard::AllInstances) => {
                ("wildcard", "all-instances".to_string())
            }
        }
    }
}

/// A compiled firewall rule. Rules are immutable values: an update replaces
/// the stored rule wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub action: Action,
    pub protocol: Protocol,
    #[serde(default)]
    pub priority: u32,
    pub from: Vec<Target>,
    pub to: Vec<Target>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub log: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl Rule {
    pub fn side(&self, side: Side) -> &[Target] {
        match side {
            Side::From => &self.from,
            Side::To => &self.to,
        }
    }

    /// `from + allow` and `to + block` restate the filter's default policy.
    pub fn is_noop(&self, side: Side) -> bool {
        matches!(
            (side, self.action),
            (Side::From, Action::Allow) | (Side::To, Action::Block)
        )
    }

    /// The only side whose instances receive statements for this rule.
    pub fn render_side(&self) -> Side {
        match self.action {
            Action::Allow => Side::To,
            Action::Block => Side::From,
        }
    }

    /// The JSON form used both on disk and in API responses.
    pub fn serialize(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Equal in everything but the version token.
    pub fn same_content(&self, other: &Rule) -> bool {
        let mut a = self.clone();
        a.version.clone_from(&other.version);
        a == *other
    }

    /// Checks the structural constraints on a rule, aggregating every
    /// violation found.
    pub fn validate(&self) -> Result<()> {
        let mut errs = Vec::new();
        if let Err(e) = check_id("rule", &self.id) {
            errs.push(e);
        }
        if self.version.trim().is_empty() {
            errs.push(FwError::validation(format!(
                "rule \"{}\": version must not be empty",
                self.id
            )));
        }
        if matches!(&self.owner, Some(o) if o.trim().is_empty()) {
            errs.push(FwError::validation(format!(
                "rule \"{}\": owner must not be empty",
                self.id
            )));
        }
        for side in Side::BOTH {
            let targets = self.side(side);
            if targets.is_empty() {
                errs.push(FwError::validation(format!(
                    "rule \"{}\": no targets on \"{}\" side",
                    self.id, side
                )));
            }
            if targets.len() > MAX_TARGETS_PER_SIDE {
                errs.push(FwError::validation(format!(
                    "rule \"{}\": maximum of {} targets allowed per side",
                    self.id, MAX_TARGETS_PER_SIDE
                )));
            }
        }
        let count = self.protocol.target_count();
        if count == 0 {
            errs.push(FwError::validation(format!(
                "rule \"{}\": no {} specified",
                self.id,
                self.proto_target_noun()
            )));
        } else if count > MAX_PROTO_TARGETS {
            errs.push(FwError::validation(format!(
                "rule \"{}\": maximum of {} {} allowed",
                self.id,
                MAX_PROTO_TARGETS,
                self.proto_target_noun()
            )));
        }
        if !self.from.iter().chain(&self.to).any(Target::names_instances) {
            errs.push(FwError::validation(format!(
                "rule \"{}\": rule does not affect any instances",
                self.id
            )));
        }
        FwError::check(errs)
    }

    fn proto_target_noun(&self) -> &'static str {
        match self.protocol {
            Protocol::Icmp { .. } => "types",
            _ => "ports",
        }
    }

    fn normalize(mut self) -> Self {
        self.protocol.normalize();
        dedup_targets(&mut self.from);
        dedup_targets(&mut self.to);
        self
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{}{}] {:?} {} from {} to {}",
            self.id,
            self.enabled,
            self.owner
                .as_deref()
                .map(|o| format!(",{}", o))
                .unwrap_or_default(),
            self.action,
            self.protocol.name(),
            self.from.len(),
            self.to.len()
        )
    }
}

fn dedup_targets(targets: &mut Vec<Target>) {
    let mut seen: Vec<Target> = Vec::with_capacity(targets.len());
    targets.retain(|t| {
        if seen.contains(t) {
            false
        } else {
            seen.push(t.clone());
            true
        }
    });
}

/// A rule as submitted by a caller: every field but `id` may be absent.
///
/// For additions the input must be complete; for updates it is merged over
/// the stored rule with the same id, the input's fields winning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleInput {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Vec<Target>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Vec<Target>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl RuleInput {
    /// Builds a validated rule, merging over `base` when given. `version` is
    /// used when the input does not carry one.
    pub fn build(self, base: Option<&Rule>, version: &str) -> Result<Rule> {
        let missing = |field: &str| {
            FwError::validation(format!("rule \"{}\": missing field \"{}\"", self.id, field))
        };

        let (action, protocol, from, to) = match base {
            Some(b) => (
                self.action.unwrap_or(b.action),
                self.protocol.clone().unwrap_or_else(|| b.protocol.clone()),
                self.from.clone().unwrap_or_else(|| b.from.clone()),
                self.to.clone().unwrap_or_else(|| b.to.clone()),
            ),
            None => {
                let mut errs = Vec::new();
                if self.action.is_none() {
                    errs.push(missing("action"));
                }
                if self.protocol.is_none() {
                    errs.push(missing("protocol"));
                }
                if self.from.is_none() {
                    errs.push(missing("from"));
                }
                if self.to.is_none() {
                    errs.push(missing("to"));
                }
                FwError::check(errs)?;
                (
                    self.action.unwrap_or(Action::Allow),
                    self.protocol.clone().unwrap_or(Protocol::Tcp { ports: Vec::new() }),
                    self.from.clone().unwrap_or_default(),
                    self.to.clone().unwrap_or_default(),
                )
            }
        };

        let rule = Rule {
            version: self.version.unwrap_or_else(|| version.to_string()),
            enabled: self
                .enabled
                .or(base.map(|b| b.enabled))
                .unwrap_or(false),
            owner: self.owner.or_else(|| base.and_then(|b| b.owner.clone())),
            action,
            protocol,
            priority: self
                .priority
                .or(base.map(|b| b.priority))
                .unwrap_or(0),
            from,
            to,
            log: self.log.or(base.map(|b| b.log)).unwrap_or(false),
            description: self
                .description
                .or_else(|| base.and_then(|b| b.description.clone())),
            created_by: self
                .created_by
                .or_else(|| base.and_then(|b| b.created_by.clone())),
            id: self.id,
        }
        .normalize();

        rule.validate()?;
        Ok(rule)
    }
}

impl From<&Rule> for RuleInput {
    fn from(rule: &Rule) -> Self {
        RuleInput {
            id: rule.id.clone(),
            version: Some(rule.version.clone()),
            enabled: Some(rule.enabled),
            owner: rule.owner.clone(),
            action: Some(rule.action),
            protocol: Some(rule.protocol.clone()),
            priority: Some(rule.priority),
            from: Some(rule.from.clone()),
            to: Some(rule.to.clone()),
            log: Some(rule.log),
            description: rule.description.clone(),
            created_by: rule.created_by.clone(),
        }
    }
}

// =============================================================================
// Instances
// =============================================================================

/// A tag value: `true`, a number or a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl TagValue {
    /// The key this value is indexed under.
    pub fn key(&self) -> String {
        match self {
            TagValue::Bool(b) => b.to_string(),
            TagValue::Number(n) => n.to_string(),
            TagValue::Text(s) => s.clone(),
        }
    }
}

/// The fields every indexed entity exposes, local or remote.
pub trait Endpoint {
    fn id(&self) -> &str;
    fn owner(&self) -> Option<&str>;
    fn tags(&self) -> &BTreeMap<String, TagValue>;
    fn ips(&self) -> &[IpAddr];
}

/// A locally-managed instance subject to filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, TagValue>,
    pub ips: Vec<IpAddr>,
    pub filter_enabled: bool,
    pub running: bool,
    /// Root directory the instance's filter configuration lives under.
    pub root: PathBuf,
}

impl Endpoint for Instance {
    fn id(&self) -> &str {
        &self.id
    }
    fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }
    fn tags(&self) -> &BTreeMap<String, TagValue> {
        &self.tags
    }
    fn ips(&self) -> &[IpAddr] {
        &self.ips
    }
}

/// A non-local instance mirrored so that local rules can reference it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteInstance {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, TagValue>,
    pub ips: Vec<IpAddr>,
}

impl Endpoint for RemoteInstance {
    fn id(&self) -> &str {
        &self.id
    }
    fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }
    fn tags(&self) -> &BTreeMap<String, TagValue> {
        &self.tags
    }
    fn ips(&self) -> &[IpAddr] {
        &self.ips
    }
}

// --- Deserialization-only records ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NicRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<String>>,
}

/// An instance descriptor as received from the caller, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, TagValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nics: Option<Vec<NicRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

impl InstanceRecord {
    fn label(&self) -> &str {
        self.id.as_deref().unwrap_or("<unknown>")
    }

    fn has_addresses(&self) -> bool {
        self.ips.is_some() || self.nics.is_some()
    }

    /// All usable addresses: prefixes stripped, auto-configuration
    /// placeholders dropped, sorted and de-duplicated.
    fn addresses(&self) -> Result<Vec<IpAddr>> {
        let nic_ips = self.nics.iter().flatten().flat_map(|nic| {
            nic.ips
                .iter()
                .flatten()
                .chain(nic.ip.iter())
                .cloned()
                .collect::<Vec<_>>()
        });
        let mut errs = Vec::new();
        let mut ips: Vec<IpAddr> = self
            .ips
            .iter()
            .flatten()
            .cloned()
            .chain(nic_ips)
            .filter_map(|raw| {
                let addr = raw.split('/').next().unwrap_or_default().trim().to_string();
                if addr == "dhcp" || addr == "addrconf" {
                    return None;
                }
                match addr.parse::<IpAddr>() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        errs.push(FwError::validation(format!(
                            "instance \"{}\": invalid IP address \"{}\"",
                            self.label(),
                            raw
                        )));
                        None
                    }
                }
            })
            .collect();
        FwError::check(errs)?;
        ips.sort();
        ips.dedup();
        Ok(ips)
    }
}

impl TryFrom<InstanceRecord> for Instance {
    type Error = FwError;

    fn try_from(record: InstanceRecord) -> Result<Self> {
        let mut missing = Vec::new();
        if record.id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            missing.push("id");
        }
        if !record.has_addresses() {
            missing.push("ips");
        }
        if record.running.is_none() {
            missing.push("running");
        }
        if record.tags.is_none() {
            missing.push("tags");
        }
        if record.root.is_none() {
            missing.push("root");
        }
        if !missing.is_empty() {
            return Err(FwError::validation(format!(
                "instance \"{}\": missing field{} required for filtering: {}",
                record.label(),
                if missing.len() == 1 { "" } else { "s" },
                missing.join(", ")
            )));
        }

        let ips = record.addresses()?;
        Ok(Instance {
            id: record.id.unwrap_or_default(),
            owner: record.owner,
            tags: record.tags.unwrap_or_default(),
            ips,
            filter_enabled: record.filter_enabled.unwrap_or(false),
            running: record.running.unwrap_or(false),
            root: record.root.unwrap_or_default(),
        })
    }
}

impl TryFrom<InstanceRecord> for RemoteInstance {
    type Error = FwError;

    fn try_from(record: InstanceRecord) -> Result<Self> {
        let id = match record.id.as_deref() {
            Some(id) => id.to_string(),
            None => return Err(FwError::validation("remote instance must have an id")),
        };
        check_id("remote instance", &id)?;
        if matches!(&record.owner, Some(o) if o.trim().is_empty()) {
            return Err(FwError::validation(format!(
                "remote instance \"{}\": owner must not be empty",
                id
            )));
        }
        let ips = record.addresses()?;
        if ips.is_empty() {
            return Err(FwError::validation(format!(
                "remote instance \"{}\": at least one IP address is required",
                id
            )));
        }
        Ok(RemoteInstance {
            id,
            owner: record.owner,
            tags: record.tags.unwrap_or_default(),
            ips,
        })
    }
}

impl From<&Instance> for InstanceRecord {
    fn from(inst: &Instance) -> Self {
        InstanceRecord {
            id: Some(inst.id.clone()),
            owner: inst.owner.clone(),
            tags: Some(inst.tags.clone()),
            ips: Some(inst.ips.iter().map(|ip| ip.to_string()).collect()),
            nics: None,
            filter_enabled: Some(inst.filter_enabled),
            running: Some(inst.running),
            root: Some(inst.root.clone()),
        }
    }
}
