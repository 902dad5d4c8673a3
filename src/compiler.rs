//! Packet-filter configuration rendering.
//!
//! Compilation is pure: given an instance, the rules that apply to it and
//! the catalog those rules resolve against, it produces the complete text of
//! the instance's configuration file.

use crate::core::{Action, Instance, PortTarget, Protocol, Rule, Side, Target, Wildcard};
use crate::lookup::Catalog;
use crate::resolve::{covers, resolve, Resolved};
use chrono::{DateTime, Utc};
use itertools::Itertools;

const HEADER: &str = "# DO NOT EDIT THIS FILE. AUTO-GENERATED.";

/// Default policy, appended after every explicit rule.
pub const TRAILER: [&str; 6] = [
    "block in all",
    "pass out quick proto tcp from any to any flags S/SA keep state",
    "pass out proto tcp from any to any",
    "pass out proto udp from any to any keep state",
    "pass out quick proto icmp from any to any keep state",
    "pass out proto icmp from any to any",
];

/// Inputs shared by every instance compiled in one operation.
#[derive(Debug, Clone, Copy)]
pub struct CompileContext<'a> {
    pub catalog: &'a Catalog,
    pub generated_at: DateTime<Utc>,
    /// Append `set-tag(log=<n>)` to statements of rules with `log` set.
    pub audit_tags: bool,
}

/// One annotated block of statements originating from a single rule target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementGroup {
    pub rule_id: String,
    pub version: String,
    pub target_type: &'static str,
    pub target_value: String,
    pub statements: Vec<String>,
}

impl StatementGroup {
    pub fn annotation(&self) -> String {
        format!(
            "# rule={}, version={}, {}={}",
            self.rule_id, self.version, self.target_type, self.target_value
        )
    }
}

/// Protocol clauses for each port or ICMP type of `protocol`, in order.
fn proto_clauses(protocol: &Protocol) -> Vec<String> {
    match protocol {
        Protocol::Tcp { ports } | Protocol::Udp { ports } => ports
            .iter()
            .map(|port| match port {
                PortTarget::All => String::new(),
                PortTarget::Port(p) => format!("port = {}", p),
            })
            .collect(),
        Protocol::Icmp { types } => types
            .iter()
            .map(|t| match t.code {
                Some(code) => format!("icmp-type {} code {}", t.icmp_type, code),
                None => format!("icmp-type {}", t.icmp_type),
            })
            .collect(),
    }
}

struct StatementWriter<'r> {
    rule: &'r Rule,
    side: Side,
    clauses: Vec<String>,
    suffix: String,
}

impl StatementWriter<'_> {
    /// One statement per protocol clause for the remote end `peer`.
    fn statements(&self, peer: &str) -> Vec<String> {
        match self.side {
            Side::To => self.render(peer, "any"),
            Side::From => self.render("any", peer),
        }
    }

    fn render(&self, src: &str, dst: &str) -> Vec<String> {
        let verb = match self.rule.action {
            Action::Allow => "pass",
            Action::Block => "block",
        };
        self.clauses
            .iter()
            .map(|clause| {
                let mut line = format!(
                    "{} {} quick proto {} from {} to {}",
                    verb,
                    self.side.keyword(),
                    self.rule.protocol.name(),
                    src,
                    dst
                );
                if !clause.is_empty() {
                    line.push(' ');
                    line.push_str(clause);
                }
                line.push_str(&self.suffix);
                line
            })
            .collect()
    }

    fn group(&self, target: &Target, statements: Vec<String>) -> StatementGroup {
        let (target_type, target_value) = target.annotation();
        StatementGroup {
            rule_id: self.rule.id.clone(),
            version: self.rule.version.clone(),
            target_type,
            target_value,
            statements,
        }
    }
}

/// Orders rules for rendering: descending priority, ties broken by id.
pub fn render_order<'r>(rules: impl IntoIterator<Item = &'r Rule>) -> Vec<&'r Rule> {
    rules
        .into_iter()
        .sorted_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)))
        .collect()
}

/// Statement groups for `instance`, in rendering order.
pub fn statement_groups(
    instance: &Instance,
    rules: &[Rule],
    ctx: &CompileContext<'_>,
) -> Vec<StatementGroup> {
    let applicable = rules.iter().filter(|rule| {
        let side = rule.render_side();
        rule.enabled && !rule.is_noop(side) && covers(*rule, side, instance)
    });

    let mut groups = Vec::new();
    for (position, rule) in render_order(applicable).into_iter().enumerate() {
        let side = rule.render_side();
        let suffix = if ctx.audit_tags && rule.log {
            format!(" set-tag(log={})", position + 1)
        } else {
            String::new()
        };
        let writer = StatementWriter {
            rule,
            side,
            clauses: proto_clauses(&rule.protocol),
            suffix,
        };

        let peers = rule.side(side.opposite());
        if let Some(any) = peers
            .iter()
            .find(|t| matches!(t, Target::Wildcard(Wildcard::Any)))
        {
            let statements = writer.render("any", "any");
            groups.push(writer.group(any, statements));
            continue;
        }

        for target in peers {
            let resolved = resolve(rule, side.opposite(), target, ctx.catalog);
            let statements: Vec<String> = match resolved {
                Resolved::Address(addr) => writer.statements(&addr),
                Resolved::Unscoped => writer.statements("any"),
                endpoints => endpoints
                    .ips()
                    .iter()
                    .flat_map(|ip| writer.statements(&ip.to_string()))
                    .collect(),
            };
            if !statements.is_empty() {
                groups.push(writer.group(target, statements));
            }
        }
    }
    groups
}

/// Renders the full configuration file for `instance`.
pub fn compile(instance: &Instance, rules: &[Rule], ctx: &CompileContext<'_>) -> String {
    let mut lines: Vec<String> = vec![
        HEADER.to_string(),
        "#".to_string(),
        format!("# File generated at {}", ctx.generated_at.to_rfc2822()),
        "#".to_string(),
    ];

    for group in statement_groups(instance, rules, ctx) {
        lines.push(String::new());
        lines.push(group.annotation());
        lines.extend(group.statements);
    }

    lines.push(String::new());
    lines.extend(TRAILER.iter().map(|l| l.to_string()));

    let mut text = lines.join("\n");
    text.push('\n');
    text
}
