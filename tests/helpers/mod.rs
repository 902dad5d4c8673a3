#![allow(dead_code)]


use fwconverge::core::TagValue;
use fwconverge::store::Store;
use fwconverge::{ChangeRequest, Engine, InstanceRecord};
use mock_control::RecordingControl;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Relative configuration path used by every test engine.
pub const CONF_PATH: &str = "config/pf.conf";

/// An engine whose store, lock file and instance roots all live in one
/// temporary directory.
pub struct TestEnv {
    pub dir: TempDir,
    pub engine: Engine,
    pub control: Arc<RecordingControl>,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let control = Arc::new(RecordingControl::default());
        let store = Store::new(
            dir.path().join("rules"),
            dir.path().join("vms"),
            dir.path().join(".lockfile"),
            CONF_PATH,
        );
        let engine = Engine::new(store, control.clone());
        Self { dir, engine, control }
    }

    pub fn with_audit_tags(mut self) -> Self {
        self.engine = self.engine.clone().with_audit_tags(true);
        self
    }

    /// A running, filter-enabled local instance rooted under the temp dir.
    pub fn instance(
        &self,
        id: &str,
        owner: &str,
        ip: &str,
        tags: &[(&str, &str)],
    ) -> InstanceRecord {
        InstanceRecord {
            id: Some(id.to_string()),
            owner: Some(owner.to_string()),
            tags: Some(tag_map(tags)),
            ips: Some(vec![ip.to_string()]),
            nics: None,
            filter_enabled: Some(true),
            running: Some(true),
            root: Some(self.dir.path().join("zones").join(id)),
        }
    }

    pub fn conf_path(&self, id: &str) -> PathBuf {
        self.dir.path().join("zones").join(id).join(CONF_PATH)
    }

    pub fn read_conf(&self, id: &str) -> String {
        std::fs::read_to_string(self.conf_path(id)).unwrap()
    }

    pub fn conf_exists(&self, id: &str) -> bool {
        self.conf_path(id).exists()
    }

    pub fn rule_path(&self, id: &str) -> PathBuf {
        self.dir.path().join("rules").join(format!("{}.json", id))
    }

    pub fn mirror_path(&self, id: &str) -> PathBuf {
        self.dir.path().join("vms").join(format!("{}.json", id))
    }
}

/// A remote instance record.
pub fn remote(id: &str, owner: &str, ip: &str, tags: &[(&str, &str)]) -> InstanceRecord {
    InstanceRecord {
        id: Some(id.to_string()),
        owner: Some(owner.to_string()),
        tags: Some(tag_map(tags)),
        ips: Some(vec![ip.to_string()]),
        ..Default::default()
    }
}

/// Tag values of `"true"` become boolean tags.
pub fn tag_map(tags: &[(&str, &str)]) -> BTreeMap<String, TagValue> {
    tags.iter()
        .map(|(k, v)| {
            let value = match *v {
                "true" => TagValue::Bool(true),
                other => TagValue::Text(other.to_string()),
            };
            (k.to_string(), value)
        })
        .collect()
}

/// Builds a change request from rule JSON and instance records.
pub fn change(rules: Value, instances: &[InstanceRecord]) -> ChangeRequest {
    ChangeRequest {
        rules: serde_json::from_value(rules).unwrap(),
        instances: instances.to_vec(),
        ..Default::default()
    }
}

/// An enabled TCP rule between two target lists.
pub fn tcp_rule(
    id: &str,
    owner: Option<&str>,
    action: &str,
    port: &str,
    from: Value,
    to: Value,
) -> Value {
    let mut rule = serde_json::json!({
        "id": id,
        "enabled": true,
        "action": action,
        "protocol": {"name": "tcp", "ports": [port]},
        "from": from,
        "to": to,
    });
    if let Some(owner) = owner {
        rule["owner"] = Value::from(owner);
    }
    rule
}

/// Header and trailer only: the file carries no rule statements.
pub fn is_default_only(conf: &str) -> bool {
    let body: Vec<&str> = conf
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    body == fwconverge::compiler::TRAILER
}

/// Rule ids in the order their annotations appear.
pub fn annotated_rules(conf: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for line in conf.lines() {
        if let Some(rest) = line.strip_prefix("# rule=") {
            let id = rest.split(',').next().unwrap_or_default().to_string();
            if ids.last() != Some(&id) {
                ids.push(id);
            }
        }
    }
    ids
}
