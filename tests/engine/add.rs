#[path = "../helpers/mod.rs"]
mod helpers;

use fwconverge::{ChangeRequest, FwError};
use helpers::{annotated_rules, change, remote, tcp_rule, TestEnv};
use serde_json::json;

fn web_rule() -> serde_json::Value {
    tcp_rule(
        "r1",
        Some("O1"),
        "allow",
        "80",
        json!([{"tag": {"name": "web", "value": "true"}}]),
        json!([{"tag": {"name": "web", "value": "true"}}]),
    )
}

#[tokio::test]
async fn test_add_renders_both_tagged_instances() {
    let env = TestEnv::new();
    let instances = vec![
        env.instance("V1", "O1", "10.0.0.1", &[("web", "true")]),
        env.instance("V2", "O1", "10.0.0.2", &[("web", "true")]),
    ];

    let report = env.engine.add(change(json!([web_rule()]), &instances)).await.unwrap();

    assert_eq!(report.instances, vec!["V1", "V2"]);
    assert_eq!(report.rules.len(), 1);
    assert_eq!(report.rules[0]["id"], "r1");
    assert!(report.reload_failures.is_empty());

    let version = report.rules[0]["version"].as_str().unwrap().to_string();
    for id in ["V1", "V2"] {
        let conf = env.read_conf(id);
        assert!(conf.contains(&format!("# rule=r1, version={}, tag=web=true", version)));
        assert!(conf.contains("pass in quick proto tcp from 10.0.0.1 to any port = 80"));
        assert!(conf.contains("pass in quick proto tcp from 10.0.0.2 to any port = 80"));
        assert!(conf.ends_with("pass out proto icmp from any to any\n"));
    }

    assert!(env.rule_path("r1").exists());
    assert_eq!(env.control.calls_for("reload"), vec!["V1", "V2"]);
}

#[tokio::test]
async fn test_readding_unchanged_rule_is_a_noop() {
    let env = TestEnv::new();
    let instances = vec![
        env.instance("V1", "O1", "10.0.0.1", &[("web", "true")]),
        env.instance("V2", "O1", "10.0.0.2", &[("web", "true")]),
    ];
    let first = env.engine.add(change(json!([web_rule()]), &instances)).await.unwrap();
    let before = (env.read_conf("V1"), env.read_conf("V2"));
    let stored = std::fs::read_to_string(env.rule_path("r1")).unwrap();
    env.control.clear();

    // Same content without a version, then the stored version itself.
    let mut versioned = web_rule();
    versioned["version"] = first.rules[0]["version"].clone();
    for rule in [web_rule(), versioned] {
        let report = env.engine.add(change(json!([rule]), &instances)).await.unwrap();
        assert!(report.is_empty());
    }

    assert_eq!((env.read_conf("V1"), env.read_conf("V2")), before);
    assert_eq!(std::fs::read_to_string(env.rule_path("r1")).unwrap(), stored);
    assert!(env.control.calls().is_empty());
}

#[tokio::test]
async fn test_unresolved_targets_are_rejected() {
    let env = TestEnv::new();
    let instances = vec![env.instance("V1", "O1", "10.0.0.1", &[("web", "true")])];
    let rule = tcp_rule(
        "r1",
        Some("O1"),
        "allow",
        "22",
        json!([{"tag": {"name": "bastion"}}]),
        json!([{"instance": "V9"}, {"instance": "V1"}]),
    );

    let err = env
        .engine
        .add(change(json!([rule.clone()]), &instances))
        .await
        .unwrap_err();
    let messages: Vec<String> = err.errors().iter().map(|e| e.to_string()).collect();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().any(|m| m.contains("missing tag \"bastion\" on \"from\" side")));
    assert!(messages.iter().any(|m| m.contains("missing instance \"V9\" on \"to\" side")));
    assert!(!env.rule_path("r1").exists());

    let report = env
        .engine
        .add(ChangeRequest {
            allow_unresolved: true,
            ..change(json!([rule]), &instances)
        })
        .await
        .unwrap();
    assert_eq!(report.instances, vec!["V1"]);
    assert!(env.rule_path("r1").exists());
    // Nothing resolves on the far side, so no statement is rendered.
    assert!(annotated_rules(&env.read_conf("V1")).is_empty());
}

#[tokio::test]
async fn test_dry_run_persists_nothing() {
    let env = TestEnv::new();
    let instances = vec![
        env.instance("V1", "O1", "10.0.0.1", &[("web", "true")]),
        env.instance("V2", "O1", "10.0.0.2", &[("web", "true")]),
    ];

    let report = env
        .engine
        .add(ChangeRequest {
            dry_run: true,
            file_contents: true,
            ..change(json!([web_rule()]), &instances)
        })
        .await
        .unwrap();

    assert_eq!(report.instances, vec!["V1", "V2"]);
    let files = report.files.unwrap();
    assert_eq!(files.len(), 2);
    assert!(files[&env.conf_path("V1")].contains("port = 80"));
    assert!(!env.conf_exists("V1"));
    assert!(!env.rule_path("r1").exists());
    assert!(env.control.calls().is_empty());
}

#[tokio::test]
async fn test_new_local_instance_pulls_in_referencing_instances() {
    let env = TestEnv::new();
    let mut instances = vec![
        env.instance("V1", "O1", "10.0.0.1", &[("web", "true")]),
        env.instance("V2", "O1", "10.0.0.2", &[("web", "true")]),
    ];
    env.engine.add(change(json!([web_rule()]), &instances)).await.unwrap();

    instances.push(env.instance("V3", "O1", "10.0.0.3", &[("web", "true")]));
    let report = env
        .engine
        .add(ChangeRequest {
            local_instances: vec!["V3".to_string()],
            instances: instances.clone(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(report.rules.is_empty());
    assert_eq!(report.instances, vec!["V1", "V2", "V3"]);
    assert!(env.read_conf("V1").contains("from 10.0.0.3 to any port = 80"));
    assert!(env.read_conf("V3").contains("from 10.0.0.1 to any port = 80"));

    let err = env
        .engine
        .add(ChangeRequest {
            local_instances: vec!["V4".to_string()],
            instances,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_invalid_payloads() {
    let env = TestEnv::new();
    let instances = vec![env.instance("V1", "O1", "10.0.0.1", &[("web", "true")])];

    let err = env.engine.add(ChangeRequest::default()).await.unwrap_err();
    assert!(matches!(err, FwError::InvalidRequest(_)));

    let incomplete = json!([{"id": "r1", "from": [{"wildcard": "any"}]}]);
    let err = env.engine.add(change(incomplete, &instances)).await.unwrap_err();
    let messages: Vec<String> = err.errors().iter().map(|e| e.to_string()).collect();
    assert_eq!(messages.len(), 3);
    assert!(messages.iter().any(|m| m.contains("missing field \"action\"")));

    let duplicated = json!([web_rule(), web_rule()]);
    let err = env.engine.add(change(duplicated, &instances)).await.unwrap_err();
    assert!(err.to_string().contains("appears more than once"));
}

#[tokio::test]
async fn test_reload_failure_is_reported_not_raised() {
    let env = TestEnv::new();
    let instances = vec![
        env.instance("V1", "O1", "10.0.0.1", &[("web", "true")]),
        env.instance("V2", "O1", "10.0.0.2", &[("web", "true")]),
    ];
    env.control.fail_for("V2");

    let report = env.engine.add(change(json!([web_rule()]), &instances)).await.unwrap();

    assert_eq!(report.instances, vec!["V1", "V2"]);
    assert_eq!(report.reload_failures.len(), 1);
    assert_eq!(report.reload_failures[0].instance, "V2");
    assert!(env.read_conf("V2").contains("port = 80"));
}

#[tokio::test]
async fn test_validate_touches_nothing() {
    let env = TestEnv::new();
    let instances = vec![env.instance("V1", "O1", "10.0.0.1", &[("web", "true")])];

    env.engine
        .validate(change(json!([web_rule()]), &instances))
        .await
        .unwrap();
    assert!(!env.rule_path("r1").exists());
    assert!(!env.conf_exists("V1"));

    let bad = tcp_rule(
        "r2",
        None,
        "allow",
        "80",
        json!([{"wildcard": "any"}]),
        json!([{"tag": {"name": "db"}}]),
    );
    assert!(env.engine.validate(change(json!([bad]), &instances)).await.is_err());
}

#[tokio::test]
async fn test_ids_that_are_not_plain_file_names_are_rejected() {
    let env = TestEnv::new();
    let instances = vec![env.instance("V1", "O1", "10.0.0.1", &[("web", "true")])];

    for id in ["team/r1", "../escaped", "..", ".hidden"] {
        let mut rule = web_rule();
        rule["id"] = json!(id);
        let err = env.engine.add(change(json!([rule]), &instances)).await.unwrap_err();
        assert!(matches!(err, FwError::Validation(_)), "{}: {}", id, err);
    }

    let err = env
        .engine
        .add(ChangeRequest {
            remote_instances: vec![remote("../R1", "O1", "10.9.0.1", &[("web", "true")])],
            ..change(json!([]), &instances)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FwError::Validation(_)));

    assert!(!env.dir.path().join("escaped.json").exists());
    assert!(!env.dir.path().join("rules").exists());
    assert!(!env.dir.path().join("vms").exists());
    assert!(!env.conf_exists("V1"));
    assert!(env.control.calls().is_empty());

    env.engine.add(change(json!([web_rule()]), &instances)).await.unwrap();
    assert!(env.engine.get("../rules/r1").await.unwrap_err().is_not_found());
    assert!(env.engine.get_remote("../rules/r1").await.unwrap_err().is_not_found());
}
