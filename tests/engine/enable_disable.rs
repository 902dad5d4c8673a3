#[path = "../helpers/mod.rs"]
mod helpers;

use fwconverge::InstanceRequest;
use helpers::{annotated_rules, change, tcp_rule, TestEnv};
use serde_json::json;

fn ssh_rule() -> serde_json::Value {
    tcp_rule(
        "ssh",
        Some("O1"),
        "allow",
        "22",
        json!([{"subnet": "10.1.0.0/16"}]),
        json!([{"tag": {"name": "ssh"}}]),
    )
}

#[tokio::test]
async fn test_enable_renders_and_reloads() {
    let env = TestEnv::new();
    let mut record = env.instance("V1", "O1", "10.0.0.1", &[("ssh", "true")]);
    record.filter_enabled = Some(false);
    let instances = vec![record];

    // Filter disabled: the rule is stored but nothing is rendered.
    let report = env.engine.add(change(json!([ssh_rule()]), &instances)).await.unwrap();
    assert!(report.instances.is_empty());
    assert!(!env.conf_exists("V1"));

    let report = env
        .engine
        .enable(InstanceRequest {
            id: "V1".to_string(),
            instances,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(report.instances, vec!["V1"]);
    let conf = env.read_conf("V1");
    assert_eq!(annotated_rules(&conf), vec!["ssh"]);
    assert!(conf.contains(
        ", subnet=10.1.0.0/16\npass in quick proto tcp from 10.1.0.0/16 to any port = 22\n"
    ));
    let actions: Vec<String> = env.control.calls().into_iter().map(|(a, _)| a).collect();
    assert_eq!(actions, vec!["enable", "reload"]);
}

#[tokio::test]
async fn test_enable_stopped_instance_skips_control() {
    let env = TestEnv::new();
    let mut record = env.instance("V1", "O1", "10.0.0.1", &[("ssh", "true")]);
    record.running = Some(false);

    env.engine
        .enable(InstanceRequest {
            id: "V1".to_string(),
            instances: vec![record],
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(env.conf_exists("V1"));
    assert!(env.control.calls().is_empty());
}

#[tokio::test]
async fn test_enable_failure_is_reported() {
    let env = TestEnv::new();
    let instances = vec![env.instance("V1", "O1", "10.0.0.1", &[])];
    env.control.fail_for("V1");

    let report = env
        .engine
        .enable(InstanceRequest {
            id: "V1".to_string(),
            instances,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(report.reload_failures.len(), 1);
    assert!(report.reload_failures[0].message.contains("enable failed"));
    // Enabling failed, so no reload was attempted.
    assert_eq!(env.control.calls_for("reload"), Vec::<String>::new());
    assert!(env.conf_exists("V1"));
}

#[tokio::test]
async fn test_disable_moves_config_aside() {
    let env = TestEnv::new();
    let instances = vec![env.instance("V1", "O1", "10.0.0.1", &[("ssh", "true")])];
    env.engine.add(change(json!([ssh_rule()]), &instances)).await.unwrap();
    let rendered = env.read_conf("V1");
    env.control.clear();

    let report = env
        .engine
        .disable(InstanceRequest {
            id: "V1".to_string(),
            instances: instances.clone(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(report.instances, vec!["V1"]);
    assert!(report.rules.is_empty());
    assert!(!env.conf_exists("V1"));
    let backup = std::fs::read_to_string(env.conf_path("V1").with_extension("conf.old")).unwrap();
    assert_eq!(backup, rendered);
    assert_eq!(env.control.calls_for("disable"), vec!["V1"]);
    // Rules are untouched.
    assert!(env.rule_path("ssh").exists());

    // A second disable finds no file to move and still succeeds.
    env.engine
        .disable(InstanceRequest {
            id: "V1".to_string(),
            instances,
            ..Default::default()
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unknown_instance() {
    let env = TestEnv::new();
    let instances = vec![env.instance("V1", "O1", "10.0.0.1", &[])];

    for result in [
        env.engine
            .enable(InstanceRequest {
                id: "V9".to_string(),
                instances: instances.clone(),
                ..Default::default()
            })
            .await,
        env.engine
            .disable(InstanceRequest {
                id: "V9".to_string(),
                instances: instances.clone(),
                ..Default::default()
            })
            .await,
    ] {
        assert!(result.unwrap_err().is_not_found());
    }
}
