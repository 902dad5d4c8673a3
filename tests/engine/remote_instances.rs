#[path = "../helpers/mod.rs"]
mod helpers;

use fwconverge::core::NicRecord;
use fwconverge::ChangeRequest;
use helpers::{change, remote, tcp_rule, TestEnv};
use serde_json::json;

fn setup() -> (TestEnv, Vec<fwconverge::InstanceRecord>) {
    let env = TestEnv::new();
    let instances = vec![
        env.instance("V1", "O1", "10.0.0.1", &[("web", "true")]),
        env.instance("V2", "O1", "10.0.0.2", &[("web", "true")]),
    ];
    (env, instances)
}

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

fn remotes(
    records: Vec<fwconverge::InstanceRecord>,
    instances: &[fwconverge::InstanceRecord],
) -> ChangeRequest {
    ChangeRequest {
        remote_instances: records,
        instances: instances.to_vec(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_remote_instance_of_other_tenant_changes_nothing() {
    let (env, instances) = setup();
    env.engine.add(change(json!([web_rule()]), &instances)).await.unwrap();
    let before = (env.read_conf("V1"), env.read_conf("V2"));
    env.control.clear();

    let report = env
        .engine
        .add(remotes(vec![remote("R2", "O2", "10.9.0.2", &[("web", "true")])], &instances))
        .await
        .unwrap();

    assert!(report.instances.is_empty());
    assert_eq!(report.remote_instances, vec!["R2"]);
    assert!(env.mirror_path("R2").exists());
    assert_eq!((env.read_conf("V1"), env.read_conf("V2")), before);
    assert!(env.control.calls().is_empty());
}

#[tokio::test]
async fn test_remote_instance_of_same_tenant_is_rendered() {
    let (env, instances) = setup();
    env.engine.add(change(json!([web_rule()]), &instances)).await.unwrap();

    let report = env
        .engine
        .add(remotes(vec![remote("R1", "O1", "10.9.0.1", &[("web", "true")])], &instances))
        .await
        .unwrap();
    assert_eq!(report.instances, vec!["V1", "V2"]);
    assert!(env.read_conf("V1").contains("pass in quick proto tcp from 10.9.0.1 to any port = 80"));

    // Same record again: nothing to do.
    let report = env
        .engine
        .add(remotes(vec![remote("R1", "O1", "10.9.0.1", &[("web", "true")])], &instances))
        .await
        .unwrap();
    assert!(report.is_empty());

    // A new address replaces the old one.
    let report = env
        .engine
        .update(remotes(vec![remote("R1", "O1", "10.9.0.7", &[("web", "true")])], &instances))
        .await
        .unwrap();
    assert_eq!(report.instances, vec!["V1", "V2"]);
    let conf = env.read_conf("V2");
    assert!(conf.contains("from 10.9.0.7 to any port = 80"));
    assert!(!conf.contains("10.9.0.1"));
    assert_eq!(
        env.engine.get_remote("R1").await.unwrap().ips,
        vec!["10.9.0.7".parse::<std::net::IpAddr>().unwrap()]
    );
}

#[tokio::test]
async fn test_remote_addresses_from_nics() {
    let (env, instances) = setup();
    let mut record = remote("R1", "O1", "10.9.0.5/24", &[]);
    record.nics = Some(vec![
        NicRecord {
            ip: Some("dhcp".to_string()),
            ips: None,
        },
        NicRecord {
            ip: None,
            ips: Some(vec![
                "10.9.0.3/24".to_string(),
                "addrconf".to_string(),
                "10.9.0.5".to_string(),
            ]),
        },
    ]);

    env.engine.add(remotes(vec![record], &instances)).await.unwrap();

    let stored = env.engine.get_remote("R1").await.unwrap();
    let ips: Vec<String> = stored.ips.iter().map(|ip| ip.to_string()).collect();
    assert_eq!(ips, vec!["10.9.0.3", "10.9.0.5"]);
}

#[tokio::test]
async fn test_invalid_remote_records() {
    let (env, instances) = setup();
    let mut no_ips = remote("R1", "O1", "10.9.0.1", &[]);
    no_ips.ips = Some(vec!["dhcp".to_string()]);
    let collides = remote("V1", "O1", "10.9.0.2", &[]);

    let err = env
        .engine
        .add(remotes(vec![no_ips], &instances))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("at least one IP address is required"));

    let err = env
        .engine
        .add(remotes(vec![collides], &instances))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("remote instance \"V1\" has the same id as a local instance"));

    assert!(env.engine.list_remote().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remote_rules_for() {
    let (env, instances) = setup();
    env.engine.add(change(json!([web_rule()]), &instances)).await.unwrap();
    env.engine
        .add(remotes(vec![remote("R1", "O1", "10.9.0.1", &[("web", "true")])], &instances))
        .await
        .unwrap();

    let by_id = env
        .engine
        .remote_rules_for(fwconverge::RemoteRef::Id("R1".to_string()))
        .await
        .unwrap();
    assert_eq!(by_id.len(), 1);

    let other_tenant = env
        .engine
        .remote_rules_for(fwconverge::RemoteRef::Record(remote(
            "R5",
            "O2",
            "10.9.0.5",
            &[("web", "true")],
        )))
        .await
        .unwrap();
    assert!(other_tenant.is_empty());
}
