#[path = "../helpers/mod.rs"]
mod helpers;

use fwconverge::compiler::TRAILER;
use helpers::{annotated_rules, change, tcp_rule, TestEnv};
use serde_json::{json, Value};

fn prioritized(id: &str, priority: u32) -> Value {
    let mut rule = tcp_rule(
        id,
        Some("O1"),
        "allow",
        "8080",
        json!([{"ip": "192.0.2.1"}]),
        json!([{"instance": "V1"}]),
    );
    rule["priority"] = json!(priority);
    rule
}

#[tokio::test]
async fn test_rules_render_in_descending_priority() {
    let env = TestEnv::new();
    let instances = vec![env.instance("V1", "O1", "10.0.0.1", &[])];
    let rules = json!([
        prioritized("p1", 1),
        prioritized("p100", 100),
        prioritized("p10", 10),
        prioritized("p2", 2),
    ]);

    env.engine.add(change(rules, &instances)).await.unwrap();

    let conf = env.read_conf("V1");
    assert_eq!(annotated_rules(&conf), vec!["p100", "p10", "p2", "p1"]);

    let tail: Vec<&str> = conf.lines().rev().take(TRAILER.len()).collect();
    let expected: Vec<&str> = TRAILER.iter().rev().copied().collect();
    assert_eq!(tail, expected);
}

#[tokio::test]
async fn test_equal_priorities_are_ordered_by_id() {
    let env = TestEnv::new();
    let instances = vec![env.instance("V1", "O1", "10.0.0.1", &[])];
    let rules = json!([
        prioritized("b", 5),
        prioritized("c", 5),
        prioritized("a", 5),
        prioritized("z", 6),
    ]);

    env.engine.add(change(rules, &instances)).await.unwrap();

    assert_eq!(annotated_rules(&env.read_conf("V1")), vec!["z", "a", "b", "c"]);
}

#[tokio::test]
async fn test_audit_tags_follow_render_position() {
    let env = TestEnv::new().with_audit_tags();
    let instances = vec![env.instance("V1", "O1", "10.0.0.1", &[])];
    let mut logged = prioritized("logged", 1);
    logged["log"] = json!(true);
    let rules = json!([prioritized("first", 10), logged]);

    env.engine.add(change(rules, &instances)).await.unwrap();

    let conf = env.read_conf("V1");
    assert!(conf.contains(
        "pass in quick proto tcp from 192.0.2.1 to any port = 8080 set-tag(log=2)\n"
    ));
    assert_eq!(conf.matches("set-tag").count(), 1);
}

#[tokio::test]
async fn test_icmp_and_udp_clauses() {
    let env = TestEnv::new();
    let instances = vec![env.instance("V1", "O1", "10.0.0.1", &[("role", "dns")])];
    let rules = json!([
        {
            "id": "ping",
            "enabled": true,
            "owner": "O1",
            "action": "allow",
            "priority": 2,
            "protocol": {"name": "icmp", "types": ["8", "3:4"]},
            "from": [{"wildcard": "any"}],
            "to": [{"tag": {"name": "role", "value": "dns"}}]
        },
        {
            "id": "dns",
            "enabled": true,
            "owner": "O1",
            "action": "allow",
            "priority": 1,
            "protocol": {"name": "udp", "ports": ["53"]},
            "from": [{"ip": "fd00::1"}],
            "to": [{"tag": {"name": "role"}}]
        }
    ]);

    env.engine.add(change(rules, &instances)).await.unwrap();

    let conf = env.read_conf("V1");
    let ping = conf.find("pass in quick proto icmp from any to any icmp-type 3 code 4\n").unwrap();
    let echo = conf.find("pass in quick proto icmp from any to any icmp-type 8\n").unwrap();
    let dns = conf.find("pass in quick proto udp from fd00::1 to any port = 53\n").unwrap();
    assert!(ping < echo && echo < dns);
}
