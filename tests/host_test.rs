//! Tests for host environment lookups.

use reqmux::host::{HostEnv, MapEnv, TASK_ID_NOTE, engine_type_for};

#[test]
fn map_env_looks_up_per_item_variables() {
    let mut env = MapEnv::new();
    env.set("req-1", TASK_ID_NOTE, "7-3").set("req-1", "engine-type", "proxy");

    let item = "req-1".to_string();
    assert_eq!(env.lookup(&item, TASK_ID_NOTE).as_deref(), Some("7-3"));
    assert_eq!(env.lookup(&item, "missing"), None);
    assert_eq!(env.lookup(&"req-2".to_string(), TASK_ID_NOTE), None);
}

#[test]
fn items_are_not_multiplexed_unless_marked() {
    let mut env = MapEnv::new();
    env.set_multiplexed("req-1", true);

    assert!(HostEnv::<String>::is_multiplexed(&env, &"req-1".to_string()));
    assert!(!HostEnv::<String>::is_multiplexed(&env, &"req-2".to_string()));
}

#[test]
fn engine_type_comes_from_host_variable_for_multiplexed_items() {
    let mut env = MapEnv::new();
    env.set("req-1", "engine-type", "fcgi")
        .set_multiplexed("req-1", true)
        .set("req-2", "engine-type", "fcgi");

    let multiplexed = "req-1".to_string();
    let plain = "req-2".to_string();
    let unset = "req-3".to_string();
    env.set_multiplexed("req-3", true);

    assert_eq!(engine_type_for(&env, &multiplexed, "engine-type", "proxy"), "fcgi");
    assert_eq!(engine_type_for(&env, &plain, "engine-type", "proxy"), "proxy");
    assert_eq!(engine_type_for(&env, &unset, "engine-type", "proxy"), "proxy");
}
