//! Module resolution tiers and built-in tables

mod common;

use bjig_lib::message::UplinkNotification;
use bjig_lib::module::{CommandKind, ModuleConfig, ModuleDescriptor, ModuleHandler, ModuleRegistry};
use common::*;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn builtin_illuminance_is_specialized() {
    let registry = ModuleRegistry::with_builtin_modules().unwrap();
    let module = registry.resolve("illuminance");

    assert!(matches!(module.descriptor, ModuleDescriptor::Specialized { .. }));
    assert_eq!(module.handler().unwrap().name(), "illuminance");

    let config = module.config();
    assert_eq!(config.sensor_id, 0x0121);
    let names: Vec<&str> = config.command_names().collect();
    assert_eq!(
        names,
        vec!["device_restart", "get_parameter", "instant_uplink", "sensor_dfu", "set_parameter"]
    );

    let instant = config.command("instant_uplink").unwrap();
    assert_eq!(instant.cmd, 0x00);
    assert!(instant.has_uplink);
    assert_eq!(instant.uplink_sensor_id, 0x0121);
    assert_eq!(instant.timeout, Duration::from_secs(90));

    let get_parameter = config.command("get_parameter").unwrap();
    assert_eq!(get_parameter.cmd, 0x0D);
    assert_eq!(get_parameter.sensor_id, 0x0000);
    assert_eq!(get_parameter.data.as_deref(), Some(&[0x00][..]));

    assert_eq!(config.command("sensor_dfu").unwrap().kind, CommandKind::SensorDfu);
    assert_eq!(config.command("device_restart").unwrap().cmd, 0xFD);
}

#[test]
fn builtin_router_is_generic_jig_info() {
    let registry = ModuleRegistry::with_builtin_modules().unwrap();
    let router = registry.resolve("router");
    assert!(matches!(router.descriptor, ModuleDescriptor::Generic(_)));
    assert!(router.is_generic());

    let config = router.config();
    assert!(config.commands.values().all(|c| c.kind == CommandKind::JigInfo && c.expects_response));
    assert_eq!(config.command("get_version").unwrap().cmd, 0x02);
    assert_eq!(config.command("keep_alive").unwrap().cmd, 0xD0);
    assert_eq!(config.command("get_device_id_all").unwrap().cmd, 0xCF);
}

#[test]
fn unknown_module_resolves_to_empty_generic_table() {
    let registry = ModuleRegistry::with_builtin_modules().unwrap();
    let module = registry.resolve("thermometer");

    assert!(matches!(module.descriptor, ModuleDescriptor::Unknown(_)));
    assert!(module.is_generic());
    assert_eq!(module.name, "thermometer");
    assert_eq!(module.config().sensor_id, 0x0000);
    assert!(module.config().commands.is_empty());
}

#[test]
fn config_only_module_is_generic() {
    let mut registry = ModuleRegistry::new();
    registry.register_config(
        ModuleConfig::from_json_str(
            r#"{"name":"relay","sensor_id":"0x0150","commands":{"toggle":{"cmd":"0x20","expects_response":true}}}"#,
        )
        .unwrap(),
    );
    let relay = registry.resolve("relay");
    assert!(matches!(relay.descriptor, ModuleDescriptor::Generic(_)));
    assert_eq!(relay.config().command("toggle").unwrap().sensor_id, 0x0150);
}

struct Echo;

impl ModuleHandler for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn decode_uplink(
        &self,
        _command: &str,
        uplink: &UplinkNotification,
    ) -> Result<Option<serde_json::Value>, BjigError> {
        Ok(Some(serde_json::json!({ "len": uplink.payload.len() })))
    }
}

#[test]
fn handler_without_table_gets_empty_table() {
    let mut registry = ModuleRegistry::new();
    registry.register_handler("echo", Arc::new(Echo));
    let echo = registry.resolve("echo");
    assert!(matches!(echo.descriptor, ModuleDescriptor::Specialized { .. }));
    assert!(echo.config().commands.is_empty());
}

#[test]
fn resolution_is_cached() {
    let registry = ModuleRegistry::with_builtin_modules().unwrap();
    let first = registry.resolve("illuminance");
    let second = registry.resolve("illuminance");
    assert!(Arc::ptr_eq(&first, &second));

    let unknown_a = registry.resolve("nope");
    let unknown_b = registry.resolve("nope");
    assert!(Arc::ptr_eq(&unknown_a, &unknown_b));
}

#[test]
fn module_names_lists_registrations() {
    let registry = ModuleRegistry::with_builtin_modules().unwrap();
    assert_eq!(registry.module_names(), vec!["illuminance".to_string(), "router".to_string()]);
}

#[test]
fn config_from_path() {
    let path = std::env::temp_dir().join(format!("bjig-registry-test-{}.json", std::process::id()));
    std::fs::write(
        &path,
        r#"{"name":"door","commands":{"status":{"cmd":1,"has_uplink":true,"timeout":2}}}"#,
    )
    .unwrap();
    let config = ModuleConfig::from_path(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(config.name, "door");
    assert_eq!(config.command("status").unwrap().timeout, Duration::from_secs(2));
    assert!(matches!(
        ModuleConfig::from_path("/nonexistent/bjig.json"),
        Err(BjigError::Io(_))
    ));
}
