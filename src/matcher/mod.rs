//! Matching engine
//!
//! Turns the configs of one app into the JSON mapping served to a client.
//! Literal values are emitted as parsed at rebuild time, `code` values are
//! evaluated against the client attributes and `template` values nest the
//! resolved mapping of another app.

pub mod expr;
pub mod net;
pub mod version;

use crate::snapshot::{ResolvedConfig, ResolvedValue, Snapshot, SnapshotStore};
use expr::{Attr, EvalContext};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Deepest chain of nested templates that is still resolved
pub const MAX_TEMPLATE_DEPTH: usize = 16;

/// Attributes a client reports when asking for its configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub os_type: String,
    pub os_version: String,
    pub app_version: String,
    pub ip: String,
    pub lang: String,
    #[serde(default)]
    pub device_id: Option<String>,
}

impl ClientRequest {
    /// Raw value of an attribute, `None` when the client did not send it
    pub fn attr(&self, attr: Attr) -> Option<&str> {
        match attr {
            Attr::OsType => Some(&self.os_type),
            Attr::OsVersion => Some(&self.os_version),
            Attr::AppVersion => Some(&self.app_version),
            Attr::Ip => Some(&self.ip),
            Attr::Lang => Some(&self.lang),
            Attr::DeviceId => self.device_id.as_deref(),
        }
    }
}

/// Resolve the configuration of `app_key` for one client.
///
/// Returns `None` for an unknown app. Keys whose value cannot be produced
/// (no matching clause, evaluation error, template cycle) are left out.
pub fn resolve(snapshot: &Snapshot, app_key: &str, client: &ClientRequest) -> Option<Map<String, Value>> {
    let mut path = HashSet::new();
    resolve_app(snapshot, app_key, client, &mut path)
}

fn resolve_app<'s>(
    snapshot: &'s Snapshot,
    app_key: &'s str,
    client: &ClientRequest,
    path: &mut HashSet<&'s str>,
) -> Option<Map<String, Value>> {
    let configs = snapshot.app_configs(app_key)?;
    path.insert(app_key);

    let mut out = Map::new();
    for config in configs {
        if let Some(value) = resolve_config(snapshot, config, client, path) {
            // Later entries with the same key win
            out.insert(config.k.clone(), value);
        }
    }

    path.remove(app_key);
    Some(out)
}

fn resolve_config<'s>(
    snapshot: &'s Snapshot,
    config: &'s ResolvedConfig,
    client: &ClientRequest,
    path: &mut HashSet<&'s str>,
) -> Option<Value> {
    match &config.value {
        ResolvedValue::Int(_) | ResolvedValue::Float(_) | ResolvedValue::Str(_) => {
            config.value.literal()
        }
        ResolvedValue::Code(program) => {
            let ctx = EvalContext {
                client,
                config_key: &config.key,
            };
            match program.eval(&ctx) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(
                        app_key = %config.app_key,
                        config_key = %config.key,
                        "Code evaluation failed: {}",
                        e
                    );
                    None
                }
            }
        }
        ResolvedValue::Template(target) => {
            if path.contains(target.as_str()) {
                tracing::warn!(
                    app_key = %config.app_key,
                    config_key = %config.key,
                    template = %target,
                    "Template cycle, key omitted"
                );
                return None;
            }
            if path.len() >= MAX_TEMPLATE_DEPTH {
                tracing::warn!(
                    app_key = %config.app_key,
                    config_key = %config.key,
                    depth = path.len(),
                    "Template chain too deep, key omitted"
                );
                return None;
            }
            match resolve_app(snapshot, target, client, path) {
                Some(nested) => Some(Value::Object(nested)),
                None => {
                    tracing::warn!(
                        app_key = %config.app_key,
                        config_key = %config.key,
                        template = %target,
                        "Template refers to unknown app, key omitted"
                    );
                    None
                }
            }
        }
        ResolvedValue::Invalid { .. } => None,
    }
}

/// Resolves client requests against the current snapshot
#[derive(Clone)]
pub struct Matcher {
    snapshots: Arc<SnapshotStore>,
}

impl Matcher {
    pub fn new(snapshots: Arc<SnapshotStore>) -> Self {
        Self { snapshots }
    }

    /// Resolve against one snapshot for the whole request
    pub fn resolve(&self, app_key: &str, client: &ClientRequest) -> Option<Map<String, Value>> {
        let snapshot = self.snapshots.load();
        resolve(&snapshot, app_key, client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{App, ConfigEntry, Dataset, ValueType};

    fn client(app_version: &str) -> ClientRequest {
        ClientRequest {
            os_type: "android".into(),
            os_version: "14".into(),
            app_version: app_version.into(),
            ip: "192.168.4.20".into(),
            lang: "fr".into(),
            device_id: Some("dev-1".into()),
        }
    }

    fn app(key: &str, created_utc: u64) -> App {
        App {
            key: key.into(),
            user_key: "u1".into(),
            name: key.into(),
            created_utc,
        }
    }

    fn config(key: &str, app_key: &str, k: &str, v: &str, v_type: ValueType, created_utc: u64) -> ConfigEntry {
        ConfigEntry {
            key: key.into(),
            app_key: app_key.into(),
            k: k.into(),
            v: v.into(),
            v_type,
            seq: created_utc,
            created_utc,
            updated_utc: created_utc,
        }
    }

    fn snapshot(apps: Vec<App>, configs: Vec<ConfigEntry>) -> Snapshot {
        Snapshot::build(Dataset {
            users: vec![],
            apps,
            configs,
            nodes: vec![],
            data_version: 1,
        })
    }

    #[test]
    fn test_literals_and_unknown_app() {
        let snap = snapshot(
            vec![app("a", 1)],
            vec![
                config("c1", "a", "retries", "3", ValueType::Int, 1),
                config("c2", "a", "ratio", "0.5", ValueType::Float, 2),
                config("c3", "a", "banner", "hello", ValueType::String, 3),
                config("c4", "a", "broken", "three", ValueType::Int, 4),
            ],
        );
        let out = resolve(&snap, "a", &client("1.0")).unwrap();
        assert_eq!(Value::Object(out), serde_json::json!({
            "retries": 3,
            "ratio": 0.5,
            "banner": "hello",
        }));
        assert!(resolve(&snap, "nope", &client("1.0")).is_none());
    }

    #[test]
    fn test_known_app_without_configs_is_empty() {
        let snap = snapshot(vec![app("a", 1)], vec![]);
        assert_eq!(resolve(&snap, "a", &client("1.0")), Some(Map::new()));
    }

    #[test]
    fn test_version_range() {
        let snap = snapshot(
            vec![app("a", 1)],
            vec![config(
                "c1",
                "a",
                "new_ui",
                "when app_version >= '2.0.0' => true",
                ValueType::Code,
                1,
            )],
        );
        let included = resolve(&snap, "a", &client("2.1.0")).unwrap();
        assert_eq!(included.get("new_ui"), Some(&Value::Bool(true)));
        let omitted = resolve(&snap, "a", &client("1.9.9")).unwrap();
        assert!(!omitted.contains_key("new_ui"));
    }

    #[test]
    fn test_evaluation_error_omits_key() {
        let snap = snapshot(
            vec![app("a", 1)],
            vec![
                config("c1", "a", "gated", "when app_version > 1 => 1", ValueType::Code, 1),
                config("c2", "a", "plain", "x", ValueType::String, 2),
            ],
        );
        let out = resolve(&snap, "a", &client("garbage")).unwrap();
        assert!(!out.contains_key("gated"));
        assert_eq!(out.get("plain"), Some(&Value::from("x")));
    }

    #[test]
    fn test_template_nested() {
        let snap = snapshot(
            vec![app("main", 1), app("shared", 2)],
            vec![
                config("c1", "main", "common", "shared", ValueType::Template, 1),
                config("c2", "shared", "timeout", "30", ValueType::Int, 1),
                config(
                    "c3",
                    "shared",
                    "region",
                    "when ip in ['192.168.0.0/16'] => 'lan'; 'wan'",
                    ValueType::Code,
                    2,
                ),
            ],
        );
        let out = resolve(&snap, "main", &client("1.0")).unwrap();
        assert_eq!(
            Value::Object(out),
            serde_json::json!({ "common": { "timeout": 30, "region": "lan" } })
        );
    }

    #[test]
    fn test_template_cycle_terminates() {
        let snap = snapshot(
            vec![app("a", 1), app("b", 2)],
            vec![
                config("c1", "a", "to_b", "b", ValueType::Template, 1),
                config("c2", "a", "x", "1", ValueType::Int, 2),
                config("c3", "b", "to_a", "a", ValueType::Template, 1),
                config("c4", "b", "y", "2", ValueType::Int, 2),
                config("c5", "b", "self", "b", ValueType::Template, 3),
            ],
        );
        let out = resolve(&snap, "a", &client("1.0")).unwrap();
        assert_eq!(
            Value::Object(out),
            serde_json::json!({ "to_b": { "y": 2 }, "x": 1 })
        );
    }

    #[test]
    fn test_template_unknown_app_omitted() {
        let snap = snapshot(
            vec![app("a", 1)],
            vec![config("c1", "a", "missing", "ghost", ValueType::Template, 1)],
        );
        assert_eq!(resolve(&snap, "a", &client("1.0")), Some(Map::new()));
    }

    #[test]
    fn test_template_depth_bounded() {
        let n = MAX_TEMPLATE_DEPTH + 4;
        let apps: Vec<App> = (0..n).map(|i| app(&format!("app{}", i), i as u64)).collect();
        let configs: Vec<ConfigEntry> = (0..n - 1)
            .map(|i| {
                config(
                    &format!("c{}", i),
                    &format!("app{}", i),
                    "next",
                    &format!("app{}", i + 1),
                    ValueType::Template,
                    1,
                )
            })
            .collect();
        let snap = snapshot(apps, configs);
        let out = resolve(&snap, "app0", &client("1.0")).unwrap();

        let mut depth = 1;
        let mut level = &out;
        while let Some(Value::Object(next)) = level.get("next") {
            depth += 1;
            level = next;
        }
        assert_eq!(depth, MAX_TEMPLATE_DEPTH);
    }

    #[test]
    fn test_duplicate_key_last_wins() {
        let snap = snapshot(
            vec![app("a", 1)],
            vec![
                config("c1", "a", "mode", "first", ValueType::String, 1),
                config("c2", "a", "mode", "second", ValueType::String, 5),
            ],
        );
        assert_eq!(snap.app_configs("a").unwrap().len(), 2);

        let out = resolve(&snap, "a", &client("1.0")).unwrap();
        assert_eq!(out.get("mode"), Some(&Value::from("second")));
    }

    #[test]
    fn test_deterministic() {
        let snap = snapshot(
            vec![app("a", 1)],
            vec![
                config("c1", "a", "exp", "when rollout(30) => 'b'; 'a'", ValueType::Code, 1),
                config("c2", "a", "lang", "when lang in ['fr', 'de'] => 'eu'", ValueType::Code, 2),
            ],
        );
        let c = client("1.0");
        let first = resolve(&snap, "a", &c);
        for _ in 0..20 {
            assert_eq!(resolve(&snap, "a", &c), first);
        }
    }
}
