//! Layer merging
//!
//! Tables merge key by key, anything else in a later layer replaces the
//! earlier value outright. A list in `kiln.toml` therefore replaces the
//! host list instead of extending it, and an explicit `null` clears a
//! value set by a lower layer.

use serde_json::Value;

/// Merge `overlay` into `base` in place
pub fn merge_into(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(table), Value::Object(entries)) => {
            for (key, value) in entries {
                match table.get_mut(&key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        table.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Fold layers from lowest to highest precedence
pub fn merge_layers(layers: Vec<Value>) -> Value {
    let mut merged = Value::Null;
    for layer in layers {
        merge_into(&mut merged, layer);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_repo_layer_overrides_single_key() {
        let mut config = json!({"toolchain": {"cargo": "cargo", "rustc": "rustc"}});
        merge_into(&mut config, json!({"toolchain": {"rustc": "/opt/rust/bin/rustc"}}));

        assert_eq!(config["toolchain"]["rustc"], "/opt/rust/bin/rustc");
        assert_eq!(config["toolchain"]["cargo"], "cargo");
    }

    #[test]
    fn test_check_list_is_replaced() {
        let mut config = json!({"checks": {"enabled": ["build", "lint", "doc", "format"]}});
        merge_into(&mut config, json!({"checks": {"enabled": ["format"]}}));
        assert_eq!(config["checks"]["enabled"], json!(["format"]));
    }

    #[test]
    fn test_null_clears_lower_value() {
        let mut config = json!({"toolchain": {"release": "1.79.0"}});
        merge_into(&mut config, json!({"toolchain": {"release": null}}));
        assert!(config["toolchain"]["release"].is_null());
    }

    #[test]
    fn test_table_replaces_scalar() {
        let mut config = json!({"dev_env": null});
        merge_into(&mut config, json!({"dev_env": {"extra_tools": []}}));
        assert_eq!(config["dev_env"]["extra_tools"], json!([]));
    }

    #[test]
    fn test_layer_precedence() {
        let merged = merge_layers(vec![
            json!({"filter": {"include": ["**/*.html"]}, "store": {"root": null}}),
            json!({"store": {"root": "/var/cache/kiln"}}),
            json!({"filter": {"include": ["**/*.html", "**/*.css"]}}),
            json!({"store": {"root": "/tmp/store"}}),
        ]);

        assert_eq!(merged["store"]["root"], "/tmp/store");
        assert_eq!(merged["filter"]["include"], json!(["**/*.html", "**/*.css"]));
    }
}
