//! `Cargo.toml` extractor
//!
//! Emits one `package:<name>` entity per manifest with version/edition and
//! one `dependency/<name>` fact per dependency, plus `depends_on` relations.
//! Dependencies that are not yet in the graph get a stub package entity.

use serde_json::json;

use super::{ExtractionContext, Parser};
use crate::error::{KgError, Result};
use crate::model::{
    entity_types, keys, relation_types, strength, EntityDraft, ExtractionResult, FactDraft,
    RelationDraft, SourceDraft,
};

const DEPENDENCY_TABLES: &[(&str, &str)] = &[
    ("dependencies", "normal"),
    ("dev-dependencies", "dev"),
    ("build-dependencies", "build"),
];

pub struct CargoManifestParser;

impl Parser for CargoManifestParser {
    fn name(&self) -> &'static str {
        "cargo_manifest"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn can_handle(&self, path: &str, _content: &str) -> bool {
        path == "Cargo.toml" || path.ends_with("/Cargo.toml")
    }

    fn extract(
        &self,
        path: &str,
        content: &str,
        ctx: &ExtractionContext<'_>,
    ) -> Result<ExtractionResult> {
        let manifest: toml::Table = content
            .parse()
            .map_err(|e| KgError::invalid(format!("malformed manifest: {}", e)))?;

        let mut result = ExtractionResult::default();

        // Virtual workspace manifests carry no package
        let Some(package) = manifest.get("package").and_then(|p| p.as_table()) else {
            return Ok(result);
        };
        let Some(name) = package.get("name").and_then(|n| n.as_str()) else {
            return Ok(result);
        };

        let key = keys::package(name);
        let version = package.get("version").and_then(inherited_str);
        let edition = package.get("edition").and_then(inherited_str);

        let mut entity = EntityDraft::new(&key, entity_types::PACKAGE).with_metadata(json!({
            "manifest": path,
            "version": version,
        }));
        if let Some(desc) = package.get("description").and_then(|d| d.as_str()) {
            entity = entity.with_summary(desc);
        }
        result.entities.push(entity);
        result
            .sources
            .push(SourceDraft::file(&key, "manifest", path));

        if let Some(version) = version {
            result
                .facts
                .push(FactDraft::new(&key, "manifest", "version").with_content(version));
        }
        if let Some(edition) = edition {
            result
                .facts
                .push(FactDraft::new(&key, "manifest", "edition").with_content(edition));
        }

        for (table, kind) in DEPENDENCY_TABLES {
            let Some(deps) = manifest.get(*table).and_then(|t| t.as_table()) else {
                continue;
            };
            for (dep_name, spec) in deps {
                let crate_name = spec
                    .get("package")
                    .and_then(|p| p.as_str())
                    .unwrap_or(dep_name);
                if crate_name == name {
                    continue;
                }

                let fact = FactDraft::new(&key, "dependency", crate_name)
                    .with_content(describe_requirement(spec))
                    .with_payload(json!({ "kind": kind, "alias": dep_name }));
                let evidence = fact.reference();
                result.facts.push(fact);

                let dep_key = keys::package(crate_name);
                if !ctx.knows(&dep_key) {
                    result.entities.push(
                        EntityDraft::new(&dep_key, entity_types::PACKAGE)
                            .with_metadata(json!({ "external": true })),
                    );
                }
                result.relations.push(
                    RelationDraft::new(&key, &dep_key, relation_types::DEPENDS_ON, strength::EXPLICIT)
                        .with_metadata(json!({ "kind": kind }))
                        .with_evidence(evidence),
                );
            }
        }

        Ok(result)
    }
}

/// `version = "1"` or `version.workspace = true`
fn inherited_str(value: &toml::Value) -> Option<&str> {
    match value {
        toml::Value::String(s) => Some(s.as_str()),
        toml::Value::Table(t) if t.get("workspace").and_then(|w| w.as_bool()) == Some(true) => {
            Some("workspace")
        }
        _ => None,
    }
}

fn describe_requirement(spec: &toml::Value) -> String {
    match spec {
        toml::Value::String(v) => v.clone(),
        toml::Value::Table(t) => {
            if let Some(v) = t.get("version").and_then(|v| v.as_str()) {
                v.to_string()
            } else if let Some(p) = t.get("path").and_then(|p| p.as_str()) {
                format!("path:{}", p)
            } else if let Some(g) = t.get("git").and_then(|g| g.as_str()) {
                format!("git:{}", g)
            } else if t.get("workspace").and_then(|w| w.as_bool()) == Some(true) {
                "workspace".to_string()
            } else {
                "*".to_string()
            }
        }
        _ => "*".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MANIFEST: &str = r#"
[package]
name = "demo"
version = "0.2.0"
edition = "2021"
description = "A demo crate"

[dependencies]
serde = { version = "1.0", features = ["derive"] }
local = { path = "../local" }
renamed = { package = "real-name", version = "2" }

[dev-dependencies]
tempfile = "3"
"#;

    #[test]
    fn test_extracts_package_and_dependencies() {
        let mut known = HashMap::new();
        known.insert("package:serde".to_string(), 7);
        let ctx = ExtractionContext::new(1, "h", &known);

        let result = CargoManifestParser
            .extract("Cargo.toml", MANIFEST, &ctx)
            .unwrap();

        assert_eq!(result.entities[0].key, "package:demo");
        assert_eq!(result.entities[0].summary.as_deref(), Some("A demo crate"));
        // serde is known, so only three stubs
        assert_eq!(result.entities.len(), 4);
        assert!(result.entities.iter().any(|e| e.key == "package:real-name"));

        let deps: Vec<&str> = result
            .facts
            .iter()
            .filter(|f| f.fact_type == "dependency")
            .map(|f| f.fact_key.as_str())
            .collect();
        assert_eq!(deps, vec!["serde", "local", "real-name", "tempfile"]);

        assert_eq!(result.relations.len(), 4);
        assert!(result.relations.iter().all(|r| r.evidence.len() == 1));
        assert_eq!(result.sources.len(), 1);
    }

    #[test]
    fn test_virtual_manifest_is_empty() {
        let known = HashMap::new();
        let ctx = ExtractionContext::new(1, "h", &known);
        let result = CargoManifestParser
            .extract("Cargo.toml", "[workspace]\nmembers = [\"a\"]\n", &ctx)
            .unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_malformed_manifest_errors() {
        let known = HashMap::new();
        let ctx = ExtractionContext::new(1, "h", &known);
        assert!(CargoManifestParser
            .extract("Cargo.toml", "[package\nname=", &ctx)
            .is_err());
        assert!(CargoManifestParser.can_handle("crates/x/Cargo.toml", ""));
        assert!(!CargoManifestParser.can_handle("NotCargo.toml", ""));
    }
}
