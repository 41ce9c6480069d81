//! Rust source extractor (tree-sitter)
//!
//! One `module:<path>` entity per `.rs` file and one `symbol:<path>#<name>`
//! entity per top-level item. Relations:
//! - `contains`: module → its items and its `mod x;` children
//! - `imports`: module → modules named by `use crate::…`/`super::…`/`self::…`
//! - `implements`: module → any key named in an `// implements: <key>` marker

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tree_sitter::Node;

use super::{join_rel, parent_dir, ExtractionContext, Parser};
use crate::error::{KgError, Result};
use crate::model::{
    entity_types, keys, relation_types, strength, EntityDraft, ExtractionResult, FactDraft,
    RelationDraft, SourceDraft,
};

static IMPLEMENTS_MARKER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?m)^\s*//[/!]?\s*implements:\s*(\S+)").ok());

const ITEM_KINDS: &[(&str, &str)] = &[
    ("function_item", "fn"),
    ("struct_item", "struct"),
    ("enum_item", "enum"),
    ("union_item", "union"),
    ("trait_item", "trait"),
    ("const_item", "const"),
    ("static_item", "static"),
    ("type_item", "type"),
    ("macro_definition", "macro"),
];

#[derive(Default)]
pub struct RustModuleParser;

impl Parser for RustModuleParser {
    fn name(&self) -> &'static str {
        "rust_module"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn can_handle(&self, path: &str, _content: &str) -> bool {
        path.ends_with(".rs")
    }

    fn extract(
        &self,
        path: &str,
        content: &str,
        ctx: &ExtractionContext<'_>,
    ) -> Result<ExtractionResult> {
        let tree = parse_rust(path, content)?;
        let root = tree.root_node();
        let bytes = content.as_bytes();

        let module_key = keys::module(path);
        let mut result = ExtractionResult::default();
        let mut seen_symbols = HashSet::new();

        let doc = module_doc(content);
        let mut module = EntityDraft::new(&module_key, entity_types::MODULE);
        if let Some(first) = doc.as_deref().and_then(|d| d.lines().next()) {
            module = module.with_summary(first.trim());
        }

        let mut cursor = root.walk();
        for item in root.named_children(&mut cursor) {
            match item.kind() {
                "use_declaration" => {
                    extract_use(path, &module_key, item, bytes, ctx, &mut result);
                }
                "mod_item" => {
                    extract_mod(path, &module_key, item, bytes, ctx, &mut result);
                }
                kind => {
                    let Some((_, label)) = ITEM_KINDS.iter().find(|(k, _)| *k == kind) else {
                        continue;
                    };
                    let Some(name) = item
                        .child_by_field_name("name")
                        .and_then(|n| n.utf8_text(bytes).ok())
                    else {
                        continue;
                    };
                    if !seen_symbols.insert(name.to_string()) {
                        continue;
                    }
                    extract_symbol(path, &module_key, name, label, item, bytes, &mut result);
                }
            }
        }

        let markers = IMPLEMENTS_MARKER
            .as_ref()
            .map(|re| re.captures_iter(content).collect::<Vec<_>>())
            .unwrap_or_default();
        for marker in markers {
            let target = &marker[1];
            let fact = FactDraft::new(&module_key, "marker", format!("implements:{}", target));
            let evidence = fact.reference();
            result.facts.push(fact);
            result.relations.push(
                RelationDraft::new(&module_key, target, relation_types::IMPLEMENTS, strength::EXPLICIT)
                    .with_evidence(evidence),
            );
        }

        if let Some(doc) = doc {
            result
                .facts
                .push(FactDraft::new(&module_key, "doc", "module").with_content(doc));
        }

        let line_count = content.lines().count();
        result.entities.insert(
            0,
            module.with_metadata(json!({
                "lines": line_count,
                "symbols": seen_symbols.len(),
            })),
        );
        result
            .sources
            .insert(0, SourceDraft::file(&module_key, "file", path));

        Ok(result)
    }
}

/// Parse Rust source with tree-sitter
pub(crate) fn parse_rust(path: &str, content: &str) -> Result<tree_sitter::Tree> {
    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(&tree_sitter_rust::LANGUAGE.into())
        .map_err(|e| KgError::invalid(format!("failed to load Rust grammar: {:?}", e)))?;
    parser
        .parse(content, None)
        .ok_or_else(|| KgError::invalid(format!("failed to parse {}", path)))
}

fn extract_symbol(
    path: &str,
    module_key: &str,
    name: &str,
    label: &str,
    item: Node<'_>,
    bytes: &[u8],
    result: &mut ExtractionResult,
) {
    let symbol_key = keys::symbol(path, name);
    let public = has_visibility(item);
    let line = item.start_position().row + 1;
    let signature = item
        .utf8_text(bytes)
        .ok()
        .and_then(|t| t.lines().next())
        .map(|l| l.trim().trim_end_matches('{').trim().to_string())
        .unwrap_or_default();

    result.entities.push(
        EntityDraft::new(&symbol_key, entity_types::SYMBOL)
            .with_summary(format!("{} {}", label, name))
            .with_metadata(json!({ "kind": label, "public": public, "line": line })),
    );
    result.sources.push(SourceDraft::spanned(
        &symbol_key,
        "span",
        path,
        item.start_byte(),
        item.end_byte(),
    ));
    result
        .facts
        .push(FactDraft::new(&symbol_key, "signature", "decl").with_content(signature));

    let listing = FactDraft::new(module_key, "symbol", name)
        .with_content(label)
        .with_payload(json!({ "line": line, "public": public }));
    let evidence = listing.reference();
    result.facts.push(listing);
    result.relations.push(
        RelationDraft::new(module_key, &symbol_key, relation_types::CONTAINS, strength::EXPLICIT)
            .with_evidence(evidence),
    );
}

fn extract_mod(
    path: &str,
    module_key: &str,
    item: Node<'_>,
    bytes: &[u8],
    ctx: &ExtractionContext<'_>,
    result: &mut ExtractionResult,
) {
    // Inline `mod x { … }` bodies belong to this file
    if item.child_by_field_name("body").is_some() {
        return;
    }
    let Some(name) = item
        .child_by_field_name("name")
        .and_then(|n| n.utf8_text(bytes).ok())
    else {
        return;
    };

    let dir = child_module_dir(path);
    let candidates = [
        join_rel(&dir, &format!("{}.rs", name)),
        join_rel(&dir, &format!("{}/mod.rs", name)),
    ];
    let target = candidates
        .iter()
        .map(|p| keys::module(p))
        .find(|k| ctx.knows(k))
        .unwrap_or_else(|| keys::module(&candidates[0]));

    let fact = FactDraft::new(module_key, "mod", name);
    let evidence = fact.reference();
    result.facts.push(fact);
    result.relations.push(
        RelationDraft::new(module_key, target, relation_types::CONTAINS, strength::EXPLICIT)
            .with_evidence(evidence),
    );
}

fn extract_use(
    path: &str,
    module_key: &str,
    item: Node<'_>,
    bytes: &[u8],
    ctx: &ExtractionContext<'_>,
    result: &mut ExtractionResult,
) {
    let Some(text) = item
        .child_by_field_name("argument")
        .and_then(|n| n.utf8_text(bytes).ok())
    else {
        return;
    };

    let mut targets = HashSet::new();
    for use_path in expand_use_tree(text) {
        let fact = FactDraft::new(module_key, "import", &use_path);
        let evidence = fact.reference();
        result.facts.push(fact);

        let segments: Vec<&str> = use_path.split("::").collect();
        let Some(target) = resolve_module_path(path, &segments, ctx) else {
            continue;
        };
        if target == module_key || !targets.insert(target.clone()) {
            continue;
        }
        result.relations.push(
            RelationDraft::new(module_key, target, relation_types::IMPORTS, strength::EXPLICIT)
                .with_evidence(evidence),
        );
    }
}

/// Flatten `a::{b, c::{d, e}}` into `a::b`, `a::c::d`, `a::c::e`, dropping
/// `as` aliases and trailing globs
pub(crate) fn expand_use_tree(text: &str) -> Vec<String> {
    let compact: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut out = Vec::new();
    expand_into("", &compact, &mut out);
    out
}

fn expand_into(prefix: &str, tree: &str, out: &mut Vec<String>) {
    let tree = tree.trim();
    if tree.is_empty() {
        return;
    }

    if let Some(open) = tree.find('{') {
        let head = tree[..open].trim().trim_end_matches("::");
        let close = tree.rfind('}').unwrap_or(tree.len());
        let inner = &tree[open + 1..close.max(open + 1)];
        let base = join_use(prefix, head);
        for part in split_top_level(inner) {
            expand_into(&base, part, out);
        }
        return;
    }

    let without_alias = tree.split(" as ").next().unwrap_or(tree).trim();
    let cleaned = without_alias.trim_end_matches("::*").trim_end_matches('*');
    let full = join_use(prefix, cleaned);
    let full = full.trim_end_matches("::self").to_string();
    if !full.is_empty() {
        out.push(full);
    }
}

fn join_use(prefix: &str, part: &str) -> String {
    match (prefix.is_empty(), part.is_empty()) {
        (true, _) => part.to_string(),
        (_, true) => prefix.to_string(),
        _ => format!("{}::{}", prefix, part),
    }
}

fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Crate `src` directory containing `path`, if any
pub(crate) fn crate_src_root(path: &str) -> Option<String> {
    if path.starts_with("src/") {
        return Some("src".to_string());
    }
    path.find("/src/").map(|i| path[..i + 4].to_string())
}

/// Directory holding the child modules declared by this file
fn child_module_dir(path: &str) -> String {
    let dir = parent_dir(path);
    let file = path.rsplit('/').next().unwrap_or(path);
    match file {
        "lib.rs" | "main.rs" | "mod.rs" => dir.to_string(),
        _ => join_rel(dir, file.trim_end_matches(".rs")),
    }
}

/// Module files that can define the module living at directory `dir`
fn module_files(dir: &str, src_root: Option<&str>) -> Vec<String> {
    if Some(dir) == src_root {
        return vec![join_rel(dir, "lib.rs"), join_rel(dir, "main.rs")];
    }
    if dir.is_empty() {
        return Vec::new();
    }
    vec![format!("{}.rs", dir), format!("{}/mod.rs", dir)]
}

/// Resolve a `crate::`/`super::`/`self::` path to the longest known module.
///
/// Returns `None` for external crates and paths that name nothing known.
pub(crate) fn resolve_module_path(
    path: &str,
    segments: &[&str],
    ctx: &ExtractionContext<'_>,
) -> Option<String> {
    let src_root = crate_src_root(path);
    let (mut base, rest) = match segments.first().copied() {
        Some("crate") => (src_root.clone()?, &segments[1..]),
        Some("self") => (child_module_dir(path), &segments[1..]),
        Some("super") => {
            let mut dir = child_module_dir(path);
            let mut i = 0;
            while segments.get(i) == Some(&"super") {
                dir = parent_dir(&dir).to_string();
                i += 1;
            }
            (dir, &segments[i..])
        }
        _ => return None,
    };

    let mut dirs = vec![base.clone()];
    for seg in rest {
        base = join_rel(&base, seg);
        dirs.push(base.clone());
    }

    dirs.iter()
        .rev()
        .flat_map(|d| module_files(d, src_root.as_deref()))
        .map(|file| keys::module(&file))
        .find(|key| ctx.knows(key))
}

fn has_visibility(item: Node<'_>) -> bool {
    let mut cursor = item.walk();
    let found = item
        .children(&mut cursor)
        .any(|c| c.kind() == "visibility_modifier");
    found
}

/// Leading `//!` inner doc comment block
fn module_doc(content: &str) -> Option<String> {
    let lines: Vec<&str> = content
        .lines()
        .map(str::trim_start)
        .skip_while(|l| l.is_empty())
        .take_while(|l| l.starts_with("//!"))
        .map(|l| l.trim_start_matches("//!").trim())
        .collect();
    let doc = lines.join("\n").trim().to_string();
    if doc.is_empty() {
        None
    } else {
        Some(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SOURCE: &str = r#"//! Sync queue.
//! Second line.

// implements: spec:docs/specs/sync.md#queue
use crate::model::{Trigger, keys};
use super::watcher::Debouncer as D;
use std::collections::HashMap;

mod inner;

pub struct SyncQueue {
    items: HashMap<String, u8>,
}

pub fn enqueue() {}

fn enqueue() {}

macro_rules! noisy { () => {} }
"#;

    fn known() -> HashMap<String, i64> {
        let mut k = HashMap::new();
        k.insert("module:src/model.rs".into(), 1);
        k.insert("module:src/sync/watcher.rs".into(), 2);
        k.insert("module:src/sync/queue/inner/mod.rs".into(), 3);
        k
    }

    #[test]
    fn test_extracts_module_symbols_and_relations() {
        let known = known();
        let ctx = ExtractionContext::new(1, "h", &known);
        let result = RustModuleParser
            .extract("src/sync/queue.rs", SOURCE, &ctx)
            .unwrap();

        let module = &result.entities[0];
        assert_eq!(module.key, "module:src/sync/queue.rs");
        assert_eq!(module.summary.as_deref(), Some("Sync queue."));

        let symbols: Vec<&str> = result.entities[1..].iter().map(|e| e.key.as_str()).collect();
        assert_eq!(
            symbols,
            vec![
                "symbol:src/sync/queue.rs#SyncQueue",
                "symbol:src/sync/queue.rs#enqueue",
                "symbol:src/sync/queue.rs#noisy",
            ]
        );
        assert!(result.sources[1].span.is_some());

        let rel = |ty: &str| -> Vec<String> {
            result
                .relations
                .iter()
                .filter(|r| r.relation_type == ty)
                .map(|r| r.dst_key.clone())
                .collect()
        };
        assert_eq!(
            rel("imports"),
            vec!["module:src/model.rs", "module:src/sync/watcher.rs"]
        );
        assert_eq!(rel("implements"), vec!["spec:docs/specs/sync.md#queue"]);
        assert!(rel("contains").contains(&"module:src/sync/queue/inner/mod.rs".to_string()));
        assert!(result.relations.iter().all(|r| !r.evidence.is_empty()));
    }

    #[test]
    fn test_expand_use_tree() {
        assert_eq!(
            expand_use_tree("crate::a::{b, c::{d, e as f}, g::*}"),
            vec!["crate::a::b", "crate::a::c::d", "crate::a::c::e", "crate::a::g"]
        );
        assert_eq!(expand_use_tree("super::{self, x}"), vec!["super", "super::x"]);
    }

    #[test]
    fn test_resolve_crate_root_and_super() {
        let mut known = HashMap::new();
        known.insert("module:src/lib.rs".to_string(), 1);
        known.insert("module:src/store/mod.rs".to_string(), 2);
        let ctx = ExtractionContext::new(1, "h", &known);

        assert_eq!(
            resolve_module_path("src/store/entities.rs", &["super", "placeholders"], &ctx).as_deref(),
            Some("module:src/store/mod.rs")
        );
        assert_eq!(
            resolve_module_path("src/a.rs", &["crate", "Result"], &ctx).as_deref(),
            Some("module:src/lib.rs")
        );
        assert_eq!(resolve_module_path("src/a.rs", &["serde", "Serialize"], &ctx), None);
    }
}
