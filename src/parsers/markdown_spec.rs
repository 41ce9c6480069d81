//! Markdown spec extractor
//!
//! A `spec:<path>` entity per spec document and a `spec:<path>#<slug>`
//! section entity per heading below the title, each with its byte span.

use std::collections::HashMap;

use serde_json::json;

use super::{ExtractionContext, Parser};
use crate::error::Result;
use crate::model::{
    entity_types, keys, relation_types, strength, EntityDraft, ExtractionResult, FactDraft,
    RelationDraft, SourceDraft,
};

pub struct MarkdownSpecParser;

struct Heading {
    level: usize,
    text: String,
    line: usize,
    start: usize,
}

impl Parser for MarkdownSpecParser {
    fn name(&self) -> &'static str {
        "markdown_spec"
    }

    fn priority(&self) -> i32 {
        30
    }

    fn can_handle(&self, path: &str, _content: &str) -> bool {
        if !path.to_ascii_lowercase().ends_with(".md") {
            return false;
        }
        let in_spec_dir = path
            .split('/')
            .rev()
            .skip(1)
            .any(|dir| matches!(dir, "specs" | "spec" | "docs"));
        let file = path.rsplit('/').next().unwrap_or(path).to_ascii_lowercase();
        in_spec_dir || file.contains("spec")
    }

    fn extract(
        &self,
        path: &str,
        content: &str,
        _ctx: &ExtractionContext<'_>,
    ) -> Result<ExtractionResult> {
        let spec_key = keys::spec(path);
        let headings = scan_headings(content);
        let mut result = ExtractionResult::default();

        let title = headings
            .iter()
            .find(|h| h.level == 1)
            .map(|h| h.text.clone());
        let mut spec = EntityDraft::new(&spec_key, entity_types::SPEC).with_metadata(json!({
            "sections": headings.iter().filter(|h| h.level > 1).count(),
        }));
        if let Some(title) = &title {
            spec = spec.with_summary(title.clone());
        }
        result.entities.push(spec);
        result.sources.push(SourceDraft::file(&spec_key, "document", path));

        let mut slug_counts: HashMap<String, usize> = HashMap::new();
        for (i, heading) in headings.iter().enumerate() {
            if heading.level == 1 {
                continue;
            }
            let base = slugify(&heading.text);
            if base.is_empty() {
                continue;
            }
            let n = slug_counts.entry(base.clone()).or_insert(0);
            let slug = if *n == 0 {
                base.clone()
            } else {
                format!("{}-{}", base, n)
            };
            *n += 1;

            let end = headings[i + 1..]
                .iter()
                .find(|h| h.level <= heading.level)
                .map(|h| h.start)
                .unwrap_or(content.len());

            let section_key = keys::spec_section(path, &slug);
            result.entities.push(
                EntityDraft::new(&section_key, entity_types::SPEC_SECTION)
                    .with_summary(heading.text.clone())
                    .with_metadata(json!({ "level": heading.level, "line": heading.line })),
            );
            result.sources.push(SourceDraft::spanned(
                &section_key,
                "section",
                path,
                heading.start,
                end,
            ));

            let fact = FactDraft::new(&spec_key, "heading", &slug)
                .with_content(heading.text.clone())
                .with_payload(json!({ "level": heading.level, "line": heading.line }));
            let evidence = fact.reference();
            result.facts.push(fact);

            let body = content.get(heading.start..end).unwrap_or("");
            result.facts.push(
                FactDraft::new(&section_key, "section", "body")
                    .with_content(body.lines().skip(1).collect::<Vec<_>>().join("\n").trim()),
            );

            result.relations.push(
                RelationDraft::new(&spec_key, &section_key, relation_types::CONTAINS, strength::EXPLICIT)
                    .with_evidence(evidence),
            );
        }

        Ok(result)
    }
}

/// ATX headings outside fenced code blocks, with byte offsets
fn scan_headings(content: &str) -> Vec<Heading> {
    let mut headings = Vec::new();
    let mut in_fence = false;
    let mut offset = 0;

    for (idx, line) in content.split_inclusive('\n').enumerate() {
        let start = offset;
        offset += line.len();
        let trimmed = line.trim_end();

        if trimmed.trim_start().starts_with("```") || trimmed.trim_start().starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        let level = trimmed.chars().take_while(|c| *c == '#').count();
        if level == 0 || level > 6 {
            continue;
        }
        let rest = &trimmed[level..];
        if !rest.is_empty() && !rest.starts_with(' ') {
            continue;
        }
        let text = rest.trim().trim_end_matches('#').trim().to_string();
        if text.is_empty() {
            continue;
        }
        headings.push(Heading {
            level,
            text,
            line: idx + 1,
            start,
        });
    }
    headings
}

/// GitHub-style heading slug
pub(crate) fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if c == ' ' || c == '-' || c == '_' {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}
