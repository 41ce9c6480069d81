//! Extractor contract and registry
//!
//! An extractor turns one file into entity/fact/relation/source drafts. The
//! registry runs every enabled extractor that claims a file, highest
//! priority first, and concatenates their output. A failing or panicking
//! extractor only loses its own contribution for that file.
//!
//! The registry is built once and handed to the sync worker; there is no
//! global extractor state.

pub mod manifest;
pub mod markdown_spec;
pub mod rust_module;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::config::SyncConfig;
use crate::error::{KgError, Result};
use crate::model::ExtractionResult;

/// Read-only view of entity keys already present in the graph
pub trait EntityLookup {
    fn lookup(&self, key: &str) -> Option<i64>;

    fn contains(&self, key: &str) -> bool {
        self.lookup(key).is_some()
    }
}

impl EntityLookup for HashMap<String, i64> {
    fn lookup(&self, key: &str) -> Option<i64> {
        self.get(key).copied()
    }
}

/// Per-file extraction context
pub struct ExtractionContext<'a> {
    pub workspace_id: i64,
    pub content_hash: &'a str,
    pub known: &'a dyn EntityLookup,
}

impl<'a> ExtractionContext<'a> {
    pub fn new(workspace_id: i64, content_hash: &'a str, known: &'a dyn EntityLookup) -> Self {
        Self {
            workspace_id,
            content_hash,
            known,
        }
    }

    pub fn knows(&self, key: &str) -> bool {
        self.known.contains(key)
    }
}

/// Extractor contract
pub trait Parser: Send + Sync {
    /// Stable name, used for enable flags and error reports
    fn name(&self) -> &'static str;

    /// Higher runs first
    fn priority(&self) -> i32;

    fn can_handle(&self, path: &str, content: &str) -> bool;

    fn extract(
        &self,
        path: &str,
        content: &str,
        ctx: &ExtractionContext<'_>,
    ) -> Result<ExtractionResult>;
}

/// Merged output plus the per-extractor failures for one file
#[derive(Debug, Default)]
pub struct ExtractionOutcome {
    pub result: ExtractionResult,
    /// Extractors that contributed
    pub extractors: Vec<&'static str>,
    pub errors: Vec<KgError>,
}

#[derive(Default)]
pub struct ParserRegistry {
    parsers: Vec<Box<dyn Parser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in extractor not disabled in `config`
    pub fn with_builtin(config: &SyncConfig) -> Self {
        let mut registry = Self::new();
        let builtin: Vec<Box<dyn Parser>> = vec![
            Box::new(manifest::CargoManifestParser),
            Box::new(rust_module::RustModuleParser::default()),
            Box::new(rust_tests::RustTestsParser::default()),
            Box::new(markdown_spec::MarkdownSpecParser),
        ];
        for parser in builtin {
            if config.extractor_enabled(parser.name()) {
                registry.register(parser);
            } else {
                tracing::debug!("[PARSERS] extractor '{}' disabled", parser.name());
            }
        }
        registry
    }

    /// Add an extractor, keeping priority order (stable for equal priorities)
    pub fn register(&mut self, parser: Box<dyn Parser>) {
        let at = self
            .parsers
            .iter()
            .position(|p| p.priority() < parser.priority())
            .unwrap_or(self.parsers.len());
        self.parsers.insert(at, parser);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.parsers.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    /// Whether any extractor claims the file
    pub fn handles(&self, path: &str, content: &str) -> bool {
        self.parsers.iter().any(|p| p.can_handle(path, content))
    }

    /// Run every matching extractor in priority order
    pub fn extract_all(
        &self,
        path: &str,
        content: &str,
        ctx: &ExtractionContext<'_>,
    ) -> ExtractionOutcome {
        let mut outcome = ExtractionOutcome::default();

        for parser in &self.parsers {
            if !parser.can_handle(path, content) {
                continue;
            }

            let run = catch_unwind(AssertUnwindSafe(|| parser.extract(path, content, ctx)));
            match run {
                Ok(Ok(result)) => {
                    outcome.result.merge(result);
                    outcome.extractors.push(parser.name());
                }
                Ok(Err(e)) => {
                    tracing::warn!("[PARSERS] {} failed on {}: {}", parser.name(), path, e);
                    outcome.errors.push(KgError::Extraction {
                        extractor: parser.name().to_string(),
                        message: format!("{}: {}", path, e),
                    });
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "panic".to_string());
                    tracing::error!("[PARSERS] {} panicked on {}: {}", parser.name(), path, message);
                    outcome.errors.push(KgError::Extraction {
                        extractor: parser.name().to_string(),
                        message: format!("{}: panicked: {}", path, message),
                    });
                }
            }
        }

        outcome
    }
}

/// Directory part of a workspace-relative path (`""` at the root)
pub(crate) fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

pub(crate) fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityDraft;

    struct Fixed {
        name: &'static str,
        priority: i32,
        behavior: fn() -> Result<ExtractionResult>,
    }

    impl Parser for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn can_handle(&self, path: &str, _content: &str) -> bool {
            path.ends_with(".txt")
        }
        fn extract(
            &self,
            _path: &str,
            _content: &str,
            _ctx: &ExtractionContext<'_>,
        ) -> Result<ExtractionResult> {
            (self.behavior)()
        }
    }

    fn one_entity() -> Result<ExtractionResult> {
        Ok(ExtractionResult {
            entities: vec![EntityDraft::new("module:a.txt", "module")],
            ..Default::default()
        })
    }

    fn fails() -> Result<ExtractionResult> {
        Err(KgError::invalid("bad input"))
    }

    fn panics() -> Result<ExtractionResult> {
        panic!("boom")
    }

    #[test]
    fn test_priority_order() {
        let mut registry = ParserRegistry::new();
        registry.register(Box::new(Fixed { name: "low", priority: 1, behavior: one_entity }));
        registry.register(Box::new(Fixed { name: "high", priority: 9, behavior: one_entity }));
        registry.register(Box::new(Fixed { name: "mid", priority: 5, behavior: one_entity }));
        assert_eq!(registry.names(), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_failures_are_isolated() {
        let mut registry = ParserRegistry::new();
        registry.register(Box::new(Fixed { name: "ok", priority: 1, behavior: one_entity }));
        registry.register(Box::new(Fixed { name: "err", priority: 2, behavior: fails }));
        registry.register(Box::new(Fixed { name: "panic", priority: 3, behavior: panics }));

        let known = HashMap::new();
        let ctx = ExtractionContext::new(1, "h", &known);
        let outcome = registry.extract_all("a.txt", "", &ctx);

        assert_eq!(outcome.extractors, vec!["ok"]);
        assert_eq!(outcome.result.entities.len(), 1);
        assert_eq!(outcome.errors.len(), 2);
        assert!(outcome.errors[0].to_string().contains("panicked"));

        let skipped = registry.extract_all("a.rs", "", &ctx);
        assert!(skipped.extractors.is_empty());
    }

    #[test]
    fn test_builtin_respects_enable_flags() {
        let mut config = SyncConfig::default();
        config.extractors.insert("markdown_spec".into(), false);
        let registry = ParserRegistry::with_builtin(&config);
        assert_eq!(
            registry.names(),
            vec!["cargo_manifest", "rust_module", "rust_tests"]
        );
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(parent_dir("src/a.rs"), "src");
        assert_eq!(parent_dir("a.rs"), "");
        assert_eq!(join_rel("", "x.rs"), "x.rs");
        assert_eq!(join_rel("src", "x.rs"), "src/x.rs");
    }
}
