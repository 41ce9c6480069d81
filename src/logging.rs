//! Tracing subscriber bootstrap
//!
//! Everything goes to stderr: stdout carries protocol traffic in `serve` and
//! in the sync worker child.

use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins when set; otherwise `kgraph_engine=<level>`
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kgraph_engine={}", level)))
}

/// Install the global stderr subscriber. A second call is a no-op.
pub fn init(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init("debug");
        init("info");
        tracing::info!("[SYNC] logging initialised");
    }

    #[test]
    fn test_filter_mentions_crate() {
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(env_filter("warn").to_string(), "kgraph_engine=warn");
        }
    }
}
