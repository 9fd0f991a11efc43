use tracing::warn;
use tracing_subscriber::{fmt, EnvFilter};

/// Journal events at `info`, everything else (r2d2, rusqlite) at `warn`.
pub const DEFAULT_FILTER: &str = "warn,persona_journal=info";

/// Parses a `RUST_LOG`-style directive string. An empty or unparseable value
/// falls back to [`DEFAULT_FILTER`]; the rejected text is returned so it can be
/// reported once the subscriber is up.
pub fn journal_filter(directives: Option<&str>) -> (EnvFilter, Option<String>) {
    match directives.map(str::trim).filter(|d| !d.is_empty()) {
        None => (EnvFilter::new(DEFAULT_FILTER), None),
        Some(raw) => match EnvFilter::try_new(raw) {
            Ok(filter) => (filter, None),
            Err(_) => (EnvFilter::new(DEFAULT_FILTER), Some(raw.to_string())),
        },
    }
}

/// Installs the global subscriber, writing compact UTC lines to stderr so
/// command output on stdout stays clean. Returns false if a subscriber was
/// already installed.
pub fn init_tracing() -> bool {
    let directives = std::env::var("RUST_LOG").ok();
    let (filter, rejected) = journal_filter(directives.as_deref());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .finish();

    let installed = tracing::subscriber::set_global_default(subscriber).is_ok();
    if let Some(raw) = rejected {
        warn!("Ignoring invalid RUST_LOG {:?}; using {}", raw, DEFAULT_FILTER);
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_or_blank_uses_the_journal_default() {
        for directives in [None, Some(""), Some("   ")] {
            let (filter, rejected) = journal_filter(directives);
            assert_eq!(filter.to_string(), EnvFilter::new(DEFAULT_FILTER).to_string());
            assert!(rejected.is_none());
        }
    }

    #[test]
    fn valid_directives_are_kept() {
        let (filter, rejected) = journal_filter(Some("persona_journal=debug"));
        assert_eq!(filter.to_string(), "persona_journal=debug");
        assert!(rejected.is_none());
    }

    #[test]
    fn invalid_directives_fall_back_and_are_reported() {
        let (filter, rejected) = journal_filter(Some("persona_journal=loudest"));
        assert_eq!(filter.to_string(), EnvFilter::new(DEFAULT_FILTER).to_string());
        assert_eq!(rejected.as_deref(), Some("persona_journal=loudest"));
    }
}
