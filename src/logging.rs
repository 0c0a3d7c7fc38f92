//! Tracing subscriber setup
//!
//! `LOG_FORMAT=json` emits one JSON object per line, anything else is the
//! human-readable formatter. `RUST_LOG` takes precedence over `LOG_LEVEL`.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when neither `RUST_LOG` nor `LOG_LEVEL` is set.
const DEFAULT_DIRECTIVES: &str = "info,sqlx=warn,hyper=warn,reqwest=warn";

pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(&config.level)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    // a second init (tests, embedded use) keeps the first subscriber
    let _ = match config.format {
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
        LogFormat::Plain => builder.try_init(),
    };
}

fn filter_directives(level: &str) -> String {
    let level = level.trim().to_lowercase();
    format!("{},sqlx=warn,hyper=warn,reqwest=warn", level)
}

/// Keeps the first and last four characters of a secret-like value.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_becomes_lowercase_directive() {
        assert_eq!(
            filter_directives("DEBUG"),
            "debug,sqlx=warn,hyper=warn,reqwest=warn"
        );
    }

    #[test]
    fn secrets_are_masked() {
        assert_eq!(mask_secret("short"), "*****");
        assert_eq!(mask_secret("0123456789abcdef"), "0123...cdef");
    }
}
