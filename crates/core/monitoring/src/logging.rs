//! A set of utilities to enable logging configuration using tracing_subscriber.

use std::{error::Error, io::IsTerminal, sync::Once};

use tracing_subscriber::{EnvFilter, filter::LevelFilter};

static TEMPLATEDB_LOG_ENV_VAR: &str = "TEMPLATEDB_LOG";

/// Initializes a tracing subscriber for logging.
///
/// Test suites call this from every test, so repeated calls are no-ops. If another subscriber
/// was already installed globally, that one is kept.
pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let (env_filter, log_level) = env_filter_and_log_level();

        let installed = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(std::io::stderr().is_terminal())
            .with_writer(std::io::stderr)
            .try_init()
            .is_ok();

        if installed {
            tracing::info!("log level: {}", log_level);
        }
    });
}

/// Renders the `source()` chain of an error, outermost cause first.
///
/// Meant for the `error_source` field next to `error = %err`, so that the top-level message and
/// its causes end up in separate fields:
///
/// ```ignore
/// tracing::warn!(error = %err, error_source = logging::error_source(&err), "cleanup failed");
/// ```
pub fn error_source(err: &(dyn Error + 'static)) -> String {
    let mut chain = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    chain.join(" -> ")
}

/// List of crates in the workspace.
const TEMPLATEDB_CRATES: &[&str] = &[
    "integresql_client",
    "monitoring",
    "provisioning",
    "template_integresql",
    "template_postgres",
    "templatedb_config",
];

fn env_filter_and_log_level() -> (EnvFilter, String) {
    // Parse directives from RUST_LOG
    let log_filter = EnvFilter::builder().with_default_directive(LevelFilter::ERROR.into());
    let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let mut env_filter = log_filter.parse_lossy(&directive_string);

    let log_level =
        std::env::var(TEMPLATEDB_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());

    for crate_name in TEMPLATEDB_CRATES {
        // Add directives for each workspace crate, if not overriden by RUST_LOG
        if directive_string.contains(&format!("{crate_name}=")) {
            continue;
        }
        match format!("{crate_name}={log_level}").parse() {
            Ok(directive) => env_filter = env_filter.add_directive(directive),
            Err(err) => {
                eprintln!("ignoring invalid {TEMPLATEDB_LOG_ENV_VAR} value {log_level:?}: {err}");
                break;
            }
        }
    }

    (env_filter, log_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer")]
    struct Outer(#[source] Middle);

    #[derive(Debug, thiserror::Error)]
    #[error("middle")]
    struct Middle(#[source] std::io::Error);

    #[test]
    fn error_source_renders_the_cause_chain() {
        //* Given
        let err = Outer(Middle(std::io::Error::other("inner")));

        //* When
        let rendered = error_source(&err);

        //* Then
        assert_eq!(rendered, "middle -> inner");
    }

    #[test]
    fn error_source_is_empty_without_causes() {
        let err = std::io::Error::other("alone");
        assert_eq!(error_source(&err), "");
    }

    #[test]
    fn init_is_idempotent() {
        init();
        init();
    }
}
