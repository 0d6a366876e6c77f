use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVE: &str = "info";

/// Installs the global subscriber. `DOCSYNC_LOG` wins over `RUST_LOG`;
/// calling this twice keeps the first subscriber.
pub fn init() {
    let directive = filter_directive(
        std::env::var("DOCSYNC_LOG").ok(),
        std::env::var("RUST_LOG").ok(),
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("docsyncd: invalid log filter {directive:?}: {err}");
        EnvFilter::new(DEFAULT_DIRECTIVE)
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn filter_directive(docsync_log: Option<String>, rust_log: Option<String>) -> String {
    docsync_log
        .into_iter()
        .chain(rust_log)
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_DIRECTIVE.to_string())
}
