//! Tracing subscriber set-up for the `machina` binary.

use tracing_subscriber::EnvFilter;

/// Environment variable holding filter directives.
pub const LOG_ENV_VAR: &str = "MACHINA_LOG";

/// Filter used when neither the environment nor the configuration sets one.
pub const DEFAULT_FILTER: &str = "info";

/// Picks the filter directives: the environment first, then the
/// configuration, then [`DEFAULT_FILTER`]. Blank values are skipped.
#[must_use]
pub fn directives(from_env: Option<&str>, from_config: Option<&str>) -> String {
    [from_env, from_config]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
        .unwrap_or(DEFAULT_FILTER)
        .to_owned()
}

/// Installs a stderr `fmt` subscriber.
///
/// Plugin children pass `ansi = false` so the controller can re-emit their
/// lines verbatim. Installing twice is a no-op.
pub fn init(config_filter: Option<&str>, ansi: bool) {
    let from_env = std::env::var(LOG_ENV_VAR).ok();
    let wanted = directives(from_env.as_deref(), config_filter);
    let filter = EnvFilter::try_new(&wanted).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}
