use std::sync::Once;

use log::LevelFilter;
use once_cell::sync::OnceCell;

/// Crate-specific filter variable, consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "CS1237_LOG";

static RUST_LOG_ONCE: Once = Once::new();
static EFFECTIVE_LEVEL: OnceCell<LevelFilter> = OnceCell::new();

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Parse a level name such as `"debug"`.
pub fn parse_level(input: Option<&str>) -> Option<LevelFilter> {
    input.and_then(|s| s.trim().parse::<LevelFilter>().ok())
}

fn env_filters() -> String {
    std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| level_to_str(LevelFilter::Info).to_string())
}

/// Initialize stderr logging from `CS1237_LOG`/`RUST_LOG` (default `info`).
///
/// Returns the effective maximum level. Only the first call installs a logger.
pub fn init_rust_logging() -> LevelFilter {
    init_logging_with(None)
}

/// Like [`init_rust_logging`], but an explicit level overrides the environment.
pub fn init_logging_with(level: Option<LevelFilter>) -> LevelFilter {
    RUST_LOG_ONCE.call_once(|| {
        let filters = match level {
            Some(level) => level_to_str(level).to_string(),
            None => env_filters(),
        };
        // A logger installed elsewhere wins; max_level then reflects that logger.
        let _ = env_logger::Builder::new()
            .parse_filters(&filters)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(true)
            .try_init();
        let _ = EFFECTIVE_LEVEL.set(log::max_level());
    });
    EFFECTIVE_LEVEL.get().copied().unwrap_or_else(log::max_level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse() {
        assert_eq!(parse_level(Some("debug")), Some(LevelFilter::Debug));
        assert_eq!(parse_level(Some(" WARN ")), Some(LevelFilter::Warn));
        assert_eq!(parse_level(Some("loud")), None);
        assert_eq!(parse_level(None), None);
    }

    #[test]
    fn repeated_init_reports_the_same_level() {
        let first = init_logging_with(Some(LevelFilter::Warn));
        let second = init_rust_logging();
        assert_eq!(first, second);
    }
}
