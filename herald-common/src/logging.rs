use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:expr),*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg),*)
    }};
}

/// Traffic towards a transport or an external provider
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::outgoing!(level = TRACE, $($msg),*)
    };
}

/// Traffic arriving from outside: webhooks and bounce mailboxes
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "incoming", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::incoming!(level = TRACE, $($msg),*)
    };
}

#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

/// Level used when `LOG_LEVEL` is unset or unreadable
const fn default_level() -> LevelFilter {
    if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    }
}

fn parse_level(value: Option<&str>) -> Result<LevelFilter, String> {
    match value.map(str::trim) {
        None | Some("") => Ok(default_level()),
        Some(level) => LevelFilter::from_str(level).map_err(|_| level.to_string()),
    }
}

/// Only the workspace's own crates log; dependencies stay quiet
fn is_herald_target(target: &str) -> bool {
    target.starts_with("herald")
}

/// Install the global tracing subscriber
///
/// The level comes from `LOG_LEVEL`. Calling it again after a subscriber is
/// installed does nothing.
pub fn init() {
    let level = parse_level(std::env::var("LOG_LEVEL").ok().as_deref()).unwrap_or_else(|level| {
        eprintln!(
            "Invalid LOG_LEVEL {level:?}, using {}",
            default_level()
        );
        default_level()
    });

    let installed = tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(false)
                .with_line_number(false)
                .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
                .with_writer(std::io::stderr)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| is_herald_target(metadata.target()))),
        )
        .try_init();

    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level(None), Ok(default_level()));
        assert_eq!(parse_level(Some("  ")), Ok(default_level()));
        assert_eq!(parse_level(Some("warn")), Ok(LevelFilter::WARN));
        assert_eq!(parse_level(Some("DEBUG")), Ok(LevelFilter::DEBUG));
        assert_eq!(parse_level(Some("loud")), Err("loud".to_string()));
    }

    #[test]
    fn test_target_filter() {
        assert!(is_herald_target("herald_dispatch::worker"));
        assert!(is_herald_target("herald"));
        assert!(!is_herald_target("tokio::runtime"));
        assert!(!is_herald_target("opentelemetry_sdk"));
    }
}
