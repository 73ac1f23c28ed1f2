//! Logging integration for tessera.
//!
//! Provides helpers for configuring [`tracing`]-based logging from
//! [`Settings`](crate::settings::Settings) and for creating per-compilation spans.

use crate::settings::Settings;

/// Sets up the global tracing subscriber based on the given settings.
///
/// The filter is read from `settings.log_level` (e.g. "debug", "warn",
/// "tessera_template::cache=trace"). In debug mode a pretty, human-readable
/// format is used; otherwise a structured JSON format is used.
///
/// Installing a subscriber twice is not an error; the second call is a no-op.
pub fn setup_logging(settings: &Settings) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if settings.debug {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(true)
            .with_line_number(true)
            .pretty()
            .try_init()
            .ok();
    } else {
        fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .try_init()
            .ok();
    }
}

/// Creates a tracing span for one template compilation.
///
/// Every log entry emitted while the span is entered carries the template name.
///
/// # Examples
///
/// ```
/// use tessera_core::logging::compile_span;
///
/// let span = compile_span("pages/home.html");
/// let _guard = span.enter();
/// tracing::info!("compiling");
/// ```
pub fn compile_span(template: &str) -> tracing::Span {
    tracing::info_span!("compile", template = template)
}

/// Creates a tracing span for one render of a compiled template.
pub fn render_span(template: &str, depth: usize) -> tracing::Span {
    tracing::debug_span!("render", template = template, depth = depth)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_logging_twice_is_harmless() {
        let settings = Settings::with_log_level("not a == valid filter");
        setup_logging(&settings);
        setup_logging(&Settings::default());
    }

    #[test]
    fn test_spans_can_be_entered() {
        let span = compile_span("a.html");
        let _guard = span.enter();
        let inner = render_span("a.html", 1);
        let _inner = inner.enter();
        tracing::debug!("inside");
    }
}
