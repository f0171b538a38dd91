//! Structured logging setup.
//!
//! Subsystems log under fixed targets so they can be tuned independently:
//! `mx::wire`, `mx::region`, `mx::pull`, `mx::endpoint`, `mx::nic` and
//! `mx::transport`. `RUST_LOG`, when set, takes precedence over the
//! configured levels.

use crate::config::LoggingConfig;
use crate::error::{MxError, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Build the level filter described by `config`.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut filter = EnvFilter::new(config.log_level.to_string().to_lowercase());
    for (target, level) in &config.subsystem_levels {
        let directive: Directive = format!("{target}={}", level.to_lowercase())
            .parse()
            .map_err(|e| MxError::Config(format!("Invalid log directive for '{target}': {e}")))?;
        filter = filter.add_directive(directive);
    }
    Ok(filter)
}

/// Install the global subscriber.
///
/// Fails if the configuration is invalid or a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let errors = config.validate();
    if !errors.is_empty() {
        return Err(MxError::Config(errors.join("; ")));
    }

    let console = config
        .log_to_console
        .then(|| tracing_subscriber::fmt::layer().with_target(true));

    let file = match (config.log_to_file, config.log_file_path.as_deref()) {
        (true, Some(path)) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| MxError::Config(format!("Failed to open log file: {e}")))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(build_filter(config)?)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| MxError::Config(format!("Failed to install subscriber: {e}")))?;

    tracing::info!(target: "mx::nic", app = %config.app_name, "Logging initialized");
    Ok(())
}
