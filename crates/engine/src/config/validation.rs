//! Configuration validation.

use runway_api::{ServiceError, ServiceKind, validate_base_url};
use runway_types::StepKind;
use thiserror::Error;
use tracing::debug;

use super::RunwayConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid location for service '{service}': {source}")]
    InvalidServiceUrl {
        service: ServiceKind,
        #[source]
        source: ServiceError,
    },

    #[error("'{field}' must be greater than zero")]
    MustBePositive { field: String },

    #[error("'storage.workflowsPath' cannot be empty")]
    MissingWorkflowsPath,
}

impl ConfigError {
    fn must_be_positive(field: impl Into<String>) -> Self {
        Self::MustBePositive { field: field.into() }
    }
}

/// Validate the entire configuration.
pub fn validate_config(config: &RunwayConfig) -> Result<(), ConfigError> {
    for service in ServiceKind::ALL {
        if let Some(url) = config.services.location(service) {
            validate_base_url(service, url).map_err(|source| ConfigError::InvalidServiceUrl { service, source })?;
            debug!(%service, %url, "validated service location");
        }
    }

    let engine = &config.engine;
    let positive = [
        ("engine.bootTimeoutSecs", engine.boot_timeout_secs),
        ("engine.bootPollIntervalMs", engine.boot_poll_interval_ms),
        ("engine.activeWindowSecs", engine.active_window_secs),
        ("engine.workers", engine.workers as u64),
        ("engine.requestTimeoutSecs", engine.request_timeout_secs),
    ];
    for (field, value) in positive {
        if value == 0 {
            return Err(ConfigError::must_be_positive(field));
        }
    }

    for kind in StepKind::ALL {
        let settings = engine.polling.for_kind(kind);
        if settings.interval_ms == 0 {
            return Err(ConfigError::must_be_positive(format!("engine.polling.{}.intervalMs", polling_key(kind))));
        }
        if settings.timeout_secs == 0 {
            return Err(ConfigError::must_be_positive(format!("engine.polling.{}.timeoutSecs", polling_key(kind))));
        }
    }

    if config.storage.workflows_path.trim().is_empty() {
        return Err(ConfigError::MissingWorkflowsPath);
    }

    Ok(())
}

fn polling_key(kind: StepKind) -> &'static str {
    match kind {
        StepKind::Sql => "sql",
        StepKind::CodeJob => "codeJob",
        StepKind::Import => "import",
        StepKind::Export => "export",
    }
}
