use std::env;
use std::path::PathBuf;
use std::time::Duration;

use runway_api::ServiceKind;
use runway_types::StepKind;
use runway_util::expand_tilde;
use serde::{Deserialize, Serialize};

/// Root of `config.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunwayConfig {
    pub services: ServicesConfig,
    pub engine: EngineSettings,
    pub storage: StorageConfig,
}

/// Base URLs of the remote collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServicesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_jobs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_jobs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provisioning: Option<String>,
}

impl ServicesConfig {
    pub fn location(&self, kind: ServiceKind) -> Option<&str> {
        let location = match kind {
            ServiceKind::Sql => &self.sql,
            ServiceKind::CodeJobs => &self.code_jobs,
            ServiceKind::DataJobs => &self.data_jobs,
            ServiceKind::Provisioning => &self.provisioning,
        };
        location.as_deref().filter(|value| !value.trim().is_empty())
    }

    /// Effective location of every service.
    ///
    /// Precedence: the service's `RUNWAY_*_URL` variable, then this file,
    /// then the built-in default.
    pub fn resolved_locations(&self) -> Vec<(ServiceKind, String)> {
        ServiceKind::ALL
            .into_iter()
            .map(|kind| {
                let url = env::var(kind.env_var())
                    .ok()
                    .filter(|value| !value.trim().is_empty())
                    .or_else(|| self.location(kind).map(str::to_string))
                    .unwrap_or_else(|| kind.default_base_url().to_string());
                (kind, url)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub boot_timeout_secs: u64,
    pub boot_poll_interval_ms: u64,
    pub active_window_secs: u64,
    pub workers: usize,
    pub max_redeliveries: u32,
    pub redelivery_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub polling: PollingConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            boot_timeout_secs: 600,
            boot_poll_interval_ms: 5_000,
            active_window_secs: 60,
            workers: 4,
            max_redeliveries: 3,
            redelivery_delay_ms: 1_000,
            request_timeout_secs: 30,
            polling: PollingConfig::default(),
        }
    }
}

impl EngineSettings {
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn boot_poll_interval(&self) -> Duration {
        Duration::from_millis(self.boot_poll_interval_ms)
    }

    pub fn active_window(&self) -> Duration {
        Duration::from_secs(self.active_window_secs)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Poll cadence and deadline for each step kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollingConfig {
    pub sql: PollSettings,
    pub code_job: PollSettings,
    pub import: PollSettings,
    pub export: PollSettings,
}

impl PollingConfig {
    pub fn for_kind(&self, kind: StepKind) -> &PollSettings {
        match kind {
            StepKind::Sql => &self.sql,
            StepKind::CodeJob => &self.code_job,
            StepKind::Import => &self.import,
            StepKind::Export => &self.export,
        }
    }

    /// Same settings for every kind.
    pub fn uniform(settings: PollSettings) -> Self {
        Self {
            sql: settings.clone(),
            code_job: settings.clone(),
            import: settings.clone(),
            export: settings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollSettings {
    pub interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: 2_000,
            timeout_secs: 24 * 60 * 60,
        }
    }
}

impl PollSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    pub workflows_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workflows_path: "~/.runway/workflows".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn workflows_dir(&self) -> PathBuf {
        expand_tilde(&self.workflows_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_fill_in_defaults() {
        let config: RunwayConfig = serde_json::from_str(
            r#"{
                "services": { "codeJobs": "http://flint.internal/flint" },
                "engine": { "bootTimeoutSecs": 120, "polling": { "sql": { "intervalMs": 500 } } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.services.location(ServiceKind::CodeJobs), Some("http://flint.internal/flint"));
        assert_eq!(config.services.location(ServiceKind::Sql), None);
        assert_eq!(config.engine.boot_timeout(), Duration::from_secs(120));
        assert_eq!(config.engine.workers, 4);
        assert_eq!(config.engine.polling.for_kind(StepKind::Sql).interval(), Duration::from_millis(500));
        assert_eq!(config.engine.polling.for_kind(StepKind::Sql).timeout_secs, 86_400);
        assert_eq!(config.engine.polling.for_kind(StepKind::Export), &PollSettings::default());
    }

    #[test]
    fn environment_beats_file_beats_default() {
        let services = ServicesConfig {
            sql: Some("http://file.internal/shark".into()),
            provisioning: Some("http://file.internal/redshirt".into()),
            ..ServicesConfig::default()
        };
        temp_env::with_vars(
            [
                ("RUNWAY_SQL_URL", None),
                ("RUNWAY_CODE_JOBS_URL", None),
                ("RUNWAY_DATA_JOBS_URL", None),
                ("RUNWAY_PROVISIONING_URL", Some("http://env.internal/redshirt")),
            ],
            || {
                let locations = services.resolved_locations();
                assert!(locations.contains(&(ServiceKind::Sql, "http://file.internal/shark".to_string())));
                assert!(locations.contains(&(ServiceKind::Provisioning, "http://env.internal/redshirt".to_string())));
                assert!(locations.contains(&(ServiceKind::DataJobs, ServiceKind::DataJobs.default_base_url().to_string())));
            },
        );
    }
}
