use std::collections::HashMap;
use std::env;
use std::sync::RwLock;

use tracing::info;

use crate::{ServiceError, ServiceKind, validate_base_url};

/// Current base URL of every remote service.
///
/// Shared behind an `Arc` by all HTTP collaborators. Locations can be
/// replaced at runtime with [`ServiceRegistry::refresh`] when service
/// discovery reports a move.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    locations: RwLock<HashMap<ServiceKind, String>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated from `RUNWAY_*_URL` variables, falling back to
    /// each service's default location.
    pub fn from_env() -> Result<Self, ServiceError> {
        let registry = Self::new();
        registry.refresh(
            ServiceKind::ALL
                .into_iter()
                .map(|kind| (kind, env::var(kind.env_var()).unwrap_or_else(|_| kind.default_base_url().to_string()))),
        )?;
        Ok(registry)
    }

    /// Registers or moves a single service.
    pub fn set(&self, kind: ServiceKind, base_url: &str) -> Result<(), ServiceError> {
        validate_base_url(kind, base_url)?;
        self.write().insert(kind, base_url.to_string());
        Ok(())
    }

    /// Applies a batch of locations atomically; nothing changes if any entry is invalid.
    pub fn refresh(&self, locations: impl IntoIterator<Item = (ServiceKind, String)>) -> Result<(), ServiceError> {
        let locations: Vec<(ServiceKind, String)> = locations.into_iter().collect();
        for (kind, url) in &locations {
            validate_base_url(*kind, url)?;
        }

        let mut guard = self.write();
        for (kind, url) in locations {
            if guard.get(&kind) != Some(&url) {
                info!(service = %kind, %url, "service location updated");
            }
            guard.insert(kind, url);
        }
        Ok(())
    }

    pub fn base_url(&self, kind: ServiceKind) -> Result<String, ServiceError> {
        let guard = self.locations.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.get(&kind).cloned().ok_or(ServiceError::NotRegistered(kind))
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ServiceKind, String>> {
        self.locations.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        temp_env::with_vars(
            [
                ("RUNWAY_SQL_URL", Some("http://shark.internal:9000/shark")),
                ("RUNWAY_CODE_JOBS_URL", None),
            ],
            || {
                let registry = ServiceRegistry::from_env().unwrap();
                assert_eq!(registry.base_url(ServiceKind::Sql).unwrap(), "http://shark.internal:9000/shark");
                assert_eq!(registry.base_url(ServiceKind::CodeJobs).unwrap(), ServiceKind::CodeJobs.default_base_url());
            },
        );
    }

    #[test]
    fn refresh_is_all_or_nothing() {
        let registry = ServiceRegistry::new();
        registry.set(ServiceKind::Provisioning, "http://redshirt.internal").unwrap();

        let result = registry.refresh([
            (ServiceKind::Provisioning, "http://moved.internal".to_string()),
            (ServiceKind::Sql, "mailto:nobody".to_string()),
        ]);

        assert!(result.is_err());
        assert_eq!(registry.base_url(ServiceKind::Provisioning).unwrap(), "http://redshirt.internal");
        assert!(registry.base_url(ServiceKind::Sql).is_err());
    }
}
