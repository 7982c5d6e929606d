//! Engine settings from configuration or environment variables.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sluice_core::{BatchError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Upper bound on a single fetch, including planning.
    pub fetch_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Extra connection attempts after the first failure (relational only).
    pub connect_retries: u32,
    pub max_connections: u32,
    /// DataFusion/Ballista target partitions for file scans.
    pub target_partitions: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 300,
            connect_timeout_secs: 10,
            connect_retries: 3,
            max_connections: 5,
            target_partitions: 4,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            fetch_timeout_secs: env_or("SLUICE_FETCH_TIMEOUT_SECS", defaults.fetch_timeout_secs)?,
            connect_timeout_secs: env_or(
                "SLUICE_CONNECT_TIMEOUT_SECS",
                defaults.connect_timeout_secs,
            )?,
            connect_retries: env_or("SLUICE_CONNECT_RETRIES", defaults.connect_retries)?,
            max_connections: env_or("SLUICE_MAX_CONNECTIONS", defaults.max_connections)?,
            target_partitions: env_or("SLUICE_TARGET_PARTITIONS", defaults.target_partitions)?,
        })
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Run `fut` under the fetch timeout, mapping expiry to `BatchError::Timeout`.
    pub async fn with_timeout<T, F>(&self, engine: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.fetch_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(BatchError::Timeout {
                engine: engine.to_string(),
                seconds: self.fetch_timeout_secs,
            }),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BatchError::InvalidConfig(format!("Invalid {}: '{}'", key, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid races.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "SLUICE_FETCH_TIMEOUT_SECS",
            "SLUICE_CONNECT_TIMEOUT_SECS",
            "SLUICE_CONNECT_RETRIES",
            "SLUICE_MAX_CONNECTIONS",
            "SLUICE_TARGET_PARTITIONS",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        let settings = EngineSettings::from_env().unwrap();
        assert_eq!(settings, EngineSettings::default());
        assert_eq!(settings.fetch_timeout(), Duration::from_secs(300));

        clear_env();
    }

    #[test]
    fn from_env_with_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        unsafe {
            std::env::set_var("SLUICE_FETCH_TIMEOUT_SECS", "30");
            std::env::set_var("SLUICE_CONNECT_RETRIES", "0");
            std::env::set_var("SLUICE_TARGET_PARTITIONS", "8");
        }

        let settings = EngineSettings::from_env().unwrap();
        assert_eq!(settings.fetch_timeout_secs, 30);
        assert_eq!(settings.connect_retries, 0);
        assert_eq!(settings.target_partitions, 8);
        assert_eq!(settings.max_connections, 5);

        clear_env();
    }

    #[test]
    fn from_env_invalid_value() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env();

        unsafe {
            std::env::set_var("SLUICE_MAX_CONNECTIONS", "lots");
        }

        let err = EngineSettings::from_env().unwrap_err();
        assert!(matches!(err, BatchError::InvalidConfig(_)));

        clear_env();
    }

    #[test]
    fn partial_settings_deserialize_with_defaults() {
        let settings: EngineSettings =
            serde_json::from_str(r#"{"fetch_timeout_secs": 5}"#).unwrap();
        assert_eq!(settings.fetch_timeout_secs, 5);
        assert_eq!(settings.connect_retries, 3);
    }

    #[tokio::test]
    async fn with_timeout_maps_expiry() {
        let settings = EngineSettings {
            fetch_timeout_secs: 0,
            ..Default::default()
        };
        let result: Result<()> = settings
            .with_timeout("slow", async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BatchError::Timeout { seconds: 0, .. })));
    }
}
