use std::path::PathBuf;
use std::time::Duration;

use crate::dest::DestinationConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DRIVEBACK_SOURCE_TOKEN is not set")]
    MissingToken,
    #[error("DRIVEBACK_DESTINATIONS_FILE is not set")]
    MissingDestinations,
    #[error("failed to read destinations file {0}: {1}")]
    DestinationsIo(PathBuf, #[source] std::io::Error),
    #[error("invalid destinations file {0}: {1}")]
    DestinationsParse(PathBuf, #[source] serde_json::Error),
    #[error("destinations file {0} declares no destinations")]
    EmptyDestinations(PathBuf),
    #[error("duplicate destination id {0}")]
    DuplicateDestination(String),
}

/// Runtime configuration, read from the environment once at startup.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub source_token: String,
    pub source_url: Option<String>,
    pub state_db: Option<PathBuf>,
    pub staging_dir: PathBuf,
    pub staging_quota_bytes: u64,
    pub workers: usize,
    pub poll_interval: Duration,
    pub op_timeout: Duration,
    pub retry_max_attempts: u32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub retry_rate_limit_base: Duration,
    pub destinations: Vec<DestinationConfig>,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let source_token =
            std::env::var("DRIVEBACK_SOURCE_TOKEN").map_err(|_| ConfigError::MissingToken)?;
        let destinations_file = std::env::var("DRIVEBACK_DESTINATIONS_FILE")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::MissingDestinations)?;
        let destinations = load_destinations(&destinations_file)?;

        let staging_dir = std::env::var("DRIVEBACK_STAGING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("driveback-staging"));

        Ok(Self {
            source_token,
            source_url: std::env::var("DRIVEBACK_SOURCE_URL").ok(),
            state_db: std::env::var("DRIVEBACK_STATE_DB").ok().map(PathBuf::from),
            staging_dir,
            // 2 GiB of staged downloads by default.
            staging_quota_bytes: read_u64_env("DRIVEBACK_STAGING_QUOTA_BYTES", 2 * 1024 * 1024 * 1024),
            workers: read_u64_env("DRIVEBACK_WORKERS", 4) as usize,
            poll_interval: Duration::from_secs(read_u64_env("DRIVEBACK_POLL_SECS", 300)),
            op_timeout: Duration::from_secs(read_u64_env("DRIVEBACK_OP_TIMEOUT_SECS", 600)),
            retry_max_attempts: read_u64_env("DRIVEBACK_RETRY_MAX_ATTEMPTS", 5) as u32,
            retry_base: Duration::from_secs(read_u64_env("DRIVEBACK_RETRY_BASE_SECS", 30)),
            retry_max: Duration::from_secs(read_u64_env("DRIVEBACK_RETRY_MAX_SECS", 900)),
            retry_rate_limit_base: Duration::from_secs(read_u64_env(
                "DRIVEBACK_RETRY_RATE_LIMIT_BASE_SECS",
                120,
            )),
            destinations,
        })
    }
}

fn load_destinations(path: &PathBuf) -> Result<Vec<DestinationConfig>, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| ConfigError::DestinationsIo(path.clone(), err))?;
    let destinations: Vec<DestinationConfig> = serde_json::from_str(&raw)
        .map_err(|err| ConfigError::DestinationsParse(path.clone(), err))?;
    if destinations.is_empty() {
        return Err(ConfigError::EmptyDestinations(path.clone()));
    }
    let mut seen = std::collections::HashSet::new();
    for dest in &destinations {
        if !seen.insert(dest.id.clone()) {
            return Err(ConfigError::DuplicateDestination(dest.id.clone()));
        }
    }
    Ok(destinations)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn read_u64_env_falls_back_on_missing_or_zero() {
        unsafe {
            std::env::remove_var("DRIVEBACK_TEST_U64_MISSING");
            std::env::set_var("DRIVEBACK_TEST_U64_ZERO", "0");
            std::env::set_var("DRIVEBACK_TEST_U64_SET", "42");
        }
        assert_eq!(read_u64_env("DRIVEBACK_TEST_U64_MISSING", 7), 7);
        assert_eq!(read_u64_env("DRIVEBACK_TEST_U64_ZERO", 7), 7);
        assert_eq!(read_u64_env("DRIVEBACK_TEST_U64_SET", 7), 42);
    }

    #[test]
    fn destinations_file_parses_and_rejects_duplicates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("destinations.json");
        std::fs::write(
            &path,
            r#"[
                {"id": "s3-us", "kind": "s3_gateway", "endpoint": "https://gw.example",
                 "bucket": "backup", "prefix": "drive", "token": "t1"},
                {"id": "b2-eu", "kind": "b2_vault", "endpoint": "https://vault.example",
                 "bucket": "backup", "token": "t2"}
            ]"#,
        )
        .unwrap();
        let destinations = load_destinations(&path).unwrap();
        assert_eq!(destinations.len(), 2);
        assert_eq!(destinations[0].id, "s3-us");

        std::fs::write(
            &path,
            r#"[
                {"id": "s3-us", "kind": "s3_gateway", "endpoint": "https://gw.example",
                 "bucket": "backup", "token": "t1"},
                {"id": "s3-us", "kind": "s3_gateway", "endpoint": "https://gw2.example",
                 "bucket": "backup", "token": "t2"}
            ]"#,
        )
        .unwrap();
        assert!(matches!(
            load_destinations(&path),
            Err(ConfigError::DuplicateDestination(id)) if id == "s3-us"
        ));
    }

    #[test]
    fn empty_destinations_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("destinations.json");
        std::fs::write(&path, "[]").unwrap();
        assert!(matches!(
            load_destinations(&path),
            Err(ConfigError::EmptyDestinations(_))
        ));
    }
}
