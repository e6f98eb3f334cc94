use std::{env, fmt::Display, path::PathBuf, str::FromStr};

use tracing::{info, warn};

use crate::logging::LogFormat;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api";
pub const DEFAULT_STORE_PATH: &str = "featurevote_data";

/// Client settings, read from the environment (and `.env` via dotenvy).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: String,
    pub store_path: PathBuf,
    pub log_format: LogFormat,
    pub log_dir: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            store_path: PathBuf::from(DEFAULT_STORE_PATH),
            log_format: LogFormat::Pretty,
            log_dir: None,
        }
    }
}

impl ClientConfig {
    pub fn load() -> Self {
        // A missing .env is the normal case.
        let _ = dotenvy::dotenv();

        Self {
            api_url: try_load("FEATUREVOTE_API_URL", DEFAULT_API_URL),
            store_path: try_load("FEATUREVOTE_STORE_PATH", DEFAULT_STORE_PATH),
            log_format: try_load("FEATUREVOTE_LOG_FORMAT", "pretty"),
            log_dir: var("FEATUREVOTE_LOG_DIR").ok().map(PathBuf::from),
        }
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }
}

fn var(key: &str) -> Result<String, env::VarError> {
    env::var(key)
}

/// Reads `key`, falling back to `default` when it is unset or unparsable.
fn try_load<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    let raw = var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    match raw.parse() {
        Ok(value) => value,
        Err(e) => {
            warn!("Invalid {key} value '{raw}': {e}, using default: {default}");
            parse_default(key, default)
        }
    }
}

fn parse_default<T: FromStr>(key: &str, default: &str) -> T
where
    T::Err: Display,
{
    match default.parse() {
        Ok(value) => value,
        // Defaults are compile-time constants that always parse.
        Err(e) => unreachable!("default for {key} does not parse: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_load_falls_back_on_bad_value() {
        env::set_var("FEATUREVOTE_TEST_FORMAT", "xml");
        let format: LogFormat = try_load("FEATUREVOTE_TEST_FORMAT", "json");
        assert_eq!(format, LogFormat::Json);
        env::remove_var("FEATUREVOTE_TEST_FORMAT");
    }

    #[test]
    fn test_try_load_reads_set_value() {
        env::set_var("FEATUREVOTE_TEST_URL", "http://10.0.0.2:9000/api");
        let url: String = try_load("FEATUREVOTE_TEST_URL", DEFAULT_API_URL);
        assert_eq!(url, "http://10.0.0.2:9000/api");
        env::remove_var("FEATUREVOTE_TEST_URL");

        let missing: String = try_load("FEATUREVOTE_TEST_UNSET_KEY", DEFAULT_API_URL);
        assert_eq!(missing, DEFAULT_API_URL);
    }

    #[test]
    fn test_with_api_url_overrides() {
        let config = ClientConfig::default().with_api_url("http://localhost:1/api");
        assert_eq!(config.api_url, "http://localhost:1/api");
        assert_eq!(config.store_path, PathBuf::from(DEFAULT_STORE_PATH));
    }
}
