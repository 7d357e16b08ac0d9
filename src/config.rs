use anyhow::Result;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub database_url: String,
    pub session_id: Option<i64>,
    pub scanner_device: String,
    pub scanner_fallback_device: Option<String>,
    pub sync_interval: Duration,
    pub connectivity_probe_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_base_url = lookup("API_BASE_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| anyhow::anyhow!("API_BASE_URL environment variable is required"))?;

        let api_token = lookup("API_TOKEN").filter(|token| !token.is_empty());

        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| "sqlite:scan_queue.db".to_string());

        let session_id = match lookup("SESSION_ID") {
            Some(raw) => Some(
                raw.parse::<i64>()
                    .map_err(|_| anyhow::anyhow!("SESSION_ID must be an integer, got {:?}", raw))?,
            ),
            None => None,
        };

        let scanner_device = lookup("SCANNER_DEVICE").unwrap_or_else(|| "-".to_string());
        let scanner_fallback_device = lookup("SCANNER_FALLBACK_DEVICE");

        let sync_interval = Duration::from_secs(parse_secs(&lookup, "SYNC_INTERVAL_SECS", 30)?);
        let connectivity_probe_interval =
            Duration::from_secs(parse_secs(&lookup, "CONNECTIVITY_PROBE_SECS", 10)?);

        Ok(Config {
            api_base_url,
            api_token,
            database_url,
            session_id,
            scanner_device,
            scanner_fallback_device,
            sync_interval,
            connectivity_probe_interval,
        })
    }
}

fn parse_secs<F>(lookup: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => {
            let secs = raw
                .parse::<u64>()
                .map_err(|_| anyhow::anyhow!("{} must be a number of seconds, got {:?}", key, raw))?;
            if secs == 0 {
                return Err(anyhow::anyhow!("{} must be greater than zero", key));
            }
            Ok(secs)
        }
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn requires_api_base_url() {
        let err = Config::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(err.to_string().contains("API_BASE_URL"));
    }

    #[test]
    fn applies_defaults() {
        let config =
            Config::from_lookup(lookup_from(&[("API_BASE_URL", "https://api.example.org/api/")]))
                .unwrap();
        assert_eq!(config.api_base_url, "https://api.example.org/api");
        assert_eq!(config.database_url, "sqlite:scan_queue.db");
        assert_eq!(config.scanner_device, "-");
        assert_eq!(config.sync_interval, Duration::from_secs(30));
        assert!(config.api_token.is_none());
        assert!(config.session_id.is_none());
    }

    #[test]
    fn rejects_bad_numbers() {
        let err = Config::from_lookup(lookup_from(&[
            ("API_BASE_URL", "http://localhost:4000"),
            ("SESSION_ID", "forty-two"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("SESSION_ID"));

        let err = Config::from_lookup(lookup_from(&[
            ("API_BASE_URL", "http://localhost:4000"),
            ("SYNC_INTERVAL_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("SYNC_INTERVAL_SECS"));
    }
}
