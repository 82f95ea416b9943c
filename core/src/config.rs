use chrono::NaiveDate;
use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub api: ApiConfig,
    pub extract: ExtractConfig,
    pub retry: RetryConfig,
    pub proxy: ProxyConfig,
    pub telemetry: TelemetryConfig,
}

/// Remote query API and the local gateway in front of it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    pub base_url: String,
    pub proxy_url: String,
    pub account_id: String,
    pub username: String,
    pub password: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtractConfig {
    /// Extraction window, compact `YYYYMMDD` form. Required for
    /// time-bounded tables; the CLI can override both ends.
    #[serde(default, with = "compact_date")]
    pub start_date: Option<NaiveDate>,
    #[serde(default, with = "compact_date")]
    pub end_date: Option<NaiveDate>,
    pub page_size: u64,
    pub max_concurrent_pages: usize,
    pub on_failure: FailureMode,
}

/// What a table failure does to the run: propagate, or log and emit nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    Fail,
    Empty,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    pub query: RetryPolicy,
    pub periods: RetryPolicy,
    pub forward: RetryPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    pub port: u16,
    /// When set, at most one outbound call is released per window; excess
    /// calls queue. The original deployment ran with 900 ms.
    pub rate_limit_window_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        // Load default configuration
        builder = builder.add_source(config::Config::try_from(&Config::default())?);

        // Layer on config file if it exists
        if Path::new("config.toml").exists() {
            builder = builder.add_source(File::with_name("config"));
        }

        // Layer on environment variables (CONNECTOR_ prefix)
        builder = builder.add_source(
            Environment::with_prefix("CONNECTOR")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let settings: Config = config.try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.base_url.is_empty() {
            return Err(ConfigError::Message("api.base_url is required".into()));
        }

        if self.api.proxy_url.is_empty() {
            return Err(ConfigError::Message("api.proxy_url is required".into()));
        }

        if self.api.request_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "api.request_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.extract.page_size == 0 {
            return Err(ConfigError::Message(
                "extract.page_size must be greater than 0".into(),
            ));
        }

        if self.extract.max_concurrent_pages == 0 {
            return Err(ConfigError::Message(
                "extract.max_concurrent_pages must be greater than 0".into(),
            ));
        }

        if let (Some(start), Some(end)) = (self.extract.start_date, self.extract.end_date) {
            if start > end {
                return Err(ConfigError::Message(format!(
                    "extract.start_date {start} is after extract.end_date {end}"
                )));
            }
        }

        if self.proxy.rate_limit_window_ms == Some(0) {
            return Err(ConfigError::Message(
                "proxy.rate_limit_window_ms must be greater than 0 when set".into(),
            ));
        }

        for (name, policy) in [
            ("retry.query", &self.retry.query),
            ("retry.periods", &self.retry.periods),
            ("retry.forward", &self.retry.forward),
        ] {
            policy
                .validate()
                .map_err(|e| ConfigError::Message(format!("{name}: {e}")))?;
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig {
                base_url: "https://api.example.com/3.0".to_string(),
                proxy_url: "http://127.0.0.1:9001/proxy".to_string(),
                account_id: String::new(),
                username: String::new(),
                password: String::new(),
                request_timeout_secs: 30,
            },
            extract: ExtractConfig {
                start_date: None,
                end_date: None,
                page_size: 1000,
                max_concurrent_pages: 8,
                on_failure: FailureMode::Fail,
            },
            retry: RetryConfig {
                query: RetryPolicy::for_queries(),
                periods: RetryPolicy::for_periods(),
                forward: RetryPolicy::for_forwarding(),
            },
            proxy: ProxyConfig {
                port: 9001,
                rate_limit_window_ms: None,
            },
            telemetry: TelemetryConfig {
                log_level: "info".to_string(),
                log_format: LogFormat::Pretty,
                metrics_enabled: false,
                metrics_port: 9090,
            },
        }
    }
}

/// Compact `YYYYMMDD` dates, accepted as either strings or bare numbers
/// (environment layering parses numeric-looking values into integers).
mod compact_date {
    use chrono::NaiveDate;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y%m%d";

    pub fn serialize<S>(date: &Option<NaiveDate>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => serializer.serialize_some(&d.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(i64),
            Text(String),
        }

        let raw = Option::<Raw>::deserialize(deserializer)?;
        raw.map(|r| {
            let s = match r {
                Raw::Num(n) => n.to_string(),
                Raw::Text(t) => t,
            };
            NaiveDate::parse_from_str(&s, FORMAT).map_err(de::Error::custom)
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.proxy.port, 9001);
        assert_eq!(config.extract.page_size, 1000);
        assert_eq!(config.retry.query.max_attempts, 10);
        assert_eq!(config.retry.periods.max_attempts, 5);
        assert_eq!(config.retry.forward.max_attempts, 6);
    }

    #[test]
    fn rejects_zero_page_size() {
        let mut config = Config::default();
        config.extract.page_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_date_window() {
        let mut config = Config::default();
        config.extract.start_date = NaiveDate::from_ymd_opt(2016, 6, 1);
        config.extract.end_date = NaiveDate::from_ymd_opt(2016, 1, 1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_rate_limit_window() {
        let mut config = Config::default();
        config.proxy.rate_limit_window_ms = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn compact_dates_accept_strings_and_numbers() {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(default, with = "compact_date")]
            date: Option<NaiveDate>,
        }

        let from_text: Probe = serde_json::from_str(r#"{"date": "20160101"}"#).unwrap();
        let from_num: Probe = serde_json::from_str(r#"{"date": 20160101}"#).unwrap();
        let missing: Probe = serde_json::from_str("{}").unwrap();
        let expected = NaiveDate::from_ymd_opt(2016, 1, 1);
        assert_eq!(from_text.date, expected);
        assert_eq!(from_num.date, expected);
        assert_eq!(missing.date, None);
    }

    #[test]
    fn failure_mode_round_trips_lowercase() {
        assert_eq!(
            serde_json::from_str::<FailureMode>(r#""empty""#).unwrap(),
            FailureMode::Empty
        );
        assert_eq!(serde_json::to_string(&FailureMode::Fail).unwrap(), r#""fail""#);
    }
}
