use std::env;
use std::time::Duration;

use anyhow::Context;

const DEFAULT_INTERVAL_MS: u64 = 10_000;

/// Fixed delays of the session and polling cycles.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Unconditional re-login period.
    pub relogin_interval: Duration,
    /// Quiet time after the last successful request before re-authenticating.
    pub idle_timeout: Duration,
    /// Wait between a failure and the recovery login.
    pub retry_delay: Duration,
    /// Report poll period while no log record has been seen yet.
    pub report_fallback: Duration,
    /// The device writes one log record per period.
    pub log_period: Duration,
    /// Added to the next expected log time so the record is surely written.
    pub report_slack: Duration,
    /// Longest a single device request may take before it counts as failed.
    pub request_timeout: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            relogin_interval: Duration::from_secs(10 * 60),
            idle_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_millis(1000),
            report_fallback: Duration::from_secs(5),
            log_period: Duration::from_secs(300),
            report_slack: Duration::from_millis(100),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Device base URL, e.g. `http://192.168.1.50`.
    pub host: String,
    pub password: String,
    /// Metric refresh period.
    pub interval: Duration,
    pub timings: Timings,
}

impl Config {
    pub fn new(host: impl Into<String>, password: impl Into<String>, interval: Duration) -> Self {
        Self {
            host: host.into().trim_end_matches('/').to_string(),
            password: password.into(),
            interval,
            timings: Timings::default(),
        }
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Reads `OVERVIS_HOST`, `OVERVIS_PASSWORD` and `OVERVIS_INTERVAL` (ms).
    pub fn from_env() -> anyhow::Result<Self> {
        let host = env::var("OVERVIS_HOST").context("OVERVIS_HOST must be set")?;
        let password = env::var("OVERVIS_PASSWORD").context("OVERVIS_PASSWORD must be set")?;
        let interval = parse_interval(env::var("OVERVIS_INTERVAL").ok())?;

        Ok(Self::new(host, password, interval))
    }
}

fn parse_interval(val: Option<String>) -> anyhow::Result<Duration> {
    match val.as_deref().map(str::trim) {
        None | Some("") => Ok(Duration::from_millis(DEFAULT_INTERVAL_MS)),
        Some(raw) => {
            let ms: u64 = raw
                .parse()
                .with_context(|| format!("OVERVIS_INTERVAL is not a number of ms: `{raw}`"))?;
            anyhow::ensure!(ms > 0, "OVERVIS_INTERVAL must be greater than zero");
            Ok(Duration::from_millis(ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_interval() {
        assert_eq!(
            parse_interval(None).unwrap(),
            Duration::from_millis(DEFAULT_INTERVAL_MS)
        );
        assert_eq!(
            parse_interval(Some("".to_string())).unwrap(),
            Duration::from_millis(DEFAULT_INTERVAL_MS)
        );
        assert_eq!(
            parse_interval(Some(" 2500 ".to_string())).unwrap(),
            Duration::from_millis(2500)
        );
        assert!(parse_interval(Some("fast".to_string())).is_err());
        assert!(parse_interval(Some("0".to_string())).is_err());
    }

    #[test]
    fn test_host_trailing_slash_trimmed() {
        let config = Config::new("http://meter.local/", "secret", Duration::from_secs(1));
        assert_eq!(config.host, "http://meter.local");
        assert_eq!(config.timings.idle_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_from_env() {
        env::set_var("OVERVIS_HOST", "http://10.0.0.9");
        env::set_var("OVERVIS_PASSWORD", "hunter2");
        env::set_var("OVERVIS_INTERVAL", "3000");

        let config = Config::from_env().unwrap();
        assert_eq!(config.host, "http://10.0.0.9");
        assert_eq!(config.password, "hunter2");
        assert_eq!(config.interval, Duration::from_millis(3000));

        env::remove_var("OVERVIS_HOST");
        assert!(Config::from_env().is_err());

        env::remove_var("OVERVIS_PASSWORD");
        env::remove_var("OVERVIS_INTERVAL");
    }
}
