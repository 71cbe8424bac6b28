use std::time::Duration;

use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};

/// `STATUS` values the device uses for a successful answer.
const SUCCESS_STATUSES: [&str; 2] = ["OK", "EOL"];

/// Raw HTTP access to the meter. Knows nothing about sessions: callers hand
/// it complete paths, token prefix included.
pub struct DeviceClient {
    host: String,
    client: reqwest::Client,
}

impl DeviceClient {
    /// Every request gives up after `timeout`, so a device that accepts the
    /// connection and never answers surfaces as a transport error.
    pub fn new(host: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            host: host.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// GETs `path` and returns the body fields other than `STATUS`.
    pub async fn get(&self, path: &str) -> Result<Map<String, Value>> {
        debug!("GET {path}");

        let body = self
            .client
            .get(format!("{}{}", self.host, path))
            .send()
            .await?
            .text()
            .await?;

        parse_body(path, &body)
    }
}

fn parse_body(path: &str, body: &str) -> Result<Map<String, Value>> {
    let malformed = |message: String| Error::Malformed {
        path: path.to_string(),
        message,
    };

    let mut fields = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(fields)) => fields,
        Ok(other) => return Err(malformed(format!("expected a JSON object, got {other}"))),
        Err(e) => return Err(malformed(e.to_string())),
    };

    match fields.remove("STATUS") {
        Some(Value::String(status)) if SUCCESS_STATUSES.contains(&status.as_str()) => Ok(fields),
        Some(Value::String(status)) => Err(Error::Status {
            path: path.to_string(),
            status,
        }),
        Some(other) => Err(Error::Status {
            path: path.to_string(),
            status: other.to_string(),
        }),
        None => Err(malformed("missing STATUS".to_string())),
    }
}
