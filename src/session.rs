use std::sync::{Mutex, MutexGuard};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_derive::Serialize;
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::device_client::DeviceClient;
use crate::error::{Error, Result};

/// Device type codes reported by `/login?device_info`.
const MODELS: [(u64, &str); 5] = [
    (243, "EM-125"),
    (255, "EM-125S"),
    (293, "EM-126T"),
    (285, "EM-126TS"),
    (271, "EM-129"),
];

pub fn model_name(device_id: u64) -> Option<&'static str> {
    MODELS
        .iter()
        .find(|(id, _)| *id == device_id)
        .map(|(_, name)| *name)
}

/// Hex SHA-1 of `device_type + base64(password) + salt`.
pub fn credential(device_type: &str, password: &str, salt: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(device_type.as_bytes());
    hasher.update(STANDARD.encode(password).as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Default, Debug, Clone, PartialEq)]
pub struct Session {
    pub token: Option<String>,
    pub salt: String,
    pub device_type: String,
    pub device_name: String,
}

/// Identity published alongside connection changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    #[serde(rename = "type")]
    pub model: Option<String>,
    pub name: String,
}

/// Holds the session token and performs the salted login handshake.
///
/// Methods here talk to the device directly; callers are expected to run them
/// inside the request queue so the token never changes under an in-flight
/// request.
pub struct SessionManager {
    client: DeviceClient,
    password: String,
    session: Mutex<Session>,
    last_success: Mutex<Option<Instant>>,
}

impl SessionManager {
    pub fn new(client: DeviceClient, password: impl Into<String>) -> Self {
        Self {
            client,
            password: password.into(),
            session: Mutex::new(Session::default()),
            last_success: Mutex::new(None),
        }
    }

    pub fn session(&self) -> Session {
        lock(&self.session).clone()
    }

    pub fn token(&self) -> Option<String> {
        lock(&self.session).token.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        lock(&self.session).token.is_some()
    }

    /// Identity from the last successful login.
    pub fn info(&self) -> Option<DeviceInfo> {
        let session = lock(&self.session);
        session.token.as_ref().map(|_| DeviceInfo {
            model: model_name_from_type(&session.device_type),
            name: session.device_name.clone(),
        })
    }

    /// Turns a bare API path such as `/all/get?volt_msr` into the request path,
    /// prefixed with the session token once one is held.
    pub fn authenticated_path(&self, path: &str) -> String {
        match lock(&self.session).token.as_deref() {
            Some(token) => format!("/{token}/api{path}"),
            None => format!("/api{path}"),
        }
    }

    /// When the idle timer expires, or `None` before the first successful request.
    pub fn idle_deadline(&self, idle_timeout: std::time::Duration) -> Option<Instant> {
        lock(&self.last_success).map(|at| at + idle_timeout)
    }

    /// Drops the token so the next handshake starts unauthenticated.
    pub fn invalidate(&self) {
        lock(&self.session).token = None;
    }

    /// Issues one request and re-arms the idle timer if it succeeds.
    pub async fn request(&self, path: &str) -> Result<Map<String, Value>> {
        let fields = self.client.get(&self.authenticated_path(path)).await?;
        *lock(&self.last_success) = Some(Instant::now());
        Ok(fields)
    }

    /// Full challenge/response handshake. On success the whole session is
    /// replaced at once; on failure the token is dropped.
    pub async fn login(&self) -> Result<DeviceInfo> {
        match self.handshake().await {
            Ok(session) => {
                let info = DeviceInfo {
                    model: model_name_from_type(&session.device_type),
                    name: session.device_name.clone(),
                };
                info!(
                    "Logged in to {} ({})",
                    info.name,
                    info.model.as_deref().unwrap_or("unknown model")
                );
                *lock(&self.session) = session;
                Ok(info)
            }
            Err(e) => {
                warn!("Login failed: {e}");
                self.invalidate();
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<Session> {
        let (salt, identity) =
            tokio::try_join!(self.request("/login?salt"), self.request("/login?device_info"))?;

        let salt = text_field(&salt, "SALT")?;
        let device_id = identity
            .get("device_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Authentication("device_info without device_id".into()))?;
        let device_type = match model_name(device_id) {
            Some(model) => model.to_string(),
            None => {
                warn!("Unknown device model code {device_id}");
                String::new()
            }
        };
        let device_name = STANDARD
            .decode(text_field(&identity, "user_info")?)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .map_err(|e| Error::Authentication(format!("user_info is not base64: {e}")))?;

        let hash = credential(&device_type, &self.password, &salt);
        let reply = self.request(&format!("/login?login={hash}")).await?;
        let token = text_field(&reply, "SID")?;

        Ok(Session {
            token: Some(token),
            salt,
            device_type,
            device_name,
        })
    }
}

fn model_name_from_type(device_type: &str) -> Option<String> {
    (!device_type.is_empty()).then(|| device_type.to_string())
}

/// Reads a field the device may send either as a string or a number.
fn text_field(fields: &Map<String, Value>, key: &str) -> Result<String> {
    match fields.get(key) {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Number(number)) => Ok(number.to_string()),
        _ => Err(Error::Authentication(format!("response missing {key}"))),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn client(host: &str) -> DeviceClient {
        DeviceClient::new(host, Duration::from_secs(2)).unwrap()
    }

    async fn mock_handshake(server: &mut mockito::ServerGuard, prefix: &str, sid: &str) {
        server
            .mock("GET", format!("{prefix}/api/login?salt").as_str())
            .with_body(r#"{"STATUS":"OK","SALT":"a1b2c3"}"#)
            .create_async()
            .await;
        server
            .mock("GET", format!("{prefix}/api/login?device_info").as_str())
            .with_body(r#"{"STATUS":"OK","device_id":243,"user_info":"R2FyYWdlIG1ldGVy"}"#)
            .create_async()
            .await;
        server
            .mock(
                "GET",
                format!("{prefix}/api/login?login=6e843c345ebe8ff4184f6ad356c767c860fb6540")
                    .as_str(),
            )
            .with_body(format!(r#"{{"STATUS":"OK","SID":"{sid}"}}"#))
            .create_async()
            .await;
    }

    #[test]
    fn test_credential() {
        assert_eq!(
            credential("EM-125", "secret", "a1b2c3"),
            "6e843c345ebe8ff4184f6ad356c767c860fb6540"
        );
        // Unknown models contribute nothing to the hash
        assert_eq!(
            credential("", "secret", "a1b2c3"),
            "6458c7cef00bd6595cea1a5dcee395317eadee13"
        );
    }

    #[test]
    fn test_model_table() {
        assert_eq!(model_name(243), Some("EM-125"));
        assert_eq!(model_name(285), Some("EM-126TS"));
        assert_eq!(model_name(1), None);
    }

    #[test]
    fn test_authenticated_path() {
        let manager = SessionManager::new(client("http://meter"), "secret");
        assert_eq!(manager.authenticated_path("/login?salt"), "/api/login?salt");

        lock(&manager.session).token = Some("sid42".into());
        assert_eq!(
            manager.authenticated_path("/all/get?volt_msr"),
            "/sid42/api/all/get?volt_msr"
        );

        manager.invalidate();
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_login_stores_session() {
        let mut server = mockito::Server::new_async().await;
        mock_handshake(&mut server, "", "sid42").await;

        let manager = SessionManager::new(client(&server.url()), "secret");
        assert!(manager.info().is_none());
        assert!(manager.idle_deadline(Duration::from_secs(30)).is_none());

        let info = assert_ok!(manager.login().await);
        assert_eq!(info.model.as_deref(), Some("EM-125"));
        assert_eq!(info.name, "Garage meter");

        let session = manager.session();
        assert_eq!(session.token.as_deref(), Some("sid42"));
        assert_eq!(session.salt, "a1b2c3");
        assert_eq!(session.device_type, "EM-125");
        assert_eq!(manager.info(), Some(info));
        assert!(manager.idle_deadline(Duration::from_secs(30)).is_some());
    }

    #[tokio::test]
    async fn test_relogin_uses_current_token_and_replaces_it() {
        let mut server = mockito::Server::new_async().await;
        mock_handshake(&mut server, "", "first").await;
        mock_handshake(&mut server, "/first", "second").await;

        let manager = SessionManager::new(client(&server.url()), "secret");
        assert_ok!(manager.login().await);
        assert_eq!(manager.token().as_deref(), Some("first"));

        assert_ok!(manager.login().await);
        assert_eq!(manager.token().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_failed_login_drops_token() {
        let mut server = mockito::Server::new_async().await;
        mock_handshake(&mut server, "", "first").await;
        server
            .mock("GET", "/first/api/login?salt")
            .with_body(r#"{"STATUS":"ERR_SESSION"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/first/api/login?device_info")
            .with_body(r#"{"STATUS":"ERR_SESSION"}"#)
            .create_async()
            .await;

        let manager = SessionManager::new(client(&server.url()), "secret");
        assert_ok!(manager.login().await);

        let result = manager.login().await;
        assert!(matches!(result, Err(Error::Status { .. })));
        assert!(!manager.is_authenticated());
        assert_eq!(manager.authenticated_path("/login?salt"), "/api/login?salt");
    }

    #[tokio::test]
    async fn test_login_rejects_missing_sid() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/login?salt")
            .with_body(r#"{"STATUS":"OK","SALT":"a1b2c3"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/api/login?device_info")
            .with_body(r#"{"STATUS":"OK","device_id":243,"user_info":"R2FyYWdlIG1ldGVy"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/api/login?login=6e843c345ebe8ff4184f6ad356c767c860fb6540")
            .with_body(r#"{"STATUS":"OK"}"#)
            .create_async()
            .await;

        let manager = SessionManager::new(client(&server.url()), "secret");
        assert!(matches!(
            manager.login().await,
            Err(Error::Authentication(_))
        ));
    }
}
