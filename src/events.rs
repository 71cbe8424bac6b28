use std::sync::Arc;

use serde_derive::Deserialize;

use crate::decoder::Report;
use crate::error::Error;
use crate::session::DeviceInfo;
use crate::state_store::Snapshot;

/// Notifications published by the engine for the outside bridge.
#[derive(Debug, Clone)]
pub enum Event {
    /// Login outcome changed. `info` is set while online.
    Connection {
        online: bool,
        info: Option<DeviceInfo>,
    },
    /// Full "status" store contents after a change.
    Status(Snapshot),
    /// Full "state" store contents after a change.
    State(Snapshot),
    /// One newly seen historical log record.
    Report(Report),
    Error(Arc<Error>),
}

impl Event {
    /// Short tag used when logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Connection { .. } => "connection",
            Event::Status(_) => "status",
            Event::State(_) => "state",
            Event::Report(_) => "report",
            Event::Error(_) => "error",
        }
    }
}

/// Inbound requests from the bridge, as JSON.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Command {
    /// `{"state": true}` switches the relay on.
    Set { state: bool },
}

/// Source of wall-clock time for report scheduling.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_command() {
        let command: Command = serde_json::from_str(r#"{"state": true}"#).unwrap();
        assert_eq!(command, Command::Set { state: true });

        let command: Command = serde_json::from_str(r#"{"state": false}"#).unwrap();
        assert_eq!(command, Command::Set { state: false });

        assert!(serde_json::from_str::<Command>(r#"{"state": "on"}"#).is_err());
        assert!(serde_json::from_str::<Command>(r#"{}"#).is_err());
    }

    #[test]
    fn test_event_kind() {
        let event = Event::Connection {
            online: false,
            info: None,
        };
        assert_eq!(event.kind(), "connection");
        assert_eq!(Event::Error(Arc::new(Error::QueueClosed)).kind(), "error");
    }

    #[test]
    fn test_system_clock_is_epoch_millis() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
