//! NDJSON output on stdout.
//!
//! Logs go to a file, so stdout carries only these events, one JSON object
//! per line:
//!
//! ```json
//! {"event":"started","context_id":"5b0c…","timestamp":1704700001000}
//! {"event":"authenticated","user_id":42,"ping_frequency_secs":30,"timestamp":1704700002000}
//! {"event":"notification","thread_id":7,"message_id":99,"sender_id":3,"sent_at_millis":1704700002500,"timestamp":1704700002510}
//! ```

use chrono::Utc;
use serde::Serialize;
use std::io::{self, Write};
use tracing::error;

use rtmsg_codec::{AuthenticationResult, MessageNotification};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutputEvent {
    Started {
        context_id: String,
        timestamp: i64,
    },

    Authenticated {
        authenticated: bool,
        user_id: i32,
        ping_frequency_secs: i32,
        timestamp: i64,
    },

    Notification {
        thread_id: i64,
        message_id: i64,
        sender_id: i32,
        sent_at_millis: i64,
        timestamp: i64,
    },

    /// The connection ended and will not be retried.
    Closed {
        code: u16,
        reason: String,
        timestamp: i64,
    },

    Stopped {
        timestamp: i64,
    },
}

impl OutputEvent {
    pub fn emit(&self) {
        let json = match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize output event: {}", e);
                return;
            }
        };

        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", json) {
            error!("Failed to write output event: {}", e);
            return;
        }
        if let Err(e) = stdout.flush() {
            error!("Failed to flush stdout: {}", e);
        }
    }

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub fn started(context_id: impl ToString) -> Self {
        Self::Started {
            context_id: context_id.to_string(),
            timestamp: Self::now(),
        }
    }

    pub fn authenticated(result: &AuthenticationResult) -> Self {
        Self::Authenticated {
            authenticated: result.authenticated,
            user_id: result.user_id,
            ping_frequency_secs: result.ping_frequency_secs,
            timestamp: Self::now(),
        }
    }

    pub fn notification(notification: &MessageNotification) -> Self {
        Self::Notification {
            thread_id: notification.thread_id,
            message_id: notification.message_id,
            sender_id: notification.sender_id,
            sent_at_millis: notification.sent_at_millis,
            timestamp: Self::now(),
        }
    }

    pub fn closed(code: u16, reason: &str) -> Self {
        Self::Closed {
            code,
            reason: reason.to_string(),
            timestamp: Self::now(),
        }
    }

    pub fn stopped() -> Self {
        Self::Stopped {
            timestamp: Self::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_serialization() {
        let event = OutputEvent::notification(&MessageNotification {
            thread_id: 7,
            message_id: 99,
            sender_id: 3,
            sent_at_millis: 1_704_700_002_500,
        });
        let json = serde_json::to_string(&event).expect("serialization failed");
        let value: serde_json::Value = serde_json::from_str(&json).expect("invalid JSON");

        assert_eq!(value["event"], "notification");
        assert_eq!(value["thread_id"], 7);
        assert_eq!(value["message_id"], 99);
        assert_eq!(value["sender_id"], 3);
        assert!(value["timestamp"].is_number());
    }

    #[test]
    fn test_authenticated_serialization() {
        let event = OutputEvent::authenticated(&AuthenticationResult {
            authenticated: true,
            ping_frequency_secs: 30,
            user_id: 42,
        });
        let value = serde_json::to_value(&event).expect("serialization failed");

        assert_eq!(value["event"], "authenticated");
        assert_eq!(value["authenticated"], true);
        assert_eq!(value["ping_frequency_secs"], 30);
    }

    #[test]
    fn test_closed_serialization() {
        let value = serde_json::to_value(OutputEvent::closed(1000, "logged out"))
            .expect("serialization failed");

        assert_eq!(value["event"], "closed");
        assert_eq!(value["code"], 1000);
        assert_eq!(value["reason"], "logged out");
    }

    #[test]
    fn test_started_and_stopped_serialization() {
        let started = serde_json::to_value(OutputEvent::started("ctx-1")).unwrap();
        assert_eq!(started["event"], "started");
        assert_eq!(started["context_id"], "ctx-1");

        let stopped = serde_json::to_value(OutputEvent::stopped()).unwrap();
        assert_eq!(stopped["event"], "stopped");
    }
}
