//! Session Record Boundary
//!
//! The engine reports login, logout and failed-attempt events to a sink at
//! this boundary; writing actual login records (utmp/wtmp or otherwise) is
//! the embedding system's business.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

/// One reportable session event
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Unique id for correlating login and logout of the same session
    pub id: Uuid,
    /// Authentication service that produced the event
    pub service_name: String,
    /// User the event concerns, when known
    pub username: Option<String>,
    /// Display the session belongs to
    pub display_name: Option<String>,
    /// Host of the display, empty for local displays
    pub display_hostname: Option<String>,
    /// Console device of the display
    pub display_device: Option<String>,
    /// Pid of the session process, for login/logout events
    pub session_pid: Option<i32>,
    /// When the event happened
    pub timestamp: DateTime<Utc>,
}

impl SessionRecord {
    /// New record stamped with the current time
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_name: service_name.into(),
            username: None,
            display_name: None,
            display_hostname: None,
            display_device: None,
            session_pid: None,
            timestamp: Utc::now(),
        }
    }
}

/// Consumer of session record events.
#[async_trait]
pub trait SessionRecordSink: Send + Sync {
    /// A conversation became the running session
    async fn login(&self, record: &SessionRecord);

    /// The running session ended
    async fn logout(&self, record: &SessionRecord);

    /// Verification failed before any session existed
    async fn failed_attempt(&self, record: &SessionRecord);
}

/// Default sink that reports records through the tracing subscriber.
pub struct LogRecordSink;

#[async_trait]
impl SessionRecordSink for LogRecordSink {
    async fn login(&self, record: &SessionRecord) {
        info!(
            "Session login: service={} user={:?} display={:?} pid={:?}",
            record.service_name, record.username, record.display_name, record.session_pid
        );
    }

    async fn logout(&self, record: &SessionRecord) {
        info!(
            "Session logout: service={} user={:?} display={:?} pid={:?}",
            record.service_name, record.username, record.display_name, record.session_pid
        );
    }

    async fn failed_attempt(&self, record: &SessionRecord) {
        warn!(
            "Failed login attempt: service={} user={:?} display={:?}",
            record.service_name, record.username, record.display_name
        );
    }
}

/// Sink that swallows every record; for tests and record-less deployments.
pub struct NullRecordSink;

#[async_trait]
impl SessionRecordSink for NullRecordSink {
    async fn login(&self, _record: &SessionRecord) {}

    async fn logout(&self, _record: &SessionRecord) {}

    async fn failed_attempt(&self, _record: &SessionRecord) {}
}
