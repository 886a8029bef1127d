//! Best-effort owner notifications.
//!
//! Delivery goes through the [`Notifier`] seam. Callers never see a delivery
//! failure: [`Notifications::send`] logs it and, when a failure channel is
//! attached, forwards it there so tests and operators can observe it.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationEvent {
    TaskCompleted,
    TaskFailed,
    ServerStatusChanged,
    CronJobSucceeded,
    CronJobFailed,
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskCompleted => "TASK_COMPLETED",
            Self::TaskFailed => "TASK_FAILED",
            Self::ServerStatusChanged => "SERVER_STATUS_CHANGED",
            Self::CronJobSucceeded => "CRON_JOB_SUCCEEDED",
            Self::CronJobFailed => "CRON_JOB_FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub user_id: String,
    pub event: NotificationEvent,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Error)]
#[error("notification {event} to {user_id} failed: {reason}")]
pub struct NotifyError {
    pub user_id: String,
    pub event: NotificationEvent,
    pub reason: String,
}

pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send + 'a>>;

/// Delivers one notification to a user.
pub trait Notifier: Send + Sync {
    fn notify<'a>(&'a self, notification: &'a Notification) -> NotifyFuture<'a>;
}

/// Writes notifications to the log and nowhere else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify<'a>(&'a self, n: &'a Notification) -> NotifyFuture<'a> {
        Box::pin(async move {
            info!(user_id = %n.user_id, event = %n.event, payload = %n.payload, "notification");
            Ok(())
        })
    }
}

/// Fire-and-forget wrapper over a [`Notifier`].
#[derive(Clone)]
pub struct Notifications {
    notifier: Arc<dyn Notifier>,
    failures: Option<mpsc::UnboundedSender<NotifyError>>,
}

impl Notifications {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            failures: None,
        }
    }

    pub fn log_only() -> Self {
        Self::new(Arc::new(LogNotifier))
    }

    /// Forward delivery failures to `tx` in addition to logging them.
    pub fn with_failure_channel(mut self, tx: mpsc::UnboundedSender<NotifyError>) -> Self {
        self.failures = Some(tx);
        self
    }

    /// Deliver and swallow any error. A missing owner skips delivery.
    pub async fn send(
        &self,
        user_id: Option<&str>,
        event: NotificationEvent,
        payload: serde_json::Value,
    ) {
        let Some(user_id) = user_id else {
            return;
        };
        let notification = Notification {
            user_id: user_id.to_string(),
            event,
            payload,
        };
        if let Err(e) = self.notifier.notify(&notification).await {
            warn!(%user_id, %event, error = %e, "notification delivery failed");
            if let Some(tx) = &self.failures {
                let _ = tx.send(e);
            }
        }
    }
}

#[cfg(any(test, feature = "mock"))]
pub use recording::RecordingNotifier;

#[cfg(any(test, feature = "mock"))]
mod recording {
    use std::sync::Mutex;

    use super::*;

    /// Keeps every notification in memory; optionally fails each delivery.
    #[derive(Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
        fail_with: Option<String>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing(reason: &str) -> Self {
            Self {
                sent: Mutex::default(),
                fail_with: Some(reason.to_string()),
            }
        }

        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().map(|s| s.clone()).unwrap_or_default()
        }

        pub fn events(&self) -> Vec<NotificationEvent> {
            self.sent().into_iter().map(|n| n.event).collect()
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify<'a>(&'a self, n: &'a Notification) -> NotifyFuture<'a> {
            Box::pin(async move {
                if let Ok(mut sent) = self.sent.lock() {
                    sent.push(n.clone());
                }
                match &self.fail_with {
                    Some(reason) => Err(NotifyError {
                        user_id: n.user_id.clone(),
                        event: n.event,
                        reason: reason.clone(),
                    }),
                    None => Ok(()),
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_to_owner() {
        let rec = Arc::new(RecordingNotifier::new());
        let notes = Notifications::new(rec.clone());
        notes
            .send(Some("user-1"), NotificationEvent::TaskCompleted, json!({"task_id": "t"}))
            .await;
        let sent = rec.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].user_id, "user-1");
        assert_eq!(sent[0].payload["task_id"], "t");
    }

    #[tokio::test]
    async fn missing_owner_skips_delivery() {
        let rec = Arc::new(RecordingNotifier::new());
        Notifications::new(rec.clone())
            .send(None, NotificationEvent::TaskFailed, json!({}))
            .await;
        assert!(rec.sent().is_empty());
    }

    #[tokio::test]
    async fn failures_are_swallowed_and_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notes = Notifications::new(Arc::new(RecordingNotifier::failing("smtp down")))
            .with_failure_channel(tx);

        notes
            .send(Some("user-1"), NotificationEvent::CronJobFailed, json!({}))
            .await;

        let err = rx.try_recv().unwrap();
        assert_eq!(err.event, NotificationEvent::CronJobFailed);
        assert!(err.to_string().contains("smtp down"));
    }
}
