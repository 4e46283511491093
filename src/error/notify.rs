use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

use super::Severity;

/// A user-visible notice emitted by the error core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserNotice {
    pub error_type: String,
    pub message: String,
    pub severity: Severity,
    pub duration: Duration,
}

/// Host seam for surfacing notices (toasts, status bar, ...).
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &UserNotice);
}

/// Default notifier: writes notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: &UserNotice) {
        match notice.severity {
            Severity::Fatal | Severity::Error => {
                error!(error_type = %notice.error_type, "🔔 {}", notice.message)
            }
            Severity::Warn => warn!(error_type = %notice.error_type, "🔔 {}", notice.message),
            _ => info!(error_type = %notice.error_type, "🔔 {}", notice.message),
        }
    }
}

/// Pushes notices into a channel the host UI drains at its own pace.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: flume::Sender<UserNotice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, flume::Receiver<UserNotice>) {
        let (sender, receiver) = flume::unbounded();
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notice: &UserNotice) {
        if self.sender.send(notice.clone()).is_err() {
            warn!("Notice receiver dropped, discarding: {}", notice.message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_notifier_delivers() {
        let (notifier, rx) = ChannelNotifier::new();
        notifier.notify(&UserNotice {
            error_type: "AUTH_ERROR".into(),
            message: "Authentication failed".into(),
            severity: Severity::Error,
            duration: Duration::from_secs(5),
        });
        let notice = rx.try_recv().unwrap();
        assert_eq!(notice.error_type, "AUTH_ERROR");
    }
}
