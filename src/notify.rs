use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationPermission {
    /// Not yet asked.
    Default,
    Granted,
    Denied,
}

/// OS-level notifications. Best effort: nothing here may fail the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn permission(&self) -> NotificationPermission;

    async fn request_permission(&self) -> NotificationPermission;

    async fn show(&self, title: &str, body: &str);
}

/// Desktop notifications through an external command such as `notify-send`.
///
/// Permission is granted when `{command} --version` runs and exits successfully.
pub struct CommandNotifier {
    command: String,
    permission: Mutex<NotificationPermission>,
}

impl CommandNotifier {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            permission: Mutex::new(NotificationPermission::Default),
        }
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    fn permission(&self) -> NotificationPermission {
        *self.permission.lock()
    }

    async fn request_permission(&self) -> NotificationPermission {
        let probe = Command::new(&self.command).arg("--version").output().await;
        let decided = match probe {
            Ok(output) if output.status.success() => NotificationPermission::Granted,
            Ok(output) => {
                warn!("Desktop notifications unavailable ({} exited with {})", self.command, output.status);
                NotificationPermission::Denied
            }
            Err(e) => {
                warn!("Desktop notifications unavailable ({}): {}", self.command, e);
                NotificationPermission::Denied
            }
        };
        info!("🔔 Notification permission: {:?}", decided);
        *self.permission.lock() = decided;
        decided
    }

    async fn show(&self, title: &str, body: &str) {
        if self.permission() != NotificationPermission::Granted {
            return;
        }
        match Command::new(&self.command).arg(title).arg(body).status().await {
            Ok(status) if status.success() => debug!("Notification shown: {}", body),
            Ok(status) => warn!("{} exited with {}", self.command, status),
            Err(e) => warn!("Failed to show notification: {}", e),
        }
    }
}

/// Notifier that never shows anything; permission is always denied.
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    fn permission(&self) -> NotificationPermission {
        NotificationPermission::Denied
    }

    async fn request_permission(&self) -> NotificationPermission {
        NotificationPermission::Denied
    }

    async fn show(&self, _title: &str, _body: &str) {}
}
