use std::io::Write;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

#[cfg(feature = "native")]
use notify_rust::{Notification, Timeout};
use tracing::{debug, error};

use exchange_core::config::UiConfig;
use exchange_core::event::{ChatMessage, Event, Handler, handler};
use exchange_core::session::UserId;

const ALERT_TITLE: &str = "New message";
const ALERT_DURATION: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("notification dispatch failed: {0}")]
    DispatchFailed(String),

    #[error("notification permission denied")]
    PermissionDenied,

    #[error("sound cue failed: {0}")]
    SoundFailed(String),
}

/// Where activating an alert leads: the chat thread with the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatTarget {
    pub partner: UserId,
}

impl ChatTarget {
    pub fn route(&self) -> String {
        format!("/chat/{}", self.partner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub title: String,
    pub body: String,
    pub duration: Duration,
    pub target: ChatTarget,
}

impl Alert {
    pub fn for_message(message: &ChatMessage, preview_chars: usize) -> Self {
        Self {
            title: ALERT_TITLE.to_string(),
            body: alert_body(&message.sender_nickname, &message.content, preview_chars),
            duration: ALERT_DURATION,
            target: ChatTarget {
                partner: message.sender_id,
            },
        }
    }

    /// Display time in milliseconds, saturating at `u32::MAX`.
    pub fn duration_ms(&self) -> u32 {
        u32::try_from(self.duration.as_millis()).unwrap_or(u32::MAX)
    }
}

/// `"<nickname>: <content>"`, content cut to `limit` characters with a
/// trailing `...` when it was longer.
pub fn alert_body(nickname: &str, content: &str, limit: usize) -> String {
    let mut chars = content.chars();
    let preview: String = chars.by_ref().take(limit).collect();
    if chars.next().is_some() {
        format!("{nickname}: {preview}...")
    } else {
        format!("{nickname}: {preview}")
    }
}

pub trait AlertSink: Send + Sync {
    fn show(&self, alert: &Alert) -> Result<(), NotificationError>;
}

pub trait SoundCue: Send + Sync {
    fn play(&self) -> Result<(), NotificationError>;
}

pub trait Navigator: Send + Sync {
    fn open_chat(&self, partner: UserId);
}

/// Rings the terminal bell on stderr.
#[derive(Debug, Default)]
pub struct TerminalBell;

impl SoundCue for TerminalBell {
    fn play(&self) -> Result<(), NotificationError> {
        let mut stderr = std::io::stderr();
        stderr
            .write_all(b"\x07")
            .and_then(|()| stderr.flush())
            .map_err(|e| NotificationError::SoundFailed(e.to_string()))
    }
}

#[derive(Debug, Default)]
pub struct SilentCue;

impl SoundCue for SilentCue {
    fn play(&self) -> Result<(), NotificationError> {
        Ok(())
    }
}

/// Desktop notifications. On freedesktop platforms clicking the alert opens
/// the sender's chat through the navigator.
#[cfg(feature = "native")]
pub struct DesktopAlertSink {
    navigator: Arc<dyn Navigator>,
}

#[cfg(feature = "native")]
impl DesktopAlertSink {
    pub fn new(navigator: Arc<dyn Navigator>) -> Self {
        Self { navigator }
    }
}

#[cfg(feature = "native")]
impl AlertSink for DesktopAlertSink {
    fn show(&self, alert: &Alert) -> Result<(), NotificationError> {
        let mut notification = Notification::new();
        notification
            .summary(&alert.title)
            .body(&alert.body)
            .timeout(Timeout::Milliseconds(alert.duration_ms()));

        #[cfg(all(unix, not(target_os = "macos")))]
        {
            notification.action("default", "Open");
            let navigator = Arc::clone(&self.navigator);
            let partner = alert.target.partner;
            let (shown_tx, shown_rx) = std::sync::mpsc::channel();

            // The handle blocks until the alert is clicked or expires, so it
            // lives on its own thread.
            std::thread::spawn(move || match notification.show() {
                Ok(handle) => {
                    let _ = shown_tx.send(Ok(()));
                    handle.wait_for_action(|action| {
                        if action == "default" {
                            navigator.open_chat(partner);
                        }
                    });
                }
                Err(error) => {
                    let _ = shown_tx.send(Err(error.to_string()));
                }
            });

            shown_rx
                .recv()
                .map_err(|_| NotificationError::DispatchFailed("alert thread exited".into()))?
                .map_err(NotificationError::DispatchFailed)
        }

        #[cfg(not(all(unix, not(target_os = "macos"))))]
        {
            let _ = &self.navigator;
            notification
                .show()
                .map(|_| ())
                .map_err(|error| NotificationError::DispatchFailed(error.to_string()))
        }
    }
}

/// Plays the cue and raises an alert for every incoming chat message.
/// Depends only on the event, never on connection state.
pub struct NotificationDispatcher {
    notifications_enabled: AtomicBool,
    sound_enabled: AtomicBool,
    preview_chars: usize,
    sink: Arc<dyn AlertSink>,
    sound: Arc<dyn SoundCue>,
    navigator: Arc<dyn Navigator>,
}

impl NotificationDispatcher {
    #[cfg(feature = "native")]
    pub fn new(config: &UiConfig, navigator: Arc<dyn Navigator>) -> Self {
        Self::with_backends(
            config,
            Arc::new(DesktopAlertSink::new(Arc::clone(&navigator))),
            Arc::new(TerminalBell),
            navigator,
        )
    }

    pub fn with_backends(
        config: &UiConfig,
        sink: Arc<dyn AlertSink>,
        sound: Arc<dyn SoundCue>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        Self {
            notifications_enabled: AtomicBool::new(config.notifications),
            sound_enabled: AtomicBool::new(config.sound),
            preview_chars: config.preview_chars,
            sink,
            sound,
            navigator,
        }
    }

    pub fn set_notifications_enabled(&self, enabled: bool) {
        self.notifications_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_sound_enabled(&self, enabled: bool) {
        self.sound_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn handle_event(&self, event: &Event) {
        if let Some(message) = event.chat_message() {
            self.notify(message);
        }
    }

    pub fn handler(self: &Arc<Self>) -> Handler {
        let dispatcher = Arc::clone(self);
        handler(move |event| {
            dispatcher.handle_event(event);
            Ok(())
        })
    }

    fn notify(&self, message: &ChatMessage) {
        if self.sound_enabled.load(Ordering::Relaxed)
            && let Err(error) = self.sound.play()
        {
            debug!(error = %error, "sound cue unavailable");
        }

        if !self.notifications_enabled.load(Ordering::Relaxed) {
            return;
        }
        let alert = Alert::for_message(message, self.preview_chars);
        if let Err(error) = self.sink.show(&alert) {
            error!(error = %error, "failed to dispatch notification");
        }
    }

    /// Follows an alert's click target.
    pub fn activate(&self, alert: &Alert) {
        debug!(route = %alert.target.route(), "alert activated");
        self.navigator.open_chat(alert.target.partner);
    }
}
