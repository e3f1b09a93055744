/// Abstraction over optional host capabilities: notification display,
/// page-focus query and clipboard access. All of these are enhancements
/// whose absence must degrade gracefully, so every method has a safe
/// default.
pub trait Platform: Send + Sync + 'static {
    /// Show a notification for a new message. May do nothing when the
    /// permission is missing or the capability is unavailable.
    fn notify(&self, _room_name: &str, _author: &str, _body: &str) {}

    /// Whether the hosting page currently has input focus. Implementations
    /// without a focus concept report `true`, which suppresses unread
    /// counting for the selected room.
    fn has_focus(&self) -> bool {
        true
    }

    /// Copy text to the clipboard. Returns `false` when unavailable so the
    /// caller can fall back to a manual copy prompt.
    fn clipboard_write(&self, _text: &str) -> bool {
        false
    }
}

/// A no-op platform used standalone and in tests.
#[derive(Clone, Default)]
pub struct NullPlatform;

impl Platform for NullPlatform {}
