use thiserror::Error;

/// Failure classes surfaced by the synchronizer. None of these are fatal:
/// every operation leaves the local state recoverable.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Rejected locally before any network call (empty name, malformed link).
    #[error("{0}")]
    Validation(String),
    /// The operation needs a signed-in user; callers should prompt for login
    /// instead of showing an error.
    #[error("sign in required")]
    AuthRequired,
    /// The collaborator API rejected the request. `message` is the
    /// server-provided detail when present.
    #[error("{message}")]
    Api { status: u16, message: String },
    /// The live transport is not open for the selected room. The caller
    /// keeps its draft; a reconnect may already be scheduled.
    #[error("not connected")]
    NotConnected,
    /// Invite token could not be resolved, for any reason.
    #[error("invalid or expired invite")]
    InvalidInvite,
    /// Attachment upload failed; no message was created.
    #[error("upload failed: {0}")]
    UploadFailed(String),
    /// Network-level failure reaching the collaborator API.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ChatError {
    /// Whether this failure should be presented as a login prompt.
    pub fn needs_login(&self) -> bool {
        matches!(self, ChatError::AuthRequired)
            || matches!(self, ChatError::Api { status: 401, .. })
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
