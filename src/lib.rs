//! Client-side session and room synchronizer for the OpenChat API.
//!
//! The crate mirrors the collaborator server's state into a local snapshot:
//! it restores or starts a session, keeps the public room directories and
//! the joined-room list fresh, runs the selected room's join/history/connect
//! pipeline, and maintains per-room unread counters and notifications.
//! [`sync::ChatSync`] is the entry point; everything else supports it.

pub mod api;
pub mod config;
pub mod error;
pub mod invite;
pub mod model;
pub mod platform;
mod poll;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use error::{ChatError, Result};
pub use model::{Message, MessageKind, Role, Room, User};
pub use platform::{NullPlatform, Platform};
pub use sync::{ChatSync, RoomPhase, SyncEvent};
