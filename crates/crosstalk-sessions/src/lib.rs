//! Durable session metadata and transcript addressing.
//!
//! The store is the single authority for mapping a session key to the
//! agent-side `session_id`; transcripts are addressed only through that id.

pub mod error;
pub mod store;
pub mod transcript;
pub mod types;

pub use error::SessionError;
pub use store::SessionStore;
pub use transcript::{ArchiveReason, TranscriptPaths};
pub use types::{KeyScope, Session, SessionKey, ThreadMarker};
