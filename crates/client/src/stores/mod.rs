//! Stores for live session state.

pub mod presence;
pub mod session;

pub use presence::PresenceStore;
pub use session::{SessionState, SessionStore, Student, UNKNOWN_STUDENT_NAME};
