//! Domain model module declarations.

pub mod message;
pub mod session;
pub mod workspace;

pub use message::Message;
pub use session::{Liveness, SessionRecord};
pub use workspace::{Workspace, PR_ENV, REPO_ENV};
