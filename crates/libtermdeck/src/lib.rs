pub mod error;
pub mod link;
pub mod output;
pub mod session;

pub use error::DaemonError;
pub use link::{ControlLink, EnqueueError, enqueue_event};
pub use output::{OutputBuffer, Utf8Decoder};
pub use session::{CreateOutcome, SessionManager, SessionManagerConfig};
