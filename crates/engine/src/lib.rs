//! Session engine: request correlation, the copy-trading state machine and the
//! task that drives it.

pub mod correlator;
pub mod driver;
pub mod notifier;
pub mod session;
pub mod ticker;

pub use correlator::{Correlator, PendingRequest, Resolution};
pub use driver::{SessionDriver, SessionHandle};
pub use notifier::StatusNotifier;
pub use session::{CommandOutcome, Session, SessionConfig, SessionError};
pub use ticker::CopyTicker;
