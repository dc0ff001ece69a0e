//! Wire-level SMTP vocabulary for FaultMTA: command parsing, session
//! states, reply codes and the client-driven synthetic-error grammar.
//!
//! Nothing in this crate performs I/O; the session engine in `faultmtad`
//! drives it.

pub mod address;
pub mod command;
pub mod reply;
pub mod state;
pub mod synthetic;

pub use command::{Command, ParseError};
pub use reply::{canonical_message, EnhancedStatusCode, SyntheticReply};
pub use state::SessionState;
pub use synthetic::{DeferredVerb, PendingReplies};
