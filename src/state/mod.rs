//! Replica state machine
//!
//! Composite state of the local and peer replica (role, connection,
//! disk freshness plus pause flags) and the rules governing every
//! transition: sanitize derives implicit consequences, two validators
//! judge the candidate, and committed transitions hand back deferred
//! side effects as plain values.

mod errors;
mod machine;
mod sanitize;
mod types;
mod validate;

pub use errors::{RejectionReason, StateResult, STATE_CHANGE_OK};
pub use machine::{SideEffect, StateMachine, Transition};
pub use sanitize::{sanitize, Sanitized};
pub use types::{ConnectionState, DiskState, ReplicaState, Role, StateChange};
pub use validate::{is_valid_state, is_valid_transition, Policy};
