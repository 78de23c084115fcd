//! Bridge Module
//!
//! Runs tracker sessions: each one connects a puck, registers it with the
//! tracker server and streams its telemetry until stopped.
//!
//! ## Modules
//!
//! - [`session`] - Connect protocol, retries, keep-alive and teardown of one tracker
//! - [`supervisor`] - Tracker registry and the threads sessions run on

pub mod session;
pub mod supervisor;

pub use session::{SessionConfig, SessionError, TrackerSession};
pub use supervisor::SessionSupervisor;
