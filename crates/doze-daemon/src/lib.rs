//! doze-daemon - the daemons of the doze suspend orchestration layer.
//!
//! Three services share one binary (`dozed`), each running as its own
//! single-threaded process:
//!
//! - [`coordinator`]: the suspend decision loop. Waits for a request
//!   marker, consults the inhibitor lock, broadcasts "suspend imminent"
//!   through the watch-generation store, validates that nothing raced the
//!   attempt, and performs the transition.
//! - [`events`]: the fd-readiness veto service. Clients hand it
//!   descriptors; just before suspend it polls them and defers the
//!   coordinator until every owner of a readable descriptor has drained it.
//! - [`alarm`]: the wake-alarm service. Clients register wake deadlines;
//!   the earliest one is kept programmed into the wake hardware, and
//!   suspend is blocked during the final seconds before a deadline.
//!
//! The veto and alarm services participate in suspend as ordinary watchers
//! and inhibitors through `doze-core`; the coordinator grants them nothing
//! the client library does not grant everyone.

pub mod alarm;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod power;
pub mod socket;
