//! doze-core - shared library for the doze suspend orchestration layer.
//!
//! This crate provides the client surface and the filesystem-protocol
//! primitives used by the doze daemons and by third-party processes that
//! want to participate in suspend orchestration:
//!
//! - [`inhibit`]: the shared/exclusive advisory-lock protocol that lets any
//!   process veto suspend, plus the coordinator-side gate and the abort
//!   counter
//! - [`generation`]: the coordinator half of the double-buffered
//!   suspend/resume broadcast
//! - [`watch`]: the watcher half - an async event stream of
//!   suspend-imminent / resumed notifications with explicit acknowledgment
//! - [`request`]: the requester protocol (create a marker, wait for its
//!   deletion, distinguish "suspended" from "blocked")
//! - [`veto`]: client side of the fd-readiness veto service
//! - [`alarm`]: client side of the wake-alarm service
//! - [`fdpass`]: SCM_RIGHTS helpers shared by the veto client and service
//! - [`notify`]: directory-change notification feeding the event loops
//! - [`config`]: run-directory layout and control-file paths
//!
//! All cross-process coordination happens through the filesystem (advisory
//! locks, renames, directory notification) and Unix-domain sockets. No
//! kernel suspend/inhibit API is assumed.

pub mod alarm;
pub mod config;
pub mod fdpass;
pub mod generation;
pub mod inhibit;
pub mod notify;
pub mod request;
pub mod veto;
pub mod watch;

pub use config::ControlPaths;
pub use generation::GenerationStore;
pub use inhibit::{AbortSeq, InhibitGate, Inhibitor};
pub use request::{request_suspend, ImmediateRequest, SuspendOutcome};
pub use watch::{SuspendEvent, SuspendWatcher};
