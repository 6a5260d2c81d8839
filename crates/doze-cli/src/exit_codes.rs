//! Exit codes of the doze CLI.
//!
//! `request` distinguishes a completed suspend from a vetoed one; scripts
//! branch on the code the way the original requester tools did.

/// The operation succeeded; for `request`, the machine suspended.
pub const SUCCESS: u8 = 0;

/// An inhibitor vetoed the suspend request.
pub const BLOCKED: u8 = 1;

/// Setup or I/O failure.
pub const GENERIC_ERROR: u8 = 2;
