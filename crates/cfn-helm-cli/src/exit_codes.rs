//! Exit codes of the handler binary
//!
//! A handler that ran reports its outcome in the progress event and exits
//! with `SUCCESS`, even when the event is a failure.

/// The handler ran and printed its result
pub const SUCCESS: i32 = 0;

/// The request on stdin could not be read or parsed
pub const INPUT_ERROR: i32 = 2;

/// Settings could not be loaded
pub const CONFIG_ERROR: i32 = 3;

/// The connector action failed; the error payload is on stdout
pub const REMOTE_ERROR: i32 = 4;

/// IO error - stdin or stdout unavailable
pub const IO_ERROR: i32 = 5;
