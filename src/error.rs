//! Error kinds surfaced by the core (spec §7).
//!
//! `GxError` covers fatal, init-time failures. `ServletError` is the
//! numeric error family a servlet body sees out of `Network::call` —
//! it is distinct from `CallCancelled`, which unwinds a coroutine without
//! being logged as a failure.

use std::fmt;

/// Fatal errors that abort startup (page-allocator exhaustion, reactor
/// creation failure, invalid configuration).
#[derive(Debug, thiserror::Error)]
pub enum GxError {
    #[error("page allocator exhausted")]
    OutOfMemory,

    #[error("reactor creation failed: {0}")]
    ReactorInit(#[source] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing own node type in configuration")]
    UnknownNodeType,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Reserved numeric error codes (spec §7 table). Values below
/// [`SYSTEM_THRESHOLD`] are returned as-is to servlet code; values at or
/// above it are re-raised as exceptions (here: as [`ServletError`]).
pub const SYSTEM_THRESHOLD: i32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServletError {
    Fail,
    Dup,
    Exists,
    NotExists,
    Ready,
    NotReady,
    Less,
    More,
    Param,
    Again,
    Timeout,
    Closed,
    Close,
    Busy,
    /// A response rc at or above [`SYSTEM_THRESHOLD`] that doesn't map to
    /// one of the named kinds above; carries the raw code through.
    Other(i32),
}

impl ServletError {
    pub const fn rc(self) -> i32 {
        match self {
            ServletError::Fail => SYSTEM_THRESHOLD,
            ServletError::Dup => SYSTEM_THRESHOLD + 1,
            ServletError::Exists => SYSTEM_THRESHOLD + 2,
            ServletError::NotExists => SYSTEM_THRESHOLD + 3,
            ServletError::Ready => SYSTEM_THRESHOLD + 4,
            ServletError::NotReady => SYSTEM_THRESHOLD + 5,
            ServletError::Less => SYSTEM_THRESHOLD + 6,
            ServletError::More => SYSTEM_THRESHOLD + 7,
            ServletError::Param => SYSTEM_THRESHOLD + 8,
            ServletError::Again => SYSTEM_THRESHOLD + 9,
            ServletError::Timeout => SYSTEM_THRESHOLD + 10,
            ServletError::Closed => SYSTEM_THRESHOLD + 11,
            ServletError::Close => SYSTEM_THRESHOLD + 12,
            ServletError::Busy => SYSTEM_THRESHOLD + 13,
            ServletError::Other(rc) => rc,
        }
    }

    /// Map a response rc back into a named kind, falling back to `Other`.
    pub fn from_rc(rc: i32) -> Self {
        match rc - SYSTEM_THRESHOLD {
            0 => ServletError::Fail,
            1 => ServletError::Dup,
            2 => ServletError::Exists,
            3 => ServletError::NotExists,
            4 => ServletError::Ready,
            5 => ServletError::NotReady,
            6 => ServletError::Less,
            7 => ServletError::More,
            8 => ServletError::Param,
            9 => ServletError::Again,
            10 => ServletError::Timeout,
            11 => ServletError::Closed,
            12 => ServletError::Close,
            13 => ServletError::Busy,
            _ => ServletError::Other(rc),
        }
    }
}

impl fmt::Display for ServletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServletError::Fail => "FAIL",
            ServletError::Dup => "DUP",
            ServletError::Exists => "EXISTS",
            ServletError::NotExists => "NOTEXISTS",
            ServletError::Ready => "READY",
            ServletError::NotReady => "NOTREADY",
            ServletError::Less => "LESS",
            ServletError::More => "MORE",
            ServletError::Param => "PARAM",
            ServletError::Again => "AGAIN",
            ServletError::Timeout => "TIMEOUT",
            ServletError::Closed => "CLOSED",
            ServletError::Close => "CLOSE",
            ServletError::Busy => "BUSY",
            ServletError::Other(rc) => return write!(f, "ERROR({rc})"),
        };
        f.write_str(name)
    }
}

impl std::error::Error for ServletError {}

/// Cancellation unwinds a coroutine without being a [`ServletError`] — it
/// is never logged as a call failure (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallCancelled;

impl fmt::Display for CallCancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("call cancelled")
    }
}

impl std::error::Error for CallCancelled {}

/// The result of a `Network::call`: either the deserialized response, a
/// servlet-level error code, or a cancellation.
#[derive(Debug)]
pub enum CallError {
    Servlet(ServletError),
    Cancelled,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Servlet(e) => write!(f, "{e}"),
            CallError::Cancelled => write!(f, "{CallCancelled}"),
        }
    }
}

impl std::error::Error for CallError {}

impl From<ServletError> for CallError {
    fn from(e: ServletError) -> Self {
        CallError::Servlet(e)
    }
}

impl From<CallCancelled> for CallError {
    fn from(_: CallCancelled) -> Self {
        CallError::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rc_roundtrips_named_kinds() {
        for kind in [
            ServletError::Fail,
            ServletError::Busy,
            ServletError::Timeout,
            ServletError::Closed,
        ] {
            assert_eq!(ServletError::from_rc(kind.rc()), kind);
        }
    }

    #[test]
    fn unrecognized_rc_falls_back_to_other() {
        let rc = SYSTEM_THRESHOLD + 999;
        assert_eq!(ServletError::from_rc(rc), ServletError::Other(rc));
    }

    #[test]
    fn rc_below_threshold_maps_to_other_with_negative_offset() {
        // from_rc is only meaningful at/above SYSTEM_THRESHOLD; rc values
        // below it are returned to callers as plain integers by Network::call
        // and never reach this mapping in practice.
        assert_eq!(ServletError::from_rc(0), ServletError::Other(0));
    }
}
