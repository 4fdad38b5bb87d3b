//! Error taxonomy: engine return codes and the caller-visible errors they translate into.

use std::fmt;
use std::path::PathBuf;

use crate::lifecycle::SapState;

/// Negative sentinels reported by engine calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ReturnCode {
    /// Transactional store could not allocate.
    Store = -1,
    /// Message object (ZCO) could not be created.
    MessageObject = -2,
    Io = -3,
    Interrupted = -4,
    ConnectionAborted = -5,
    Malloc = -6,
}

impl ReturnCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        Some(match code {
            -1 => ReturnCode::Store,
            -2 => ReturnCode::MessageObject,
            -3 => ReturnCode::Io,
            -4 => ReturnCode::Interrupted,
            -5 => ReturnCode::ConnectionAborted,
            -6 => ReturnCode::Malloc,
            _ => return None,
        })
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

// Codes for binding-level failures that never come out of the engine.
pub const NOT_IMPLEMENTED: i32 = -7;
pub const SESSION_CANCELLED: i32 = -8;
pub const INVALID_STATE: i32 = -9;
pub const NOT_DETAINED: i32 = -10;
pub const INVALID_ARGUMENT: i32 = -11;
pub const STALE_HANDLE: i32 = -12;
pub const WORKER_FAILED: i32 = -13;

/// Result of a raw engine call.
pub type EngineResult<T> = std::result::Result<T, ReturnCode>;

pub type Result<T> = std::result::Result<T, Error>;

/// Protocol family of an access point or engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Bundle,
    Ltp,
    Cfdp,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Family::Bundle => "BP",
            Family::Ltp => "LTP",
            Family::Cfdp => "CFDP",
        })
    }
}

/// Side of an LTP session that was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDirection {
    Import,
    Export,
}

impl fmt::Display for SessionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionDirection::Import => "import",
            SessionDirection::Export => "export",
        })
    }
}

/// Inbound data the core refuses to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsupported {
    /// Green (partially reliable) segment.
    GreenSegment,
    /// Red part of a block that continues with green data.
    PartialRedBlock,
}

impl fmt::Display for Unsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Unsupported::GreenSegment => "an LTP block cannot have green parts",
            Unsupported::PartialRedBlock => "only fully red LTP blocks are supported",
        })
    }
}

/// Engine step that produced a return code. Together with the code it picks the error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Insert,
    CreateObject,
    Transmit,
    Memo,
    Receive,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot attach to {family} engine (code {code}); is the engine running on this host?")]
    Attach { family: Family, code: ReturnCode },
    #[error("cannot open {family} access point '{endpoint}' (code {code}); is it configured and not already in use?")]
    Open {
        family: Family,
        endpoint: String,
        code: ReturnCode,
    },
    #[error("cannot start admission control for '{endpoint}' (code {code})")]
    AdmissionGate { endpoint: String, code: ReturnCode },
    #[error("store allocation failed for '{endpoint}' (code {code})")]
    StoreAllocation { endpoint: String, code: ReturnCode },
    #[error("message object creation failed for '{endpoint}' (code {code})")]
    MessageCreation { endpoint: String, code: ReturnCode },
    #[error("transmission from '{endpoint}' failed (code {code})")]
    Transmission { endpoint: String, code: ReturnCode },
    #[error("cannot schedule custodial retransmission for '{endpoint}' (code {code})")]
    RetransmissionSchedule { endpoint: String, code: ReturnCode },
    #[error("reception on '{endpoint}' failed (code {code})")]
    Reception { endpoint: String, code: ReturnCode },
    #[error("reception on '{endpoint}' interrupted")]
    Interrupted { endpoint: String },
    #[error("connection on '{endpoint}' aborted")]
    ConnectionAborted { endpoint: String },
    #[error("{direction} session on '{endpoint}' cancelled (reason code {reason})")]
    SessionCancelled {
        endpoint: String,
        direction: SessionDirection,
        reason: u8,
    },
    #[error("'{endpoint}': {what}")]
    NotImplemented { endpoint: String, what: Unsupported },
    #[error("out of memory on '{endpoint}'")]
    OutOfMemory { endpoint: String },
    #[error("'{endpoint}' is {state}; receive needs an idle access point")]
    InvalidState { endpoint: String, state: SapState },
    #[error("'{endpoint}' is closed")]
    Closed { endpoint: String },
    #[error("'{endpoint}' is not detained; custodial retransmission needs a detained endpoint")]
    NotDetained { endpoint: String },
    #[error("no active transaction on CFDP entity {entity}")]
    NoTransaction { entity: u64 },
    #[error("no LTP span to engine {engine}")]
    NoSpan { engine: u64 },
    #[error("{family} engine rejected the request (code {code})")]
    Engine { family: Family, code: ReturnCode },
    #[error("invalid endpoint id '{0}'")]
    InvalidEndpoint(String),
    #[error("cannot parse timestamp '{0}'")]
    InvalidTimestamp(String),
    #[error("this node is not part of region {0}")]
    InvalidRegion(u32),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("worker failed: {0}")]
    Worker(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Translate an engine return code from `step` into the error the caller sees.
    pub(crate) fn from_engine(step: Step, code: ReturnCode, endpoint: &str) -> Self {
        let endpoint = endpoint.to_string();
        match code {
            ReturnCode::Interrupted => Error::Interrupted { endpoint },
            ReturnCode::ConnectionAborted => Error::ConnectionAborted { endpoint },
            ReturnCode::Malloc => Error::OutOfMemory { endpoint },
            ReturnCode::Store => Error::StoreAllocation { endpoint, code },
            ReturnCode::MessageObject => Error::MessageCreation { endpoint, code },
            ReturnCode::Io => match step {
                Step::Insert => Error::StoreAllocation { endpoint, code },
                Step::CreateObject => Error::MessageCreation { endpoint, code },
                Step::Transmit => Error::Transmission { endpoint, code },
                Step::Memo => Error::RetransmissionSchedule { endpoint, code },
                Step::Receive => Error::Reception { endpoint, code },
            },
        }
    }

    /// True for transient conditions (resource exhaustion, interruption) worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::StoreAllocation { .. }
                | Error::MessageCreation { .. }
                | Error::OutOfMemory { .. }
                | Error::Interrupted { .. }
        )
    }

    /// Numeric sentinel for C callers.
    pub fn code(&self) -> i32 {
        match self {
            Error::Attach { code, .. }
            | Error::Open { code, .. }
            | Error::AdmissionGate { code, .. }
            | Error::StoreAllocation { code, .. }
            | Error::MessageCreation { code, .. }
            | Error::Transmission { code, .. }
            | Error::RetransmissionSchedule { code, .. }
            | Error::Reception { code, .. }
            | Error::Engine { code, .. } => code.as_i32(),
            Error::Interrupted { .. } => ReturnCode::Interrupted.as_i32(),
            Error::ConnectionAborted { .. } => ReturnCode::ConnectionAborted.as_i32(),
            Error::OutOfMemory { .. } => ReturnCode::Malloc.as_i32(),
            Error::Io(_) => ReturnCode::Io.as_i32(),
            Error::NotImplemented { .. } => NOT_IMPLEMENTED,
            Error::SessionCancelled { .. } => SESSION_CANCELLED,
            Error::InvalidState { .. } | Error::NoTransaction { .. } => INVALID_STATE,
            Error::NotDetained { .. } => NOT_DETAINED,
            Error::InvalidEndpoint(_)
            | Error::InvalidTimestamp(_)
            | Error::InvalidRegion(_)
            | Error::InvalidArgument(_)
            | Error::NoSpan { .. }
            | Error::FileNotFound(_) => INVALID_ARGUMENT,
            Error::Closed { .. } => STALE_HANDLE,
            Error::Worker(_) => WORKER_FAILED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_code_roundtrip() {
        for code in [
            ReturnCode::Store,
            ReturnCode::MessageObject,
            ReturnCode::Io,
            ReturnCode::Interrupted,
            ReturnCode::ConnectionAborted,
            ReturnCode::Malloc,
        ] {
            assert_eq!(ReturnCode::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(ReturnCode::from_i32(0), None);
        assert_eq!(ReturnCode::from_i32(-7), None);
    }

    #[test]
    fn io_code_kind_depends_on_step() {
        let ep = "ipn:1.1";
        assert!(matches!(
            Error::from_engine(Step::Insert, ReturnCode::Io, ep),
            Error::StoreAllocation { .. }
        ));
        assert!(matches!(
            Error::from_engine(Step::CreateObject, ReturnCode::Io, ep),
            Error::MessageCreation { .. }
        ));
        assert!(matches!(
            Error::from_engine(Step::Transmit, ReturnCode::Io, ep),
            Error::Transmission { .. }
        ));
        assert!(matches!(
            Error::from_engine(Step::Memo, ReturnCode::Io, ep),
            Error::RetransmissionSchedule { .. }
        ));
        assert!(matches!(
            Error::from_engine(Step::Receive, ReturnCode::Io, ep),
            Error::Reception { .. }
        ));
    }

    #[test]
    fn sentinel_codes_win_over_step() {
        let ep = "ipn:1.1";
        assert!(matches!(
            Error::from_engine(Step::Transmit, ReturnCode::Interrupted, ep),
            Error::Interrupted { .. }
        ));
        assert!(matches!(
            Error::from_engine(Step::Receive, ReturnCode::ConnectionAborted, ep),
            Error::ConnectionAborted { .. }
        ));
        assert!(matches!(
            Error::from_engine(Step::Insert, ReturnCode::Malloc, ep),
            Error::OutOfMemory { .. }
        ));
        assert!(matches!(
            Error::from_engine(Step::Transmit, ReturnCode::Store, ep),
            Error::StoreAllocation { .. }
        ));
    }

    #[test]
    fn retryable_split() {
        let ep = "ipn:1.1".to_string();
        assert!(Error::StoreAllocation {
            endpoint: ep.clone(),
            code: ReturnCode::Store
        }
        .is_retryable());
        assert!(!Error::NotImplemented {
            endpoint: ep.clone(),
            what: Unsupported::GreenSegment
        }
        .is_retryable());
        assert!(!Error::ConnectionAborted { endpoint: ep }.is_retryable());
    }

    #[test]
    fn message_carries_endpoint_and_code() {
        let e = Error::Transmission {
            endpoint: "ipn:2.1".into(),
            code: ReturnCode::Io,
        };
        let text = e.to_string();
        assert!(text.contains("ipn:2.1"));
        assert!(text.contains("-3"));
        assert_eq!(e.code(), -3);
    }
}
