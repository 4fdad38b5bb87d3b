//! LTP family: client and session ids, and the mapping from engine notices to receive outcomes.
//! Only fully red blocks are delivered.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::engine::{Reception, SendOptions};
use crate::error::{SessionDirection, Unsupported};

/// LTP client service id an access point binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ltp client {}", self.0)
    }
}

/// Destination LTP engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineId(pub u64);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ltp engine {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LtpSessionId {
    pub originator: EngineId,
    pub number: u32,
}

impl fmt::Display for LtpSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.originator.0, self.number)
    }
}

/// Blocks are always sent fully red.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LtpSendOptions;

impl SendOptions for LtpSendOptions {}

/// Delivered with each block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub session: LtpSessionId,
    pub client: ClientId,
}

/// Notice an LTP engine reports to a client.
#[derive(Debug)]
pub enum LtpNotice<O> {
    ExportSessionComplete {
        session: LtpSessionId,
    },
    ExportSessionCanceled {
        session: LtpSessionId,
        reason: u8,
    },
    ImportSessionCanceled {
        session: LtpSessionId,
        reason: u8,
    },
    RecvGreenSegment {
        session: LtpSessionId,
        offset: u64,
        data: O,
    },
    RecvRedPart {
        session: LtpSessionId,
        client: ClientId,
        data: O,
        end_of_block: bool,
    },
    /// The blocking notice call was woken up.
    Interrupted,
    /// The client's reception was closed.
    ReceptionClosed,
}

/// Map one notice onto a receive outcome. `None` means the notice is not for the receiver; poll again.
pub fn classify<O>(notice: LtpNotice<O>) -> Option<Reception<O, BlockMeta>> {
    Some(match notice {
        LtpNotice::ExportSessionComplete { .. } => return None,
        LtpNotice::ExportSessionCanceled { reason, .. } => Reception::Cancelled {
            direction: SessionDirection::Export,
            reason,
        },
        LtpNotice::ImportSessionCanceled { reason, .. } => Reception::Cancelled {
            direction: SessionDirection::Import,
            reason,
        },
        LtpNotice::RecvGreenSegment { data, .. } => Reception::Unsupported {
            what: Unsupported::GreenSegment,
            object: Some(data),
        },
        LtpNotice::RecvRedPart {
            data,
            end_of_block: false,
            ..
        } => Reception::Unsupported {
            what: Unsupported::PartialRedBlock,
            object: Some(data),
        },
        LtpNotice::RecvRedPart {
            session,
            client,
            data,
            end_of_block: true,
        } => Reception::Delivered {
            object: data,
            meta: BlockMeta { session, client },
        },
        LtpNotice::Interrupted => Reception::Interrupted,
        LtpNotice::ReceptionClosed => Reception::Stopped,
    })
}
