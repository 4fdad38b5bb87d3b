//! Bundle family: endpoint ids, send options and per-bundle metadata.

use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::engine::SendOptions;
use crate::error::Error;

/// Bundle endpoint id (`ipn:N.S`, `dtn:<ssp>` or `dtn:none`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Eid(String);

impl Eid {
    pub const NONE: &'static str = "dtn:none";

    pub fn ipn(node: u64, service: u64) -> Self {
        Eid(format!("ipn:{node}.{service}"))
    }

    pub fn none() -> Self {
        Eid(Self::NONE.to_string())
    }

    pub fn is_none(&self) -> bool {
        self.0 == Self::NONE
    }

    /// Node and service numbers of an `ipn` id.
    pub fn ipn_parts(&self) -> Option<(u64, u64)> {
        let rest = self.0.strip_prefix("ipn:")?;
        let (node, service) = rest.split_once('.')?;
        Some((node.parse().ok()?, service.parse().ok()?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Eid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let valid = if let Some(rest) = s.strip_prefix("ipn:") {
            match rest.split_once('.') {
                Some((node, service)) => node.parse::<u64>().is_ok() && service.parse::<u64>().is_ok(),
                None => false,
            }
        } else if let Some(ssp) = s.strip_prefix("dtn:") {
            !ssp.is_empty() && !ssp.chars().any(char::is_whitespace)
        } else {
            false
        };
        if valid {
            Ok(Eid(s.to_string()))
        } else {
            Err(Error::InvalidEndpoint(s.to_string()))
        }
    }
}

impl TryFrom<String> for Eid {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<Eid> for String {
    fn from(eid: Eid) -> String {
        eid.0
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Bulk = 0,
    #[default]
    Standard = 1,
    Expedited = 2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Custody {
    #[default]
    None = 0,
    SourceOptional = 1,
    SourceRequired = 2,
}

/// Status-report request flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFlags(u8);

impl ReportFlags {
    pub const NONE: ReportFlags = ReportFlags(0);
    pub const RECEIVED: ReportFlags = ReportFlags(1);
    pub const CUSTODY: ReportFlags = ReportFlags(2);
    pub const FORWARDED: ReportFlags = ReportFlags(4);
    pub const DELIVERED: ReportFlags = ReportFlags(8);
    pub const DELETED: ReportFlags = ReportFlags(16);

    pub fn from_bits(bits: u8) -> Self {
        ReportFlags(bits & 0x1f)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: ReportFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ReportFlags {
    type Output = ReportFlags;

    fn bitor(self, rhs: ReportFlags) -> ReportFlags {
        ReportFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BpSendOptions {
    /// Bundle lifetime in seconds.
    pub ttl: u32,
    pub priority: Priority,
    pub report_to: Option<Eid>,
    pub custody: Custody,
    pub report_flags: ReportFlags,
    pub ack_requested: bool,
    /// Custodial retransmission timer in seconds; 0 disables it.
    pub retx_timer: u32,
    pub ordinal: u8,
    /// Minimum-latency (critical) forwarding.
    pub critical: bool,
}

impl Default for BpSendOptions {
    fn default() -> Self {
        Self {
            ttl: 3600,
            priority: Priority::Standard,
            report_to: None,
            custody: Custody::None,
            report_flags: ReportFlags::NONE,
            ack_requested: false,
            retx_timer: 0,
            ordinal: 0,
            critical: false,
        }
    }
}

impl SendOptions for BpSendOptions {
    fn retransmission_timer(&self) -> Option<u32> {
        (self.custody == Custody::SourceRequired && self.retx_timer > 0).then_some(self.retx_timer)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationTime {
    /// Milliseconds since the DTN epoch (2000-01-01T00:00:00Z).
    pub msec: u64,
    pub count: u32,
}

/// Metadata delivered with each bundle payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMeta {
    pub source: Eid,
    pub creation_time: CreationTime,
    pub time_to_live: u32,
    pub metadata_type: u8,
    pub metadata: Vec<u8>,
}
