//! Administrative pass-through: endpoints, contact plan, LTP spans, the bundle watch switch and
//! CFDP segment size. Arguments are validated here; the database does the rest.

use std::net::SocketAddr;
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::bp::Eid;
use crate::error::{EngineResult, Error, Family, ReturnCode, Result};
use crate::ltp::EngineId;
use crate::timestamp::{format_timestamp, parse_timestamp};

/// Contact-plan region relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    Home,
    Outer,
}

impl Region {
    pub fn from_index(index: u32) -> Result<Self> {
        match index {
            0 => Ok(Region::Home),
            1 => Ok(Region::Outer),
            other => Err(Error::InvalidRegion(other)),
        }
    }

    pub fn index(self) -> u32 {
        match self {
            Region::Home => 0,
            Region::Outer => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub region: Region,
    pub from_node: u64,
    pub to_node: u64,
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    /// Bytes per second.
    pub rate: u32,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub from_node: u64,
    pub to_node: u64,
    pub start: OffsetDateTime,
    pub end: OffsetDateTime,
    /// One-way light time in seconds.
    pub owlt: u32,
}

/// LTP span to one peer engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LtpSpan {
    pub engine: EngineId,
    pub max_export_sessions: u32,
    pub max_import_sessions: u32,
    /// Largest data segment in bytes.
    pub max_segment_size: u32,
    /// Bundles aggregated into one block.
    pub aggregation_size_limit: u32,
    /// Seconds a block waits to fill up before it is sent anyway.
    pub aggregation_time_limit: u32,
    /// Link service output command, e.g. `udplso 10.0.0.2:1113 0`.
    pub lso_command: String,
    /// Seconds the peer is expected to take between receiving a segment and acknowledging it.
    pub queueing_latency: u32,
    pub purge: bool,
}

/// New configuration of an existing span, carried over UDP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanUpdate {
    pub engine: u64,
    pub max_segment_size: u32,
    /// Where the peer's link service input listens.
    pub peer: SocketAddr,
    /// Bytes per second pushed to UDP; 0 disables rate control.
    pub udp_rate: u32,
    pub max_export_sessions: u32,
    pub max_import_sessions: u32,
    pub aggregation_size_limit: u32,
    pub aggregation_time_limit: u32,
    pub queueing_latency: u32,
    pub purge: bool,
}

impl SpanUpdate {
    /// One session each way, no aggregation, one second of queueing latency, no rate control.
    pub fn new(engine: u64, max_segment_size: u32, peer: SocketAddr) -> Self {
        Self {
            engine,
            max_segment_size,
            peer,
            udp_rate: 0,
            max_export_sessions: 1,
            max_import_sessions: 1,
            aggregation_size_limit: 1,
            aggregation_time_limit: 1,
            queueing_latency: 1,
            purge: false,
        }
    }

    fn into_span(self) -> LtpSpan {
        LtpSpan {
            engine: EngineId(self.engine),
            max_export_sessions: self.max_export_sessions,
            max_import_sessions: self.max_import_sessions,
            max_segment_size: self.max_segment_size,
            aggregation_size_limit: self.aggregation_size_limit,
            aggregation_time_limit: self.aggregation_time_limit,
            lso_command: format!("udplso {} {}", self.peer, self.udp_rate),
            queueing_latency: self.queueing_latency,
            purge: self.purge,
        }
    }
}

/// Configuration database of the engine. Implementations only store; validation lives in `Admin`.
pub trait AdminDatabase: Send + Sync {
    /// `discard`: drop bundles for the endpoint while no application is bound.
    fn add_endpoint(&self, eid: &Eid, discard: bool) -> EngineResult<()>;
    fn endpoint_exists(&self, eid: &Eid) -> bool;
    fn list_endpoints(&self) -> Vec<Eid>;

    fn add_contact(&self, contact: &Contact) -> EngineResult<()>;
    fn list_contacts(&self) -> Vec<Contact>;
    /// Remove matching contacts; `start: None` removes all between the two nodes.
    fn delete_contact(&self, region: Region, from: u64, to: u64, start: Option<OffsetDateTime>) -> EngineResult<usize>;

    fn add_range(&self, range: &Range) -> EngineResult<()>;
    fn list_ranges(&self) -> Vec<Range>;
    fn delete_range(&self, from: u64, to: u64, start: Option<OffsetDateTime>) -> EngineResult<usize>;

    /// Regions this node is a member of.
    fn list_regions(&self) -> Vec<Region>;

    fn ltp_span_exists(&self, engine: EngineId) -> bool;
    fn list_ltp_spans(&self) -> Vec<LtpSpan>;
    /// Replace the configuration of the span to `span.engine`, which must exist.
    fn update_ltp_span(&self, span: &LtpSpan) -> EngineResult<()>;

    /// Diagnostic activity trace of the bundle engine.
    fn set_bp_watch(&self, on: bool) -> EngineResult<()>;

    fn set_cfdp_segment_size(&self, bytes: u32) -> EngineResult<()>;
}

pub struct Admin<D: AdminDatabase> {
    db: Arc<D>,
    reference: OffsetDateTime,
}

impl<D: AdminDatabase> Admin<D> {
    /// `reference` anchors relative `+seconds` timestamps.
    pub fn new(db: Arc<D>, reference: OffsetDateTime) -> Self {
        Self { db, reference }
    }

    pub fn reference(&self) -> OffsetDateTime {
        self.reference
    }

    pub fn add_endpoint(&self, eid: &str, discard: bool) -> Result<Eid> {
        let eid: Eid = eid.parse()?;
        self.db.add_endpoint(&eid, discard).map_err(engine_error)?;
        info!("added endpoint {eid}");
        Ok(eid)
    }

    pub fn endpoint_exists(&self, eid: &str) -> Result<bool> {
        Ok(self.db.endpoint_exists(&eid.parse()?))
    }

    pub fn list_endpoints(&self) -> Vec<Eid> {
        self.db.list_endpoints()
    }

    /// `rate_bps` is in bits per second and stored as bytes per second.
    #[allow(clippy::too_many_arguments)]
    pub fn add_contact(
        &self,
        region: u32,
        from: u64,
        to: u64,
        start: &str,
        end: &str,
        rate_bps: u64,
        confidence: f32,
    ) -> Result<Contact> {
        let region = Region::from_index(region)?;
        let (start, end) = self.window(start, end)?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(Error::InvalidArgument(format!(
                "contact confidence {confidence} outside 0..=1"
            )));
        }
        let rate = u32::try_from(rate_bps / 8)
            .map_err(|_| Error::InvalidArgument(format!("contact rate {rate_bps} bps too large")))?;
        let contact = Contact {
            region,
            from_node: from,
            to_node: to,
            start,
            end,
            rate,
            confidence,
        };
        self.db.add_contact(&contact).map_err(engine_error)?;
        info!(
            "added contact {from}->{to} {}..{} at {rate} B/s",
            format_timestamp(start),
            format_timestamp(end)
        );
        Ok(contact)
    }

    pub fn delete_contact(&self, region: u32, from: u64, to: u64, start: Option<&str>) -> Result<usize> {
        let region = Region::from_index(region)?;
        let start = start.map(|s| parse_timestamp(s, self.reference)).transpose()?;
        self.db
            .delete_contact(region, from, to, start)
            .map_err(engine_error)
    }

    pub fn list_contacts(&self) -> Vec<Contact> {
        self.db.list_contacts()
    }

    pub fn add_range(&self, from: u64, to: u64, start: &str, end: &str, owlt: u32) -> Result<Range> {
        let (start, end) = self.window(start, end)?;
        let range = Range {
            from_node: from,
            to_node: to,
            start,
            end,
            owlt,
        };
        self.db.add_range(&range).map_err(engine_error)?;
        Ok(range)
    }

    pub fn delete_range(&self, from: u64, to: u64, start: Option<&str>) -> Result<usize> {
        let start = start.map(|s| parse_timestamp(s, self.reference)).transpose()?;
        self.db.delete_range(from, to, start).map_err(engine_error)
    }

    pub fn list_ranges(&self) -> Vec<Range> {
        self.db.list_ranges()
    }

    pub fn list_regions(&self) -> Vec<Region> {
        self.db.list_regions()
    }

    pub fn ltp_span_exists(&self, engine: u64) -> bool {
        self.db.ltp_span_exists(EngineId(engine))
    }

    /// Every span, or only the one to `engine`.
    pub fn ltp_spans(&self, engine: Option<u64>) -> Vec<LtpSpan> {
        let mut spans = self.db.list_ltp_spans();
        if let Some(engine) = engine {
            spans.retain(|s| s.engine == EngineId(engine));
        }
        spans
    }

    pub fn update_ltp_span(&self, update: SpanUpdate) -> Result<LtpSpan> {
        if !self.ltp_span_exists(update.engine) {
            return Err(Error::NoSpan {
                engine: update.engine,
            });
        }
        if update.max_segment_size == 0 {
            return Err(Error::InvalidArgument("LTP segment size must be positive".into()));
        }
        if update.max_export_sessions == 0 || update.max_import_sessions == 0 {
            return Err(Error::InvalidArgument("an LTP span needs at least one session each way".into()));
        }
        if update.aggregation_size_limit == 0 {
            return Err(Error::InvalidArgument("LTP aggregation size limit must be positive".into()));
        }
        let span = update.into_span();
        self.db.update_ltp_span(&span).map_err(|code| Error::Engine {
            family: Family::Ltp,
            code,
        })?;
        info!("updated LTP span to engine {} ({})", span.engine.0, span.lso_command);
        Ok(span)
    }

    pub fn bp_watch(&self, on: bool) -> Result<()> {
        self.db.set_bp_watch(on).map_err(engine_error)
    }

    pub fn set_cfdp_segment_size(&self, bytes: u32) -> Result<()> {
        if bytes == 0 {
            return Err(Error::InvalidArgument("CFDP segment size must be positive".into()));
        }
        self.db.set_cfdp_segment_size(bytes).map_err(|code| Error::Engine {
            family: Family::Cfdp,
            code,
        })
    }

    fn window(&self, start: &str, end: &str) -> Result<(OffsetDateTime, OffsetDateTime)> {
        let start = parse_timestamp(start, self.reference)?;
        let end = parse_timestamp(end, self.reference)?;
        if end <= start {
            return Err(Error::InvalidArgument(format!(
                "window ends at {} before it starts at {}",
                format_timestamp(end),
                format_timestamp(start)
            )));
        }
        Ok((start, end))
    }
}

fn engine_error(code: ReturnCode) -> Error {
    Error::Engine {
        family: Family::Bundle,
        code,
    }
}
