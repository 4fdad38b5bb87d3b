//! Engine call surface consumed by the access-point manager.
//!
//! One trait covers the bundle and LTP families; the manager in `access` is generic over it.
//! Implementations own every engine-side object they hand out and must free it when a call
//! that consumes it fails.

use std::fmt;

use crate::error::{EngineResult, Family, SessionDirection, Unsupported};
use crate::gate::Attendant;

/// Per-send options of a family.
pub trait SendOptions: Clone + Default + Send + Sync + 'static {
    /// Custodial retransmission timer (seconds) to schedule after transmission, if any.
    fn retransmission_timer(&self) -> Option<u32> {
        None
    }
}

/// Bytes inserted into the store and not yet wrapped in a message object.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct StoreRef(u64);

impl StoreRef {
    pub fn new(id: u64) -> Self {
        StoreRef(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Outcome of one blocking engine receive.
#[derive(Debug)]
pub enum Reception<O, M> {
    /// Payload available in an engine-owned object.
    Delivered { object: O, meta: M },
    /// The blocking call woke up without data, requested or not.
    Interrupted,
    /// The endpoint was stopped by the engine.
    Stopped,
    TimedOut,
    Cancelled {
        direction: SessionDirection,
        reason: u8,
    },
    /// Data the core refuses to deliver; any object still has to be released.
    Unsupported { what: Unsupported, object: Option<O> },
}

impl<O, M> Reception<O, M> {
    /// Engine object carried by this outcome, if any.
    pub fn into_object(self) -> Option<O> {
        match self {
            Reception::Delivered { object, .. } => Some(object),
            Reception::Unsupported { object, .. } => object,
            _ => None,
        }
    }
}

pub trait Engine: Send + Sync + 'static {
    /// Local address an access point binds (endpoint id, client id).
    type Address: Clone + fmt::Display + Send + Sync + 'static;
    type Destination: fmt::Display + Send + Sync + 'static;
    /// Opaque engine handle of an open access point.
    type Sap: Send + Sync + 'static;
    type Options: SendOptions;
    /// Engine-owned message object.
    type Object: Send + 'static;
    /// Result of a transmission, kept for retransmission and detained release.
    type Sent: Send;
    type Meta: Send + 'static;

    const FAMILY: Family;

    fn attach(&self) -> EngineResult<()>;
    fn detach(&self);

    fn open(&self, address: &Self::Address, detained: bool) -> EngineResult<Self::Sap>;
    fn close(&self, sap: &Self::Sap);
    /// Wake a blocked `receive` on `sap`. Must not block.
    fn interrupt(&self, sap: &Self::Sap);

    fn start_attendant(&self) -> EngineResult<Attendant> {
        Ok(Attendant::new())
    }

    fn insert(&self, data: &[u8]) -> EngineResult<StoreRef>;
    /// Wrap stored bytes in a message object. With an attendant, may block until space frees up.
    fn create_object(
        &self,
        stored: StoreRef,
        len: usize,
        options: &Self::Options,
        attendant: Option<&Attendant>,
    ) -> EngineResult<Self::Object>;
    fn send(
        &self,
        sap: &Self::Sap,
        destination: &Self::Destination,
        options: &Self::Options,
        object: Self::Object,
    ) -> EngineResult<Self::Sent>;
    fn memo(&self, _sent: &Self::Sent, _seconds: u32) -> EngineResult<()> {
        Ok(())
    }
    /// Hand a detained message back to the engine.
    fn release_sent(&self, sent: Self::Sent) {
        drop(sent);
    }

    /// Blocking receive.
    fn receive(&self, sap: &Self::Sap) -> EngineResult<Reception<Self::Object, Self::Meta>>;
    fn object_len(&self, object: &Self::Object) -> EngineResult<usize>;
    fn read_object(&self, object: &Self::Object, buf: &mut [u8]) -> EngineResult<usize>;
    fn release_object(&self, object: Self::Object);
}
