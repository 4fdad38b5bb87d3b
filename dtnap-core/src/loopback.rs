//! In-process engine: bundle and LTP access points, CFDP transfers and an admin database over
//! one bounded store. Everything sent is delivered on the same node. Not a protocol
//! implementation; it models the engine surface closely enough to drive the lifecycle.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, trace};
use time::OffsetDateTime;

use crate::admin::{AdminDatabase, Contact, LtpSpan, Range, Region};
use crate::bp::{BpSendOptions, BundleMeta, CreationTime, Eid};
use crate::cfdp::{
    CfdpEngine, CfdpEvent, CfdpEventKind, Condition, DeliveryCode, FileStatus, FilestoreAction,
    FilestoreRequest, FilestoreResponse, FilestoreStatus, PutRequest, TransactionId,
};
use crate::engine::{Engine, Reception, StoreRef};
use crate::error::{EngineResult, Family, ReturnCode, SessionDirection};
use crate::gate::Attendant;
use crate::lock;
use crate::ltp::{self, BlockMeta, ClientId, EngineId, LtpNotice, LtpSendOptions, LtpSessionId};
use crate::store::{ObjectId, Store, StoreUsage};
use crate::timestamp::dtn_time;

pub const DEFAULT_CFDP_SEGMENT_SIZE: u32 = 65000;

// Upper bound on one blocking event poll, so a monitor always re-checks its open flag.
const EVENT_POLL: Duration = Duration::from_millis(200);

/// Engine step that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Attach,
    Open,
    StartAttendant,
    Insert,
    CreateObject,
    Transmit,
    Memo,
    /// Bundle receive fails with the interrupted-call code while nobody interrupted it.
    Receive,
    Read,
    Put,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub attaches: usize,
    pub detaches: usize,
    pub opens: usize,
    pub closes: usize,
    pub interrupts: usize,
}

struct QueuedBundle {
    object: ObjectId,
    meta: BundleMeta,
}

#[derive(Default)]
struct BpEndpoint {
    discard: bool,
    bound: Option<u64>,
    queue: VecDeque<QueuedBundle>,
    wake: bool,
    stopped: bool,
}

#[derive(Default)]
struct BpState {
    endpoints: BTreeMap<Eid, BpEndpoint>,
    next_sap: u64,
    next_bundle: u64,
    detained: HashMap<u64, ObjectId>,
    memos: HashMap<u64, u32>,
}

#[derive(Default)]
struct LtpClient {
    open: bool,
    wake: bool,
    notices: VecDeque<LtpNotice<ObjectId>>,
}

#[derive(Default)]
struct LtpState {
    clients: HashMap<u32, LtpClient>,
    next_session: u32,
}

struct Transfer {
    request: PutRequest,
    suspended: bool,
}

struct CfdpState {
    events: VecDeque<CfdpEvent>,
    epoch: u64,
    next_tx: u64,
    segment_size: u32,
    hold: bool,
    active: BTreeMap<TransactionId, Transfer>,
    finished: HashSet<TransactionId>,
}

#[derive(Default)]
struct AdminState {
    contacts: Vec<Contact>,
    ranges: Vec<Range>,
    spans: BTreeMap<u64, LtpSpan>,
    watching: bool,
}

struct Node {
    number: u64,
    ltp_engine: EngineId,
    store: Store,
    faults: Mutex<HashSet<Fault>>,
    counters: Mutex<Counters>,
    bp: Mutex<BpState>,
    bp_cv: Condvar,
    ltp: Mutex<LtpState>,
    ltp_cv: Condvar,
    cfdp: Mutex<CfdpState>,
    cfdp_cv: Condvar,
    admin: Mutex<AdminState>,
}

impl Node {
    fn fail_once(&self, fault: Fault) -> bool {
        lock(&self.faults).remove(&fault)
    }

    fn count(&self, f: impl FnOnce(&mut Counters)) {
        f(&mut lock(&self.counters));
    }

    fn attach(&self, family: Family) -> EngineResult<()> {
        if self.fail_once(Fault::Attach) {
            return Err(ReturnCode::Io);
        }
        self.count(|c| c.attaches += 1);
        debug!("node {}: {family} attached", self.number);
        Ok(())
    }

    fn detach(&self, family: Family) {
        self.count(|c| c.detaches += 1);
        debug!("node {}: {family} detached", self.number);
    }

    fn start_attendant(&self) -> EngineResult<Attendant> {
        if self.fail_once(Fault::StartAttendant) {
            return Err(ReturnCode::Malloc);
        }
        Ok(Attendant::new())
    }

    fn insert(&self, data: &[u8]) -> EngineResult<StoreRef> {
        if self.fail_once(Fault::Insert) {
            return Err(ReturnCode::Store);
        }
        self.store.insert(data)
    }

    fn create_object(&self, stored: StoreRef, attendant: Option<&Attendant>) -> EngineResult<ObjectId> {
        if self.fail_once(Fault::CreateObject) {
            self.store.discard(stored);
            return Err(ReturnCode::MessageObject);
        }
        self.store.create_object(stored, attendant)
    }

    fn read(&self, object: &ObjectId, buf: &mut [u8]) -> EngineResult<usize> {
        if self.fail_once(Fault::Read) {
            return Err(ReturnCode::Io);
        }
        self.store.read(*object, buf)
    }

    /// Store `data` as a committed object, bypassing admission control.
    fn object_from(&self, data: &[u8]) -> EngineResult<ObjectId> {
        let stored = self.store.insert(data)?;
        self.store.create_object(stored, None)
    }

    fn bp(&self) -> MutexGuard<'_, BpState> {
        lock(&self.bp)
    }

    fn ltp(&self) -> MutexGuard<'_, LtpState> {
        lock(&self.ltp)
    }

    fn cfdp(&self) -> MutexGuard<'_, CfdpState> {
        lock(&self.cfdp)
    }
}

/// One simulated node. Clones share the node.
#[derive(Clone)]
pub struct LoopbackNode {
    node: Arc<Node>,
    bp: Arc<LoopbackBp>,
    ltp: Arc<LoopbackLtp>,
    cfdp: Arc<LoopbackCfdp>,
}

impl LoopbackNode {
    /// Node `number` with a store of `capacity` bytes. Its LTP engine number equals the node number.
    pub fn new(number: u64, capacity: usize) -> Self {
        Self::with_ltp_engine(number, EngineId(number), capacity)
    }

    pub fn with_ltp_engine(number: u64, ltp_engine: EngineId, capacity: usize) -> Self {
        let node = Arc::new(Node {
            number,
            ltp_engine,
            store: Store::new(capacity),
            faults: Mutex::new(HashSet::new()),
            counters: Mutex::new(Counters::default()),
            bp: Mutex::new(BpState::default()),
            bp_cv: Condvar::new(),
            ltp: Mutex::new(LtpState::default()),
            ltp_cv: Condvar::new(),
            cfdp: Mutex::new(CfdpState {
                events: VecDeque::new(),
                epoch: 0,
                next_tx: 1,
                segment_size: DEFAULT_CFDP_SEGMENT_SIZE,
                hold: false,
                active: BTreeMap::new(),
                finished: HashSet::new(),
            }),
            cfdp_cv: Condvar::new(),
            admin: Mutex::new(AdminState::default()),
        });
        Self {
            bp: Arc::new(LoopbackBp { node: node.clone() }),
            ltp: Arc::new(LoopbackLtp { node: node.clone() }),
            cfdp: Arc::new(LoopbackCfdp { node: node.clone() }),
            node,
        }
    }

    pub fn number(&self) -> u64 {
        self.node.number
    }

    pub fn ltp_engine(&self) -> EngineId {
        self.node.ltp_engine
    }

    pub fn bp(&self) -> Arc<LoopbackBp> {
        self.bp.clone()
    }

    pub fn ltp(&self) -> Arc<LoopbackLtp> {
        self.ltp.clone()
    }

    pub fn cfdp(&self) -> Arc<LoopbackCfdp> {
        self.cfdp.clone()
    }

    pub fn usage(&self) -> StoreUsage {
        self.node.store.usage()
    }

    pub fn counters(&self) -> Counters {
        *lock(&self.node.counters)
    }

    /// Make the next call of `fault`'s step fail.
    pub fn inject_fault(&self, fault: Fault) {
        lock(&self.node.faults).insert(fault);
    }

    /// Wake a receive on `eid` without the caller asking for it.
    pub fn wake_spuriously(&self, eid: &Eid) {
        if let Some(ep) = self.node.bp().endpoints.get_mut(eid) {
            ep.wake = true;
        }
        self.node.bp_cv.notify_all();
    }

    /// Administratively stop `eid`: receives return with the endpoint stopped until it is reopened.
    pub fn stop_endpoint(&self, eid: &Eid) {
        if let Some(ep) = self.node.bp().endpoints.get_mut(eid) {
            ep.stopped = true;
        }
        self.node.bp_cv.notify_all();
    }

    pub fn queued(&self, eid: &Eid) -> usize {
        self.node.bp().endpoints.get(eid).map_or(0, |ep| ep.queue.len())
    }

    pub fn detained_count(&self) -> usize {
        self.node.bp().detained.len()
    }

    pub fn memo_count(&self) -> usize {
        self.node.bp().memos.len()
    }

    pub fn inject_green_segment(&self, client: ClientId, data: &[u8]) -> EngineResult<()> {
        let object = self.node.object_from(data)?;
        let session = self.ltp.next_session(&mut self.node.ltp());
        self.push_notice(
            client,
            LtpNotice::RecvGreenSegment {
                session,
                offset: 0,
                data: object,
            },
        );
        Ok(())
    }

    /// Red part of a block that continues with green data.
    pub fn inject_partial_red(&self, client: ClientId, data: &[u8]) -> EngineResult<()> {
        let object = self.node.object_from(data)?;
        let session = self.ltp.next_session(&mut self.node.ltp());
        self.push_notice(
            client,
            LtpNotice::RecvRedPart {
                session,
                client,
                data: object,
                end_of_block: false,
            },
        );
        Ok(())
    }

    pub fn inject_session_cancelled(&self, client: ClientId, direction: SessionDirection, reason: u8) {
        let session = self.ltp.next_session(&mut self.node.ltp());
        let notice = match direction {
            SessionDirection::Export => LtpNotice::ExportSessionCanceled { session, reason },
            SessionDirection::Import => LtpNotice::ImportSessionCanceled { session, reason },
        };
        self.push_notice(client, notice);
    }

    /// While held, CFDP transfers stay active until released, cancelled or resumed.
    pub fn hold_transfers(&self, hold: bool) {
        let mut state = self.node.cfdp();
        state.hold = hold;
        if !hold {
            let ready: Vec<_> = state
                .active
                .iter()
                .filter(|(_, t)| !t.suspended)
                .map(|(tx, _)| *tx)
                .collect();
            for tx in ready {
                if let Some(transfer) = state.active.remove(&tx) {
                    self.cfdp.execute(&mut state, tx, &transfer.request);
                }
            }
        }
        drop(state);
        self.node.cfdp_cv.notify_all();
    }

    pub fn cfdp_segment_size(&self) -> u32 {
        self.node.cfdp().segment_size
    }

    /// Define a span to `engine` with a single session each way and 1400-byte segments.
    pub fn define_ltp_span(&self, engine: EngineId) {
        let span = LtpSpan {
            engine,
            max_export_sessions: 1,
            max_import_sessions: 1,
            max_segment_size: 1400,
            aggregation_size_limit: 1,
            aggregation_time_limit: 1,
            lso_command: String::new(),
            queueing_latency: 1,
            purge: false,
        };
        lock(&self.node.admin).spans.entry(engine.0).or_insert(span);
    }

    pub fn bp_watching(&self) -> bool {
        lock(&self.node.admin).watching
    }

    fn push_notice(&self, client: ClientId, notice: LtpNotice<ObjectId>) {
        self.node
            .ltp()
            .clients
            .entry(client.0)
            .or_default()
            .notices
            .push_back(notice);
        self.node.ltp_cv.notify_all();
    }
}

/// Bundle access points of a loopback node.
pub struct LoopbackBp {
    node: Arc<Node>,
}

/// Engine handle of an open bundle endpoint.
#[derive(Debug)]
pub struct BpSap {
    id: u64,
    eid: Eid,
    detained: bool,
}

/// Transmitted bundle.
#[derive(Debug)]
pub struct BundleRef {
    id: u64,
}

impl Engine for LoopbackBp {
    type Address = Eid;
    type Destination = Eid;
    type Sap = BpSap;
    type Options = BpSendOptions;
    type Object = ObjectId;
    type Sent = BundleRef;
    type Meta = BundleMeta;

    const FAMILY: Family = Family::Bundle;

    fn attach(&self) -> EngineResult<()> {
        self.node.attach(Self::FAMILY)
    }

    fn detach(&self) {
        self.node.detach(Self::FAMILY)
    }

    fn open(&self, eid: &Eid, detained: bool) -> EngineResult<BpSap> {
        if self.node.fail_once(Fault::Open) {
            return Err(ReturnCode::Io);
        }
        let mut state = self.node.bp();
        state.next_sap += 1;
        let id = state.next_sap;
        let ep = state.endpoints.get_mut(eid).ok_or(ReturnCode::Io)?;
        if ep.bound.is_some() {
            return Err(ReturnCode::Io);
        }
        ep.bound = Some(id);
        ep.wake = false;
        ep.stopped = false;
        drop(state);
        self.node.count(|c| c.opens += 1);
        Ok(BpSap {
            id,
            eid: eid.clone(),
            detained,
        })
    }

    fn close(&self, sap: &BpSap) {
        if let Some(ep) = self.node.bp().endpoints.get_mut(&sap.eid) {
            if ep.bound == Some(sap.id) {
                ep.bound = None;
                ep.wake = false;
            }
        }
        self.node.count(|c| c.closes += 1);
        self.node.bp_cv.notify_all();
    }

    fn interrupt(&self, sap: &BpSap) {
        if let Some(ep) = self.node.bp().endpoints.get_mut(&sap.eid) {
            if ep.bound == Some(sap.id) {
                ep.wake = true;
            }
        }
        self.node.count(|c| c.interrupts += 1);
        self.node.bp_cv.notify_all();
    }

    fn start_attendant(&self) -> EngineResult<Attendant> {
        self.node.start_attendant()
    }

    fn insert(&self, data: &[u8]) -> EngineResult<StoreRef> {
        self.node.insert(data)
    }

    fn create_object(
        &self,
        stored: StoreRef,
        _len: usize,
        _options: &BpSendOptions,
        attendant: Option<&Attendant>,
    ) -> EngineResult<ObjectId> {
        self.node.create_object(stored, attendant)
    }

    fn send(&self, sap: &BpSap, dest: &Eid, options: &BpSendOptions, object: ObjectId) -> EngineResult<BundleRef> {
        if self.node.fail_once(Fault::Transmit) {
            self.node.store.release(object);
            return Err(ReturnCode::Io);
        }
        let mut state = self.node.bp();
        state.next_bundle += 1;
        let id = state.next_bundle;
        let deliverable = state.endpoints.get(dest).map(|ep| ep.bound.is_some() || !ep.discard);
        let Some(deliverable) = deliverable else {
            drop(state);
            self.node.store.release(object);
            return Err(ReturnCode::Io);
        };
        if sap.detained {
            self.node.store.retain(object)?;
            state.detained.insert(id, object);
        }
        if deliverable {
            let meta = BundleMeta {
                source: sap.eid.clone(),
                creation_time: CreationTime {
                    msec: dtn_time(&OffsetDateTime::now_utc()),
                    count: id as u32,
                },
                time_to_live: options.ttl,
                metadata_type: 0,
                metadata: Vec::new(),
            };
            if let Some(ep) = state.endpoints.get_mut(dest) {
                ep.queue.push_back(QueuedBundle { object, meta });
            }
            drop(state);
            self.node.bp_cv.notify_all();
        } else {
            drop(state);
            trace!("bundle {id} to unbound {dest} discarded");
            self.node.store.release(object);
        }
        Ok(BundleRef { id })
    }

    fn memo(&self, sent: &BundleRef, seconds: u32) -> EngineResult<()> {
        if self.node.fail_once(Fault::Memo) {
            return Err(ReturnCode::Io);
        }
        self.node.bp().memos.insert(sent.id, seconds);
        Ok(())
    }

    fn release_sent(&self, sent: BundleRef) {
        let object = self.node.bp().detained.remove(&sent.id);
        if let Some(object) = object {
            self.node.store.release(object);
        }
    }

    fn receive(&self, sap: &BpSap) -> EngineResult<Reception<ObjectId, BundleMeta>> {
        if self.node.fail_once(Fault::Receive) {
            return Err(ReturnCode::Interrupted);
        }
        let mut state = self.node.bp();
        loop {
            let ep = match state.endpoints.get_mut(&sap.eid) {
                Some(ep) if ep.bound == Some(sap.id) => ep,
                _ => return Ok(Reception::Stopped),
            };
            if ep.wake {
                ep.wake = false;
                return Ok(Reception::Interrupted);
            }
            if ep.stopped {
                return Ok(Reception::Stopped);
            }
            if let Some(bundle) = ep.queue.pop_front() {
                return Ok(Reception::Delivered {
                    object: bundle.object,
                    meta: bundle.meta,
                });
            }
            state = self
                .node
                .bp_cv
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn object_len(&self, object: &ObjectId) -> EngineResult<usize> {
        self.node.store.len(*object)
    }

    fn read_object(&self, object: &ObjectId, buf: &mut [u8]) -> EngineResult<usize> {
        self.node.read(object, buf)
    }

    fn release_object(&self, object: ObjectId) {
        self.node.store.release(object)
    }
}

/// LTP access points of a loopback node. Blocks sent to the node's own engine number are
/// delivered to the client with the same id.
pub struct LoopbackLtp {
    node: Arc<Node>,
}

#[derive(Debug)]
pub struct LtpSap {
    client: ClientId,
}

impl LoopbackLtp {
    fn next_session(&self, state: &mut LtpState) -> LtpSessionId {
        state.next_session += 1;
        LtpSessionId {
            originator: self.node.ltp_engine,
            number: state.next_session,
        }
    }
}

impl Engine for LoopbackLtp {
    type Address = ClientId;
    type Destination = EngineId;
    type Sap = LtpSap;
    type Options = LtpSendOptions;
    type Object = ObjectId;
    type Sent = LtpSessionId;
    type Meta = BlockMeta;

    const FAMILY: Family = Family::Ltp;

    fn attach(&self) -> EngineResult<()> {
        self.node.attach(Self::FAMILY)
    }

    fn detach(&self) {
        self.node.detach(Self::FAMILY)
    }

    fn open(&self, client: &ClientId, _detained: bool) -> EngineResult<LtpSap> {
        if self.node.fail_once(Fault::Open) {
            return Err(ReturnCode::Io);
        }
        let mut state = self.node.ltp();
        let slot = state.clients.entry(client.0).or_default();
        if slot.open {
            return Err(ReturnCode::Io);
        }
        slot.open = true;
        slot.wake = false;
        drop(state);
        self.node.count(|c| c.opens += 1);
        Ok(LtpSap { client: *client })
    }

    fn close(&self, sap: &LtpSap) {
        let dropped: Vec<ObjectId> = match self.node.ltp().clients.get_mut(&sap.client.0) {
            Some(slot) => {
                slot.open = false;
                slot.wake = false;
                slot.notices
                    .drain(..)
                    .filter_map(|n| match n {
                        LtpNotice::RecvGreenSegment { data, .. } | LtpNotice::RecvRedPart { data, .. } => Some(data),
                        _ => None,
                    })
                    .collect()
            }
            None => Vec::new(),
        };
        for object in dropped {
            self.node.store.release(object);
        }
        self.node.count(|c| c.closes += 1);
        self.node.ltp_cv.notify_all();
    }

    fn interrupt(&self, sap: &LtpSap) {
        if let Some(slot) = self.node.ltp().clients.get_mut(&sap.client.0) {
            slot.wake = true;
        }
        self.node.count(|c| c.interrupts += 1);
        self.node.ltp_cv.notify_all();
    }

    fn start_attendant(&self) -> EngineResult<Attendant> {
        self.node.start_attendant()
    }

    fn insert(&self, data: &[u8]) -> EngineResult<StoreRef> {
        self.node.insert(data)
    }

    fn create_object(
        &self,
        stored: StoreRef,
        _len: usize,
        _options: &LtpSendOptions,
        attendant: Option<&Attendant>,
    ) -> EngineResult<ObjectId> {
        self.node.create_object(stored, attendant)
    }

    fn send(&self, sap: &LtpSap, dest: &EngineId, _options: &LtpSendOptions, object: ObjectId) -> EngineResult<LtpSessionId> {
        if self.node.fail_once(Fault::Transmit) || *dest != self.node.ltp_engine {
            self.node.store.release(object);
            return Err(ReturnCode::Io);
        }
        let mut state = self.node.ltp();
        let session = self.next_session(&mut state);
        let slot = state.clients.entry(sap.client.0).or_default();
        slot.notices.push_back(LtpNotice::ExportSessionComplete { session });
        slot.notices.push_back(LtpNotice::RecvRedPart {
            session,
            client: sap.client,
            data: object,
            end_of_block: true,
        });
        drop(state);
        self.node.ltp_cv.notify_all();
        Ok(session)
    }

    fn receive(&self, sap: &LtpSap) -> EngineResult<Reception<ObjectId, BlockMeta>> {
        let mut state = self.node.ltp();
        loop {
            let slot = match state.clients.get_mut(&sap.client.0) {
                Some(slot) => slot,
                None => return Ok(Reception::Stopped),
            };
            if slot.wake {
                slot.wake = false;
                return Ok(Reception::Interrupted);
            }
            if !slot.open {
                return Ok(Reception::Stopped);
            }
            while let Some(notice) = slot.notices.pop_front() {
                if let Some(reception) = ltp::classify(notice) {
                    return Ok(reception);
                }
            }
            state = self
                .node
                .ltp_cv
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn object_len(&self, object: &ObjectId) -> EngineResult<usize> {
        self.node.store.len(*object)
    }

    fn read_object(&self, object: &ObjectId, buf: &mut [u8]) -> EngineResult<usize> {
        self.node.read(object, buf)
    }

    fn release_object(&self, object: ObjectId) {
        self.node.store.release(object)
    }
}

/// CFDP side of a loopback node. Transfers to the node itself copy the file segment by segment.
pub struct LoopbackCfdp {
    node: Arc<Node>,
}

impl LoopbackCfdp {
    fn begin(&self, request: &PutRequest) -> EngineResult<TransactionId> {
        if self.node.fail_once(Fault::Put) {
            return Err(ReturnCode::Io);
        }
        let mut state = self.node.cfdp();
        let tx = TransactionId {
            source_entity: self.node.number,
            number: state.next_tx,
        };
        state.next_tx += 1;
        let mut event = CfdpEvent::new(CfdpEventKind::Transaction, Some(tx));
        event.source_file = request.source_file.clone();
        event.dest_file = request.dest_file.clone();
        state.events.push_back(event);

        if request.destination_entity != self.node.number {
            let mut fault = CfdpEvent::new(CfdpEventKind::Fault, Some(tx));
            fault.condition = Condition::InactivityDetected;
            state.events.push_back(fault);
            Self::abandon(&mut state, tx, Condition::InactivityDetected);
        } else if state.hold {
            state.active.insert(
                tx,
                Transfer {
                    request: request.clone(),
                    suspended: false,
                },
            );
        } else {
            self.execute(&mut state, tx, request);
        }
        drop(state);
        self.node.cfdp_cv.notify_all();
        Ok(tx)
    }

    fn execute(&self, state: &mut CfdpState, tx: TransactionId, request: &PutRequest) {
        let Some(source) = request.source_file.as_deref() else {
            Self::abandon(state, tx, Condition::FilestoreRejection);
            return;
        };
        let data = match fs::read(source) {
            Ok(data) => data,
            Err(e) => {
                debug!("transaction {tx}: cannot read {}: {e}", source.display());
                Self::abandon(state, tx, Condition::FilestoreRejection);
                return;
            }
        };
        let dest = request.dest_file.clone().unwrap_or_else(|| source.to_path_buf());
        let file_size = data.len() as u64;

        let mut meta = CfdpEvent::new(CfdpEventKind::MetadataReceived, Some(tx));
        meta.source_file = Some(source.to_path_buf());
        meta.dest_file = Some(dest.clone());
        meta.file_size = file_size;
        meta.messages_to_user = request.messages_to_user.clone();
        state.events.push_back(meta);

        let segment = state.segment_size.max(1) as usize;
        let mut offset = 0u64;
        for chunk in data.chunks(segment) {
            let mut ev = CfdpEvent::new(CfdpEventKind::FileSegmentReceived, Some(tx));
            ev.offset = offset;
            ev.length = chunk.len() as u32;
            state.events.push_back(ev);
            offset += chunk.len() as u64;
        }

        let mut eof = CfdpEvent::new(CfdpEventKind::EofSent, Some(tx));
        eof.file_size = file_size;
        state.events.push_back(eof.clone());
        eof.kind = CfdpEventKind::EofReceived;
        state.events.push_back(eof);

        if !same_file(source, &dest) {
            if let Err(e) = write_file(&dest, &data) {
                debug!("transaction {tx}: cannot write {}: {e}", dest.display());
                Self::abandon(state, tx, Condition::FilestoreRejection);
                return;
            }
        }

        let mut done = CfdpEvent::new(CfdpEventKind::TransactionFinished, Some(tx));
        done.file_status = FileStatus::Retained;
        done.delivery_code = DeliveryCode::Complete;
        done.progress = file_size;
        done.filestore_responses = request.filestore_requests.iter().map(apply_filestore).collect();
        state.events.push_back(done);
        state.finished.insert(tx);
    }

    fn abandon(state: &mut CfdpState, tx: TransactionId, condition: Condition) {
        let mut ev = CfdpEvent::new(CfdpEventKind::Abandoned, Some(tx));
        ev.condition = condition;
        state.events.push_back(ev);
        state.finished.insert(tx);
    }
}

impl CfdpEngine for LoopbackCfdp {
    fn attach(&self) -> EngineResult<()> {
        self.node.attach(Family::Cfdp)
    }

    fn detach(&self) {
        self.node.detach(Family::Cfdp)
    }

    fn put(&self, request: &PutRequest) -> EngineResult<TransactionId> {
        self.begin(request)
    }

    fn get(&self, request: &PutRequest) -> EngineResult<TransactionId> {
        self.begin(request)
    }

    fn cancel(&self, tx: &TransactionId) -> EngineResult<()> {
        let mut state = self.node.cfdp();
        state.active.remove(tx).ok_or(ReturnCode::Io)?;
        let mut ev = CfdpEvent::new(CfdpEventKind::TransactionFinished, Some(*tx));
        ev.condition = Condition::CancelRequested;
        ev.file_status = FileStatus::Discarded;
        state.events.push_back(ev);
        state.finished.insert(*tx);
        drop(state);
        self.node.cfdp_cv.notify_all();
        Ok(())
    }

    fn suspend(&self, tx: &TransactionId) -> EngineResult<()> {
        let mut state = self.node.cfdp();
        state.active.get_mut(tx).ok_or(ReturnCode::Io)?.suspended = true;
        let mut ev = CfdpEvent::new(CfdpEventKind::Suspended, Some(*tx));
        ev.condition = Condition::SuspendRequested;
        state.events.push_back(ev);
        drop(state);
        self.node.cfdp_cv.notify_all();
        Ok(())
    }

    fn resume(&self, tx: &TransactionId) -> EngineResult<()> {
        let mut state = self.node.cfdp();
        state.active.get_mut(tx).ok_or(ReturnCode::Io)?.suspended = false;
        state
            .events
            .push_back(CfdpEvent::new(CfdpEventKind::Resumed, Some(*tx)));
        if !state.hold {
            if let Some(transfer) = state.active.remove(tx) {
                self.execute(&mut state, *tx, &transfer.request);
            }
        }
        drop(state);
        self.node.cfdp_cv.notify_all();
        Ok(())
    }

    fn report(&self, tx: &TransactionId) -> EngineResult<()> {
        let mut state = self.node.cfdp();
        let status = match state.active.get(tx) {
            Some(t) if t.suspended => "suspended",
            Some(_) => "active",
            None if state.finished.contains(tx) => "finished",
            None => return Err(ReturnCode::Io),
        };
        let mut ev = CfdpEvent::new(CfdpEventKind::Report, Some(*tx));
        ev.status_report = Some(format!("transaction {tx} {status}"));
        state.events.push_back(ev);
        drop(state);
        self.node.cfdp_cv.notify_all();
        Ok(())
    }

    fn next_event(&self) -> EngineResult<CfdpEvent> {
        let mut state = self.node.cfdp();
        let epoch = state.epoch;
        loop {
            if state.epoch != epoch {
                return Ok(CfdpEvent::new(CfdpEventKind::NoEvent, None));
            }
            if let Some(event) = state.events.pop_front() {
                return Ok(event);
            }
            let (guard, timeout) = self
                .node
                .cfdp_cv
                .wait_timeout(state, EVENT_POLL)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = guard;
            if timeout.timed_out() && state.events.is_empty() {
                return Ok(CfdpEvent::new(CfdpEventKind::NoEvent, None));
            }
        }
    }

    fn interrupt_events(&self) {
        self.node.cfdp().epoch += 1;
        self.node.cfdp_cv.notify_all();
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn write_file(dest: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(dest, data)
}

fn apply_filestore(request: &FilestoreRequest) -> FilestoreResponse {
    let first = &request.first;
    let second = request.second.as_deref();
    let result: std::io::Result<()> = match (request.action, second) {
        (FilestoreAction::CreateFile, _) => fs::File::create(first).map(|_| ()),
        (FilestoreAction::DeleteFile, _) => fs::remove_file(first),
        (FilestoreAction::RenameFile, Some(to)) => fs::rename(first, to),
        (FilestoreAction::AppendFile, Some(from)) => fs::read(from).and_then(|data| {
            fs::OpenOptions::new()
                .append(true)
                .open(first)
                .and_then(|mut f| f.write_all(&data))
        }),
        (FilestoreAction::ReplaceFile, Some(from)) => fs::copy(from, first).map(|_| ()),
        (FilestoreAction::CreateDirectory, _) => fs::create_dir(first),
        (FilestoreAction::RemoveDirectory, _) => fs::remove_dir(first),
        (FilestoreAction::DenyFile, _) => remove_if_present(first, |p| fs::remove_file(p)),
        (FilestoreAction::DenyDirectory, _) => remove_if_present(first, |p| fs::remove_dir(p)),
        (_, None) => {
            return FilestoreResponse {
                action: request.action,
                status: FilestoreStatus::NotPerformed,
                first: first.clone(),
                second: None,
                message: Some("second file name missing".into()),
            }
        }
    };
    FilestoreResponse {
        action: request.action,
        status: if result.is_ok() {
            FilestoreStatus::Successful
        } else {
            FilestoreStatus::Failed
        },
        first: first.clone(),
        second: request.second.clone(),
        message: result.err().map(|e| e.to_string()),
    }
}

fn remove_if_present(path: &Path, remove: impl Fn(&Path) -> std::io::Result<()>) -> std::io::Result<()> {
    if path.exists() {
        remove(path)
    } else {
        Ok(())
    }
}

impl AdminDatabase for LoopbackNode {
    fn add_endpoint(&self, eid: &Eid, discard: bool) -> EngineResult<()> {
        self.node.bp().endpoints.entry(eid.clone()).or_default().discard = discard;
        Ok(())
    }

    fn endpoint_exists(&self, eid: &Eid) -> bool {
        self.node.bp().endpoints.contains_key(eid)
    }

    fn list_endpoints(&self) -> Vec<Eid> {
        self.node.bp().endpoints.keys().cloned().collect()
    }

    fn add_contact(&self, contact: &Contact) -> EngineResult<()> {
        let mut admin = lock(&self.node.admin);
        let duplicate = admin.contacts.iter().any(|c| {
            c.region == contact.region
                && c.from_node == contact.from_node
                && c.to_node == contact.to_node
                && c.start == contact.start
        });
        if duplicate {
            return Err(ReturnCode::Io);
        }
        admin.contacts.push(contact.clone());
        Ok(())
    }

    fn list_contacts(&self) -> Vec<Contact> {
        lock(&self.node.admin).contacts.clone()
    }

    fn delete_contact(&self, region: Region, from: u64, to: u64, start: Option<OffsetDateTime>) -> EngineResult<usize> {
        let mut admin = lock(&self.node.admin);
        let before = admin.contacts.len();
        admin.contacts.retain(|c| {
            !(c.region == region
                && c.from_node == from
                && c.to_node == to
                && start.map_or(true, |s| c.start == s))
        });
        Ok(before - admin.contacts.len())
    }

    fn add_range(&self, range: &Range) -> EngineResult<()> {
        let mut admin = lock(&self.node.admin);
        let duplicate = admin
            .ranges
            .iter()
            .any(|r| r.from_node == range.from_node && r.to_node == range.to_node && r.start == range.start);
        if duplicate {
            return Err(ReturnCode::Io);
        }
        admin.ranges.push(range.clone());
        Ok(())
    }

    fn list_ranges(&self) -> Vec<Range> {
        lock(&self.node.admin).ranges.clone()
    }

    fn delete_range(&self, from: u64, to: u64, start: Option<OffsetDateTime>) -> EngineResult<usize> {
        let mut admin = lock(&self.node.admin);
        let before = admin.ranges.len();
        admin
            .ranges
            .retain(|r| !(r.from_node == from && r.to_node == to && start.map_or(true, |s| r.start == s)));
        Ok(before - admin.ranges.len())
    }

    fn list_regions(&self) -> Vec<Region> {
        let admin = lock(&self.node.admin);
        let mut regions = vec![Region::Home];
        if admin.contacts.iter().any(|c| c.region == Region::Outer) {
            regions.push(Region::Outer);
        }
        regions
    }

    fn ltp_span_exists(&self, engine: EngineId) -> bool {
        lock(&self.node.admin).spans.contains_key(&engine.0)
    }

    fn list_ltp_spans(&self) -> Vec<LtpSpan> {
        lock(&self.node.admin).spans.values().cloned().collect()
    }

    fn update_ltp_span(&self, span: &LtpSpan) -> EngineResult<()> {
        let mut admin = lock(&self.node.admin);
        let existing = admin.spans.get_mut(&span.engine.0).ok_or(ReturnCode::Io)?;
        *existing = span.clone();
        Ok(())
    }

    fn set_bp_watch(&self, on: bool) -> EngineResult<()> {
        lock(&self.node.admin).watching = on;
        debug!("bundle watch {}", if on { "on" } else { "off" });
        Ok(())
    }

    fn set_cfdp_segment_size(&self, bytes: u32) -> EngineResult<()> {
        self.node.cfdp().segment_size = bytes;
        Ok(())
    }
}
