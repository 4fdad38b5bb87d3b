//! CFDP file delivery: engine surface, event model and the `Entity` that watches a peer.
//!
//! An entity is the simpler lifecycle variant: an open flag and one monitor thread that
//! polls engine events until `close` interrupts the poll and joins it.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::bp::Priority;
use crate::error::{EngineResult, Error, Family, Result, ReturnCode};
use crate::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    pub source_entity: u64,
    pub number: u64,
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_entity, self.number)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CfdpMode {
    /// Reliability provided by the convergence layer.
    #[default]
    ClReliable,
    Unreliable,
    /// Reliability provided by bundle custody transfer.
    BpReliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilestoreAction {
    CreateFile,
    DeleteFile,
    RenameFile,
    AppendFile,
    ReplaceFile,
    CreateDirectory,
    RemoveDirectory,
    DenyFile,
    DenyDirectory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilestoreRequest {
    pub action: FilestoreAction,
    pub first: PathBuf,
    pub second: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilestoreStatus {
    Successful,
    NotPerformed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilestoreResponse {
    pub action: FilestoreAction,
    pub status: FilestoreStatus,
    pub first: PathBuf,
    pub second: Option<PathBuf>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CfdpEventKind {
    NoEvent,
    Transaction,
    EofSent,
    TransactionFinished,
    MetadataReceived,
    FileSegmentReceived,
    EofReceived,
    Suspended,
    Resumed,
    Report,
    Fault,
    Abandoned,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    #[default]
    NoError,
    AckLimitReached,
    KeepAliveLimitReached,
    InvalidTransmissionMode,
    FilestoreRejection,
    ChecksumFailure,
    FileSizeError,
    NakLimitReached,
    InactivityDetected,
    InvalidFileStructure,
    CheckLimitReached,
    SuspendRequested,
    CancelRequested,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Discarded,
    Rejected,
    Retained,
    #[default]
    Unreported,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryCode {
    Complete,
    #[default]
    Incomplete,
}

/// One indication from the engine. Fields not meaningful for `kind` keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CfdpEvent {
    pub kind: CfdpEventKind,
    pub transaction: Option<TransactionId>,
    pub source_file: Option<PathBuf>,
    pub dest_file: Option<PathBuf>,
    pub file_size: u64,
    pub offset: u64,
    pub length: u32,
    pub condition: Condition,
    pub file_status: FileStatus,
    pub delivery_code: DeliveryCode,
    pub progress: u64,
    pub status_report: Option<String>,
    pub messages_to_user: Vec<String>,
    pub filestore_responses: Vec<FilestoreResponse>,
}

impl CfdpEvent {
    pub fn new(kind: CfdpEventKind, transaction: Option<TransactionId>) -> Self {
        Self {
            kind,
            transaction,
            source_file: None,
            dest_file: None,
            file_size: 0,
            offset: 0,
            length: 0,
            condition: Condition::NoError,
            file_status: FileStatus::Unreported,
            delivery_code: DeliveryCode::Incomplete,
            progress: 0,
            status_report: None,
            messages_to_user: Vec::new(),
            filestore_responses: Vec::new(),
        }
    }
}

/// Transfer parameters of one put or get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    pub destination_entity: u64,
    pub source_file: Option<PathBuf>,
    pub dest_file: Option<PathBuf>,
    pub mode: CfdpMode,
    /// Seconds to wait for transaction closure; 0 means no closure.
    pub closure_latency: u32,
    /// Stamp every PDU with the current time.
    pub segment_metadata: bool,
    pub ttl: u32,
    pub class_of_service: Priority,
    pub ordinal: u8,
    pub critical: bool,
    pub messages_to_user: Vec<String>,
    pub filestore_requests: Vec<FilestoreRequest>,
}

pub trait CfdpEngine: Send + Sync + 'static {
    fn attach(&self) -> EngineResult<()>;
    fn detach(&self);

    fn put(&self, request: &PutRequest) -> EngineResult<TransactionId>;
    /// Ask the peer to send `request.source_file` here.
    fn get(&self, request: &PutRequest) -> EngineResult<TransactionId>;
    fn cancel(&self, transaction: &TransactionId) -> EngineResult<()>;
    fn suspend(&self, transaction: &TransactionId) -> EngineResult<()>;
    fn resume(&self, transaction: &TransactionId) -> EngineResult<()>;
    fn report(&self, transaction: &TransactionId) -> EngineResult<()>;

    /// Block for the next event; `CfdpEventKind::NoEvent` once interrupted.
    fn next_event(&self) -> EngineResult<CfdpEvent>;
    fn interrupt_events(&self);
}

/// Defaults applied to every request of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityOptions {
    pub mode: CfdpMode,
    pub closure_latency: u32,
    pub segment_metadata: bool,
    pub ttl: u32,
    pub class_of_service: Priority,
    pub ordinal: u8,
    pub critical: bool,
}

impl Default for EntityOptions {
    fn default() -> Self {
        Self {
            mode: CfdpMode::ClReliable,
            closure_latency: 0,
            segment_metadata: false,
            ttl: 86400,
            class_of_service: Priority::Standard,
            ordinal: 0,
            critical: false,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&CfdpEvent) + Send + Sync>;

#[derive(Default)]
struct Pending {
    messages: Vec<String>,
    filestore: Vec<FilestoreRequest>,
}

#[derive(Default)]
struct Outcomes {
    ended: HashMap<TransactionId, bool>,
    closed: bool,
}

struct Monitor {
    open: AtomicBool,
    handlers: Mutex<Vec<(Option<CfdpEventKind>, EventHandler)>>,
    outcomes: Mutex<Outcomes>,
    ended: Condvar,
}

impl Monitor {
    fn dispatch(&self, event: &CfdpEvent) {
        let handlers: Vec<EventHandler> = lock(&self.handlers)
            .iter()
            .filter(|(kind, _)| kind.map_or(true, |k| k == event.kind))
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }

        let ok = match event.kind {
            CfdpEventKind::TransactionFinished => event.condition == Condition::NoError,
            CfdpEventKind::Abandoned => false,
            _ => return,
        };
        if let Some(tx) = event.transaction {
            lock(&self.outcomes).ended.insert(tx, ok);
            self.ended.notify_all();
        }
    }

    fn run<E: CfdpEngine>(&self, engine: &E, peer: u64) {
        while self.open.load(Ordering::SeqCst) {
            match engine.next_event() {
                Ok(event) if event.kind == CfdpEventKind::NoEvent => continue,
                Ok(event) => {
                    debug!("cfdp entity {peer}: {:?} {:?}", event.kind, event.transaction);
                    self.dispatch(&event);
                }
                Err(code) => {
                    warn!("cfdp entity {peer}: event polling failed (code {code}); monitor stops");
                    break;
                }
            }
        }
    }
}

/// File-delivery access to one peer entity.
pub struct Entity<E: CfdpEngine> {
    engine: Arc<E>,
    peer: u64,
    options: EntityOptions,
    pending: Mutex<Pending>,
    current: Mutex<Option<TransactionId>>,
    monitor: Arc<Monitor>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl<E: CfdpEngine> Entity<E> {
    /// Open access to `peer` and start the event monitor. The engine must already be attached.
    pub fn open(engine: Arc<E>, peer: u64, options: EntityOptions) -> Result<Self> {
        let monitor = Arc::new(Monitor {
            open: AtomicBool::new(true),
            handlers: Mutex::new(Vec::new()),
            outcomes: Mutex::new(Outcomes::default()),
            ended: Condvar::new(),
        });
        let handle = {
            let (engine, monitor) = (engine.clone(), monitor.clone());
            thread::Builder::new()
                .name(format!("cfdp-events-{peer}"))
                .spawn(move || monitor.run(&*engine, peer))?
        };
        info!("opened CFDP entity for peer {peer}");
        Ok(Self {
            engine,
            peer,
            options,
            pending: Mutex::new(Pending::default()),
            current: Mutex::new(None),
            monitor,
            thread_id: handle.thread().id(),
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn peer(&self) -> u64 {
        self.peer
    }

    pub fn is_open(&self) -> bool {
        self.monitor.open.load(Ordering::SeqCst)
    }

    pub fn current_transaction(&self) -> Option<TransactionId> {
        *lock(&self.current)
    }

    /// Send a local file to the peer. `dest` defaults to the source path as given.
    pub fn send(&self, source: impl AsRef<Path>, dest: Option<&Path>) -> Result<TransactionId> {
        self.send_with(source, dest, &self.options)
    }

    pub fn send_with(
        &self,
        source: impl AsRef<Path>,
        dest: Option<&Path>,
        options: &EntityOptions,
    ) -> Result<TransactionId> {
        let source = source.as_ref();
        if !source.exists() {
            return Err(Error::FileNotFound(source.to_path_buf()));
        }
        let dest = dest.unwrap_or(source).to_path_buf();
        let absolute = source.canonicalize()?;
        let request = self.request_for(Some(absolute), Some(dest), options)?;
        let tx = self.engine.put(&request).map_err(engine_error)?;
        info!("cfdp entity {}: put {} as transaction {tx}", self.peer, source.display());
        Ok(self.start(tx))
    }

    /// Ask the peer to send its `source` here as `dest` (defaults to `source`).
    pub fn request(&self, source: impl AsRef<Path>, dest: Option<&Path>) -> Result<TransactionId> {
        let source = source.as_ref().to_path_buf();
        let dest = dest.map(Path::to_path_buf).unwrap_or_else(|| source.clone());
        let options = self.options.clone();
        let request = self.request_for(Some(source), Some(dest), &options)?;
        let tx = self.engine.get(&request).map_err(engine_error)?;
        info!("cfdp entity {}: get as transaction {tx}", self.peer);
        Ok(self.start(tx))
    }

    pub fn cancel(&self) -> Result<()> {
        let tx = self.active()?;
        self.engine.cancel(&tx).map_err(engine_error)
    }

    pub fn suspend(&self) -> Result<()> {
        let tx = self.active()?;
        self.engine.suspend(&tx).map_err(engine_error)
    }

    pub fn resume(&self) -> Result<()> {
        let tx = self.active()?;
        self.engine.resume(&tx).map_err(engine_error)
    }

    /// Ask for a progress report; it arrives as a `Report` event.
    pub fn report(&self) -> Result<()> {
        let tx = self.active()?;
        self.engine.report(&tx).map_err(engine_error)
    }

    /// Attach a message to the next request.
    pub fn add_user_message(&self, message: impl Into<String>) -> Result<()> {
        self.check_open()?;
        lock(&self.pending).messages.push(message.into());
        Ok(())
    }

    /// Attach a filestore request to the next request.
    pub fn add_filestore_request(
        &self,
        action: FilestoreAction,
        first: impl Into<PathBuf>,
        second: Option<PathBuf>,
    ) -> Result<()> {
        self.check_open()?;
        lock(&self.pending).filestore.push(FilestoreRequest {
            action,
            first: first.into(),
            second,
        });
        Ok(())
    }

    pub fn on(&self, kind: CfdpEventKind, handler: impl Fn(&CfdpEvent) + Send + Sync + 'static) {
        lock(&self.monitor.handlers).push((Some(kind), Arc::new(handler)));
    }

    /// Handler called for every event, after the per-kind handlers.
    pub fn on_all(&self, handler: impl Fn(&CfdpEvent) + Send + Sync + 'static) {
        lock(&self.monitor.handlers).push((None, Arc::new(handler)));
    }

    /// Wait for the current transaction to end. `Some(true)` when it finished without error,
    /// `Some(false)` when it failed or the entity closed, `None` on timeout.
    pub fn wait_for_transaction_end(&self, timeout: Option<Duration>) -> Result<Option<bool>> {
        let tx = self.current_transaction().ok_or(Error::NoTransaction { entity: self.peer })?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut outcomes = lock(&self.monitor.outcomes);
        loop {
            if let Some(ok) = outcomes.ended.get(&tx) {
                return Ok(Some(*ok));
            }
            if outcomes.closed {
                return Ok(Some(false));
            }
            outcomes = match deadline {
                None => self
                    .monitor
                    .ended
                    .wait(outcomes)
                    .unwrap_or_else(std::sync::PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.monitor
                        .ended
                        .wait_timeout(outcomes, deadline - now)
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Stop the monitor and wake every waiter. Idempotent.
    pub fn close(&self) {
        if !self.monitor.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.engine.interrupt_events();
        // A handler may close its own entity; the monitor cannot join itself.
        if thread::current().id() != self.thread_id {
            if let Some(handle) = lock(&self.thread).take() {
                if handle.join().is_err() {
                    warn!("cfdp entity {}: event handler panicked", self.peer);
                }
            }
        }
        lock(&self.monitor.outcomes).closed = true;
        self.monitor.ended.notify_all();
        info!("closed CFDP entity for peer {}", self.peer);
    }

    fn request_for(
        &self,
        source: Option<PathBuf>,
        dest: Option<PathBuf>,
        options: &EntityOptions,
    ) -> Result<PutRequest> {
        self.check_open()?;
        let pending = std::mem::take(&mut *lock(&self.pending));
        Ok(PutRequest {
            destination_entity: self.peer,
            source_file: source,
            dest_file: dest,
            mode: options.mode,
            closure_latency: options.closure_latency,
            segment_metadata: options.segment_metadata,
            ttl: options.ttl,
            class_of_service: options.class_of_service,
            ordinal: options.ordinal,
            critical: options.critical,
            messages_to_user: pending.messages,
            filestore_requests: pending.filestore,
        })
    }

    fn start(&self, tx: TransactionId) -> TransactionId {
        *lock(&self.current) = Some(tx);
        tx
    }

    fn active(&self) -> Result<TransactionId> {
        self.check_open()?;
        self.current_transaction().ok_or(Error::NoTransaction { entity: self.peer })
    }

    fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::Closed {
                endpoint: format!("cfdp entity {}", self.peer),
            })
        }
    }
}

impl<E: CfdpEngine> Drop for Entity<E> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Attached CFDP engine and its open entities, one per peer.
pub struct CfdpProxy<E: CfdpEngine> {
    engine: Arc<E>,
    entities: Mutex<HashMap<u64, Arc<Entity<E>>>>,
}

impl<E: CfdpEngine> CfdpProxy<E> {
    pub fn attach(engine: Arc<E>) -> Result<Self> {
        engine.attach().map_err(|code| Error::Attach {
            family: Family::Cfdp,
            code,
        })?;
        Ok(Self {
            engine,
            entities: Mutex::new(HashMap::new()),
        })
    }

    /// Open an entity for `peer`, or return the one already open.
    pub fn open(&self, peer: u64, options: EntityOptions) -> Result<Arc<Entity<E>>> {
        let mut entities = lock(&self.entities);
        if let Some(existing) = entities.get(&peer) {
            if existing.is_open() {
                return Ok(existing.clone());
            }
        }
        let entity = Arc::new(Entity::open(self.engine.clone(), peer, options)?);
        entities.insert(peer, entity.clone());
        Ok(entity)
    }

    pub fn close(&self, peer: u64) -> Result<()> {
        let entity = lock(&self.entities).remove(&peer).ok_or(Error::Closed {
            endpoint: format!("cfdp entity {peer}"),
        })?;
        entity.close();
        Ok(())
    }

    pub fn close_all(&self) {
        let entities: Vec<_> = lock(&self.entities).drain().map(|(_, e)| e).collect();
        for entity in entities {
            entity.close();
        }
    }
}

impl<E: CfdpEngine> Drop for CfdpProxy<E> {
    fn drop(&mut self) {
        self.close_all();
        self.engine.detach();
    }
}

fn engine_error(code: ReturnCode) -> Error {
    Error::Engine {
        family: Family::Cfdp,
        code,
    }
}
