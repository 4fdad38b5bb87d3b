//! Access-point manager: one implementation of open/send/receive/interrupt/close for every
//! engine family. The thread inside `receive` is the only one that releases a handle which
//! had a receive in flight.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::buffer::RxBuffer;
use crate::engine::{Engine, Reception, SendOptions};
use crate::error::{Error, Result, ReturnCode, Step};
use crate::gate::Attendant;
use crate::lifecycle::{CloseAction, Lifecycle, SapState, Settled};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Keep sent messages until explicitly released (needed for custodial retransmission).
    pub detained: bool,
    /// Block sends on store pressure instead of failing.
    pub admission_control: bool,
}

/// One inbound message, owned by the caller.
#[derive(Debug)]
pub struct Received<M> {
    pub payload: RxBuffer,
    pub meta: M,
}

pub struct AccessPoint<E: Engine> {
    engine: Arc<E>,
    address: E::Address,
    name: String,
    sap: E::Sap,
    attendant: Option<Attendant>,
    detained: bool,
    lifecycle: Lifecycle,
}

impl<E: Engine> AccessPoint<E> {
    pub fn open(engine: Arc<E>, address: E::Address, options: OpenOptions) -> Result<Self> {
        let name = address.to_string();
        let sap = engine
            .open(&address, options.detained)
            .map_err(|code| Error::Open {
                family: E::FAMILY,
                endpoint: name.clone(),
                code,
            })?;
        let attendant = if options.admission_control {
            match engine.start_attendant() {
                Ok(a) => Some(a),
                Err(code) => {
                    engine.close(&sap);
                    return Err(Error::AdmissionGate {
                        endpoint: name,
                        code,
                    });
                }
            }
        } else {
            None
        };
        info!(
            "opened {} access point {} (detained={}, admission control={})",
            E::FAMILY,
            name,
            options.detained,
            attendant.is_some()
        );
        Ok(Self {
            engine,
            address,
            name,
            sap,
            attendant,
            detained: options.detained,
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn address(&self) -> &E::Address {
        &self.address
    }

    pub fn state(&self) -> SapState {
        self.lifecycle.state()
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.state(), SapState::Closing | SapState::Closed)
    }

    pub fn is_detained(&self) -> bool {
        self.detained
    }

    pub fn has_admission_control(&self) -> bool {
        self.attendant.is_some()
    }

    /// Admission gate of this access point, if it was opened with admission control.
    pub fn attendant(&self) -> Option<&Attendant> {
        self.attendant.as_ref()
    }

    /// Send one message. Does not change the lifecycle state.
    pub fn send(&self, destination: &E::Destination, payload: &[u8], options: &E::Options) -> Result<()> {
        if !self.is_open() {
            return Err(self.closed());
        }
        let timer = options.retransmission_timer();
        if timer.is_some() && !self.detained {
            return Err(Error::NotDetained {
                endpoint: self.name.clone(),
            });
        }

        let stored = self
            .engine
            .insert(payload)
            .map_err(|code| self.engine_error(Step::Insert, code))?;
        let object = self
            .engine
            .create_object(stored, payload.len(), options, self.attendant.as_ref())
            .map_err(|code| self.engine_error(Step::CreateObject, code))?;
        let sent = self
            .engine
            .send(&self.sap, destination, options, object)
            .map_err(|code| self.engine_error(Step::Transmit, code))?;

        let memo = match timer {
            Some(seconds) => self.engine.memo(&sent, seconds),
            None => Ok(()),
        };
        if self.detained {
            self.engine.release_sent(sent);
        }
        memo.map_err(|code| self.engine_error(Step::Memo, code))?;
        debug!("{}: sent {} bytes to {}", self.name, payload.len(), destination);
        Ok(())
    }

    /// Send `payload` as consecutive messages of at most `chunk_size` bytes (0 sends one message).
    pub fn send_chunked(
        &self,
        destination: &E::Destination,
        payload: &[u8],
        chunk_size: usize,
        options: &E::Options,
    ) -> Result<()> {
        if chunk_size == 0 || payload.len() <= chunk_size {
            return self.send(destination, payload, options);
        }
        for chunk in payload.chunks(chunk_size) {
            self.send(destination, chunk, options)?;
        }
        Ok(())
    }

    /// Blocking receive of one message. Only valid from IDLE.
    pub fn receive(&self) -> Result<Received<E::Meta>> {
        if let Err(state) = self.lifecycle.begin_receive() {
            return Err(match state {
                SapState::Closing | SapState::Closed => self.closed(),
                state => Error::InvalidState {
                    endpoint: self.name.clone(),
                    state,
                },
            });
        }
        debug!("{}: receive started", self.name);

        let outcome = match self.wait_for_reception() {
            Ok(reception) => self.take(reception),
            Err(code) => Err(self.engine_error(Step::Receive, code)),
        };

        match self.lifecycle.settle(|| self.release(), || self.resume_attendant()) {
            Settled::Completed => {
                if let Err(e) = &outcome {
                    debug!("{}: receive failed: {}", self.name, e);
                }
                outcome
            }
            Settled::Interrupted => {
                if outcome.is_ok() {
                    warn!("{}: message arrived during interrupt and was dropped", self.name);
                }
                debug!("{}: receive interrupted", self.name);
                Err(Error::Interrupted {
                    endpoint: self.name.clone(),
                })
            }
            Settled::Released => {
                info!("{}: closed by receiving thread", self.name);
                Err(Error::ConnectionAborted {
                    endpoint: self.name.clone(),
                })
            }
        }
    }

    /// Receive messages until at least `min_len` bytes have accumulated.
    pub fn receive_at_least(&self, min_len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(min_len);
        while out.len() < min_len {
            let received = self.receive()?;
            out.extend_from_slice(&received.payload);
        }
        Ok(out)
    }

    /// Wake a blocked receive. No-op unless one is running; never blocks.
    pub fn interrupt(&self) {
        let signalled = self.lifecycle.interrupt(|| {
            if let Some(attendant) = &self.attendant {
                attendant.pause();
            }
            self.engine.interrupt(&self.sap);
        });
        if signalled {
            debug!("{}: interrupt signalled", self.name);
        }
    }

    /// Close now, or hand the release to the thread blocked in `receive`.
    pub fn close(&self) {
        match self
            .lifecycle
            .close(|| self.engine.interrupt(&self.sap), || self.release())
        {
            CloseAction::Released => info!("closed {} access point {}", E::FAMILY, self.name),
            CloseAction::Deferred => debug!("{}: close deferred to receiving thread", self.name),
            CloseAction::Nothing => {}
        }
    }

    // Retry engine wake-ups nobody asked for. An interrupted-call failure nobody asked for is a
    // reception failure, not an interruption.
    fn wait_for_reception(&self) -> std::result::Result<Reception<E::Object, E::Meta>, ReturnCode> {
        loop {
            match self.engine.receive(&self.sap) {
                Ok(Reception::Interrupted) if self.lifecycle.is_running() => {
                    debug!("{}: spurious wake-up, receiving again", self.name);
                }
                Err(ReturnCode::Interrupted) if self.lifecycle.is_running() => {
                    warn!("{}: engine receive failed while running", self.name);
                    return Err(ReturnCode::Io);
                }
                other => return other,
            }
        }
    }

    fn take(&self, reception: Reception<E::Object, E::Meta>) -> Result<Received<E::Meta>> {
        match reception {
            Reception::Delivered { object, meta } => {
                let copied = self.copy_out(&object);
                self.engine.release_object(object);
                copied.map(|payload| Received { payload, meta })
            }
            Reception::Interrupted => Err(Error::Interrupted {
                endpoint: self.name.clone(),
            }),
            Reception::Stopped => Err(Error::ConnectionAborted {
                endpoint: self.name.clone(),
            }),
            Reception::TimedOut => Err(self.engine_error(Step::Receive, ReturnCode::Io)),
            Reception::Cancelled { direction, reason } => Err(Error::SessionCancelled {
                endpoint: self.name.clone(),
                direction,
                reason,
            }),
            Reception::Unsupported { what, object } => {
                if let Some(object) = object {
                    self.engine.release_object(object);
                }
                Err(Error::NotImplemented {
                    endpoint: self.name.clone(),
                    what,
                })
            }
        }
    }

    fn copy_out(&self, object: &E::Object) -> Result<RxBuffer> {
        let len = self
            .engine
            .object_len(object)
            .map_err(|code| self.engine_error(Step::Receive, code))?;
        let mut buf = RxBuffer::with_len(len);
        let read = self
            .engine
            .read_object(object, buf.as_mut_slice())
            .map_err(|code| self.engine_error(Step::Receive, code))?;
        if read < len {
            warn!("{}: short read ({} of {} bytes)", self.name, read, len);
            buf.truncate(read);
        }
        Ok(buf)
    }

    fn release(&self) {
        if let Some(attendant) = &self.attendant {
            attendant.stop();
        }
        self.engine.close(&self.sap);
    }

    fn resume_attendant(&self) {
        if let Some(attendant) = &self.attendant {
            attendant.resume();
        }
    }

    fn closed(&self) -> Error {
        Error::Closed {
            endpoint: self.name.clone(),
        }
    }

    fn engine_error(&self, step: Step, code: ReturnCode) -> Error {
        Error::from_engine(step, code, &self.name)
    }
}

impl<E: Engine> Drop for AccessPoint<E> {
    fn drop(&mut self) {
        // No borrow can outlive us, so nothing else can still be receiving.
        if self.lifecycle.abandon(|| self.release()) {
            debug!("{}: released on drop", self.name);
        }
    }
}

impl<E: Engine> std::fmt::Debug for AccessPoint<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessPoint")
            .field("family", &E::FAMILY)
            .field("address", &self.name)
            .field("state", &self.state())
            .field("detained", &self.detained)
            .finish()
    }
}
