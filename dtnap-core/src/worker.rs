//! Async adapter: runs blocking access-point calls on tokio's blocking pool.
//! Cancellation is delivered through `interrupt`; blocking threads are never abandoned mid-call.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};

use crate::access::{AccessPoint, OpenOptions, Received};
use crate::engine::Engine;
use crate::error::{Error, Result};

// Re-signal period while waiting for an interrupted receive to come back.
const INTERRUPT_RETRY: Duration = Duration::from_millis(50);

type ReceiveTask<M> = JoinHandle<Result<Received<M>>>;

// Phases of a receive handed to the blocking pool.
const PENDING: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;
const DONE: u8 = 3;

/// Owns a blocking receive. If dropped before the receive returned, the receive is cancelled:
/// it never starts if it has not yet, otherwise it is interrupted until it comes back.
struct CancelOnDrop<E: Engine> {
    ap: Arc<AccessPoint<E>>,
    phase: Arc<AtomicU8>,
    task: Option<ReceiveTask<E::Meta>>,
}

impl<E: Engine> CancelOnDrop<E> {
    fn spawn(ap: Arc<AccessPoint<E>>) -> Self {
        let phase = Arc::new(AtomicU8::new(PENDING));
        let task = {
            let (ap, phase) = (ap.clone(), phase.clone());
            tokio::task::spawn_blocking(move || {
                if phase
                    .compare_exchange(PENDING, STARTED, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Err(Error::Interrupted {
                        endpoint: ap.address().to_string(),
                    });
                }
                let received = ap.receive();
                phase.store(DONE, Ordering::SeqCst);
                received
            })
        };
        Self {
            ap,
            phase,
            task: Some(task),
        }
    }

    async fn join(mut self) -> Result<Received<E::Meta>> {
        let Some(task) = self.task.as_mut() else {
            return Err(Error::Worker("receive already joined".into()));
        };
        let joined = task.await;
        self.task = None;
        joined.map_err(worker_error)?
    }
}

impl<E: Engine> Drop for CancelOnDrop<E> {
    fn drop(&mut self) {
        let Some(mut task) = self.task.take() else {
            return;
        };
        if self
            .phase
            .compare_exchange(PENDING, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            debug!("receive future dropped before the receive started");
            return;
        }
        debug!("receive future dropped; interrupting");
        let (ap, phase) = (self.ap.clone(), self.phase.clone());
        let Ok(rt) = Handle::try_current() else {
            ap.interrupt();
            return;
        };
        rt.spawn(async move {
            loop {
                if phase.load(Ordering::SeqCst) == STARTED {
                    ap.interrupt();
                }
                match tokio::time::timeout(INTERRUPT_RETRY, &mut task).await {
                    Ok(Ok(Ok(received))) => {
                        warn!(
                            "{}: {} bytes arrived after the receiver gave up and were dropped",
                            ap.address(),
                            received.payload.len()
                        );
                        return;
                    }
                    Ok(_) => return,
                    Err(_) => {}
                }
            }
        });
    }
}

// The blocking call may not have entered RUNNING yet; keep signalling until it returns.
async fn interrupt_until_joined<E: Engine>(
    ap: &AccessPoint<E>,
    mut task: ReceiveTask<E::Meta>,
) -> std::result::Result<Result<Received<E::Meta>>, JoinError> {
    loop {
        ap.interrupt();
        if let Ok(joined) = tokio::time::timeout(INTERRUPT_RETRY, &mut task).await {
            return joined;
        }
    }
}

/// Open an access point without blocking the runtime (starting an admission gate may wait on the engine).
pub async fn open<E: Engine>(
    engine: Arc<E>,
    address: E::Address,
    options: OpenOptions,
) -> Result<Arc<AccessPoint<E>>> {
    tokio::task::spawn_blocking(move || AccessPoint::open(engine, address, options).map(Arc::new))
        .await
        .map_err(worker_error)?
}

/// Receive one message without blocking the runtime.
/// Dropping the future cancels the receive; a message is never taken by a receive nobody awaits
/// unless it arrived before the cancellation reached the engine.
pub async fn receive<E: Engine>(ap: Arc<AccessPoint<E>>) -> Result<Received<E::Meta>> {
    CancelOnDrop::spawn(ap).join().await
}

/// Receive with a host-side deadline: on expiry the receive is interrupted and awaited.
/// `Ok(None)` means nothing arrived in time; the access point is idle again.
pub async fn receive_within<E: Engine>(
    ap: Arc<AccessPoint<E>>,
    timeout: Duration,
) -> Result<Option<Received<E::Meta>>> {
    let mut task: ReceiveTask<E::Meta> = {
        let ap = ap.clone();
        tokio::task::spawn_blocking(move || ap.receive())
    };
    let joined = match tokio::time::timeout(timeout, &mut task).await {
        Ok(joined) => joined,
        Err(_) => interrupt_until_joined(&ap, task).await,
    };
    match joined.map_err(worker_error)? {
        Ok(received) => Ok(Some(received)),
        Err(Error::Interrupted { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Send one message without blocking the runtime.
pub async fn send<E: Engine>(
    ap: Arc<AccessPoint<E>>,
    destination: E::Destination,
    payload: Vec<u8>,
    options: E::Options,
) -> Result<()> {
    tokio::task::spawn_blocking(move || ap.send(&destination, &payload, &options))
        .await
        .map_err(worker_error)?
}

fn worker_error(e: JoinError) -> Error {
    Error::Worker(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::AdminDatabase;
    use crate::bp::{BpSendOptions, Eid};
    use crate::lifecycle::SapState;
    use crate::loopback::{LoopbackBp, LoopbackNode};

    fn open_pair() -> (LoopbackNode, Arc<AccessPoint<LoopbackBp>>, Arc<AccessPoint<LoopbackBp>>) {
        let node = LoopbackNode::new(1, 1 << 16);
        let (a, b) = (Eid::ipn(1, 1), Eid::ipn(1, 2));
        node.add_endpoint(&a, false).unwrap();
        node.add_endpoint(&b, false).unwrap();
        let ap_a = Arc::new(AccessPoint::open(node.bp(), a, OpenOptions::default()).unwrap());
        let ap_b = Arc::new(AccessPoint::open(node.bp(), b, OpenOptions::default()).unwrap());
        (node, ap_a, ap_b)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_send_and_receive() {
        let (_node, a, b) = open_pair();
        let rx = tokio::spawn(receive(b.clone()));
        send(a.clone(), Eid::ipn(1, 2), b"over the air".to_vec(), BpSendOptions::default())
            .await
            .unwrap();
        let got = rx.await.unwrap().unwrap();
        assert_eq!(&*got.payload, b"over the air");
        assert_eq!(got.meta.source, Eid::ipn(1, 1));
    }

    #[test]
    fn dropped_receive_leaves_later_message_queued() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let (node, a, b) = open_pair();
        rt.block_on(async {
            // Hold the only blocking thread so the receive is still queued when it is dropped.
            let (release, parked) = std::sync::mpsc::channel::<()>();
            let busy = tokio::task::spawn_blocking(move || {
                let _ = parked.recv();
            });
            let gave_up = tokio::time::timeout(Duration::from_millis(20), receive(b.clone())).await;
            assert!(gave_up.is_err());
            release.send(()).unwrap();
            busy.await.unwrap();

            a.send(&Eid::ipn(1, 2), b"important", &BpSendOptions::default())
                .unwrap();
            let got = receive_within(b.clone(), Duration::from_secs(5)).await.unwrap();
            assert_eq!(&*got.unwrap().payload, b"important");
        });
        assert_eq!(node.queued(&Eid::ipn(1, 2)), 0);
        assert_eq!(b.state(), SapState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_blocked_receive_is_interrupted() {
        let (node, _a, b) = open_pair();
        let pending = tokio::spawn(receive(b.clone()));
        while b.state() != SapState::Running {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        pending.abort();
        let _ = pending.await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while b.state() != SapState::Idle && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(b.state(), SapState::Idle);
        assert!(node.counters().interrupts >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_open_with_admission_control() {
        let node = LoopbackNode::new(1, 1 << 16);
        let eid = Eid::ipn(1, 5);
        node.add_endpoint(&eid, false).unwrap();
        let options = OpenOptions {
            detained: false,
            admission_control: true,
        };
        let ap = open(node.bp(), eid.clone(), options).await.unwrap();
        assert!(ap.has_admission_control());
        send(ap.clone(), eid, b"to self".to_vec(), BpSendOptions::default())
            .await
            .unwrap();
        assert_eq!(&*receive(ap.clone()).await.unwrap().payload, b"to self");

        let unknown = open(node.bp(), Eid::ipn(1, 6), OpenOptions::default()).await;
        assert!(matches!(unknown, Err(Error::Open { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deadline_interrupts_and_leaves_idle() {
        let (node, _a, b) = open_pair();
        let got = receive_within(b.clone(), Duration::from_millis(50)).await.unwrap();
        assert!(got.is_none());
        assert_eq!(b.state(), SapState::Idle);
        assert!(node.counters().interrupts >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deadline_returns_data_that_arrived() {
        let (_node, a, b) = open_pair();
        a.send(&Eid::ipn(1, 2), b"early", &BpSendOptions::default()).unwrap();
        let got = receive_within(b, Duration::from_secs(5)).await.unwrap();
        assert_eq!(&*got.unwrap().payload, b"early");
    }
}
