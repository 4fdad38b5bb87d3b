//! DTN access-point layer: lifecycle and interruption protocol for bundle, LTP and CFDP engines.
//! The engine is external; the host drives access points and the core decides when engine resources are released.

pub mod error;
pub mod engine;
pub mod gate;
pub mod buffer;
pub mod lifecycle;
pub mod access;
pub mod bp;
pub mod ltp;
pub mod cfdp;
pub mod proxy;
pub mod registry;
pub mod worker;
pub mod timestamp;
pub mod admin;

// In-process engine used by tests, the daemon and the C ABI.
pub mod store;
pub mod loopback;
pub mod ffi;

pub use access::{AccessPoint, OpenOptions, Received};
pub use bp::{BpSendOptions, BundleMeta, Eid};
pub use buffer::{RxBuffer, INLINE_CAPACITY};
pub use engine::{Engine, Reception, SendOptions, StoreRef};
pub use error::{EngineResult, Error, Family, Result, ReturnCode};
pub use gate::Attendant;
pub use lifecycle::SapState;
pub use loopback::LoopbackNode;
pub use proxy::Proxy;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a panicking thread poisoned it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
