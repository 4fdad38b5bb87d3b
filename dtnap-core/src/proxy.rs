//! Per-node, per-family proxy: attaches the engine and tracks the access points opened through it.

use std::collections::HashMap;
use std::ptr;
use std::sync::{Arc, Mutex};

use log::{debug, info};

use crate::access::{AccessPoint, OpenOptions};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::lock;

pub struct Proxy<E: Engine> {
    engine: Arc<E>,
    node: u64,
    endpoints: Mutex<HashMap<String, Arc<AccessPoint<E>>>>,
}

impl<E: Engine> Proxy<E> {
    /// Attach to the engine of `node`. Detaches again when dropped.
    pub fn attach(engine: Arc<E>, node: u64) -> Result<Self> {
        engine.attach().map_err(|code| Error::Attach {
            family: E::FAMILY,
            code,
        })?;
        info!("attached {} proxy for node {node}", E::FAMILY);
        Ok(Self {
            engine,
            node,
            endpoints: Mutex::new(HashMap::new()),
        })
    }

    pub fn node(&self) -> u64 {
        self.node
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    /// Open `address`, or return the access point already open for it.
    pub fn open(&self, address: E::Address, options: OpenOptions) -> Result<Arc<AccessPoint<E>>> {
        let key = address.to_string();
        let mut endpoints = lock(&self.endpoints);
        if let Some(existing) = endpoints.get(&key) {
            if existing.is_open() {
                return Ok(existing.clone());
            }
        }
        let ap = Arc::new(AccessPoint::open(self.engine.clone(), address, options)?);
        endpoints.insert(key, ap.clone());
        Ok(ap)
    }

    pub fn is_open(&self, address: &E::Address) -> bool {
        lock(&self.endpoints)
            .get(&address.to_string())
            .is_some_and(|ap| ap.is_open())
    }

    pub fn open_endpoints(&self) -> Vec<Arc<AccessPoint<E>>> {
        lock(&self.endpoints).values().cloned().collect()
    }

    /// Close and forget `ap`. Fails with `Closed` unless `ap` itself is tracked here; a stale
    /// access point never reaches the one that now holds its address.
    pub fn close(&self, ap: &AccessPoint<E>) -> Result<()> {
        let key = ap.address().to_string();
        let removed = {
            let mut endpoints = lock(&self.endpoints);
            let tracked = endpoints.get(&key).is_some_and(|t| ptr::eq(&**t, ap));
            if tracked {
                endpoints.remove(&key)
            } else {
                None
            }
        };
        match removed {
            Some(tracked) => {
                tracked.close();
                Ok(())
            }
            None => Err(Error::Closed { endpoint: key }),
        }
    }

    pub fn interrupt(&self, ap: &AccessPoint<E>) -> Result<()> {
        let key = ap.address().to_string();
        let tracked = lock(&self.endpoints)
            .get(&key)
            .filter(|tracked| ptr::eq(&***tracked, ap))
            .cloned();
        match tracked {
            Some(tracked) => {
                tracked.interrupt();
                Ok(())
            }
            None => Err(Error::Closed { endpoint: key }),
        }
    }

    pub fn interrupt_all(&self) {
        for ap in self.open_endpoints() {
            ap.interrupt();
        }
    }

    pub fn close_all(&self) {
        let all: Vec<_> = lock(&self.endpoints).drain().map(|(_, ap)| ap).collect();
        for ap in all {
            ap.close();
        }
    }

    /// Interrupt every blocked receive, then close everything.
    pub fn shutdown(&self) {
        debug!("{} proxy for node {}: shutting down", E::FAMILY, self.node);
        self.interrupt_all();
        self.close_all();
    }
}

impl<E: Engine> Drop for Proxy<E> {
    fn drop(&mut self) {
        self.close_all();
        self.engine.detach();
        info!("detached {} proxy for node {}", E::FAMILY, self.node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::AdminDatabase;
    use crate::bp::Eid;
    use crate::lifecycle::SapState;
    use crate::loopback::{Fault, LoopbackBp, LoopbackNode};

    fn setup() -> (LoopbackNode, Proxy<LoopbackBp>, Eid) {
        let node = LoopbackNode::new(1, 4096);
        let eid = Eid::ipn(1, 1);
        node.add_endpoint(&eid, false).unwrap();
        let proxy = Proxy::attach(node.bp(), 1).unwrap();
        (node, proxy, eid)
    }

    #[test]
    fn open_is_idempotent_per_address() {
        let (node, proxy, eid) = setup();
        let a = proxy.open(eid.clone(), OpenOptions::default()).unwrap();
        let b = proxy.open(eid.clone(), OpenOptions::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(node.counters().opens, 1);
        assert!(proxy.is_open(&eid));
    }

    #[test]
    fn close_forgets_and_rejects_second_close() {
        let (node, proxy, eid) = setup();
        let ap = proxy.open(eid.clone(), OpenOptions::default()).unwrap();
        proxy.close(&ap).unwrap();
        assert_eq!(ap.state(), SapState::Closed);
        assert!(matches!(proxy.close(&ap), Err(Error::Closed { .. })));
        assert!(matches!(proxy.interrupt(&ap), Err(Error::Closed { .. })));
        assert_eq!(node.counters().closes, 1);
        // Reopen after close creates a fresh access point.
        let again = proxy.open(eid, OpenOptions::default()).unwrap();
        assert!(!Arc::ptr_eq(&ap, &again));
    }

    #[test]
    fn stale_access_point_leaves_successor_alone() {
        let (node, proxy, eid) = setup();
        let old = proxy.open(eid.clone(), OpenOptions::default()).unwrap();
        old.close();
        let fresh = proxy.open(eid.clone(), OpenOptions::default()).unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));

        assert!(matches!(proxy.interrupt(&old), Err(Error::Closed { .. })));
        assert!(matches!(proxy.close(&old), Err(Error::Closed { .. })));
        assert_eq!(fresh.state(), SapState::Idle);
        assert!(proxy.is_open(&eid));
        assert_eq!(node.counters().closes, 1);

        proxy.close(&fresh).unwrap();
        assert_eq!(fresh.state(), SapState::Closed);
    }

    #[test]
    fn drop_closes_and_detaches() {
        let (node, proxy, eid) = setup();
        let ap = proxy.open(eid, OpenOptions::default()).unwrap();
        drop(proxy);
        assert_eq!(ap.state(), SapState::Closed);
        let c = node.counters();
        assert_eq!((c.attaches, c.detaches, c.closes), (1, 1, 1));
    }

    #[test]
    fn attach_failure_is_reported() {
        let node = LoopbackNode::new(1, 4096);
        node.inject_fault(Fault::Attach);
        assert!(matches!(Proxy::attach(node.bp(), 1), Err(Error::Attach { .. })));
    }
}
