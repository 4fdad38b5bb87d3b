//! Bounded in-process object store backing the loopback engine.
//!
//! Bytes are first inserted as pending data, then committed as a reference-counted message
//! object. Only committed objects count against capacity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::engine::StoreRef;
use crate::error::{EngineResult, ReturnCode};
use crate::gate::{Attendant, GateMode};
use crate::lock;

/// Message object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreUsage {
    pub objects: usize,
    pub bytes_in_use: usize,
    pub pending: usize,
    pub capacity: usize,
}

struct Object {
    data: Arc<[u8]>,
    refs: u32,
}

struct Inner {
    capacity: usize,
    in_use: usize,
    next_id: u64,
    pending: HashMap<u64, Vec<u8>>,
    objects: HashMap<u64, Object>,
    attendants: Vec<Attendant>,
}

pub struct Store {
    inner: Mutex<Inner>,
}

impl Store {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity,
                in_use: 0,
                next_id: 1,
                pending: HashMap::new(),
                objects: HashMap::new(),
                attendants: Vec::new(),
            }),
        }
    }

    pub fn insert(&self, data: &[u8]) -> EngineResult<StoreRef> {
        let mut inner = lock(&self.inner);
        if data.len() > inner.capacity {
            return Err(ReturnCode::Store);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.pending.insert(id, data.to_vec());
        Ok(StoreRef::new(id))
    }

    /// Drop pending bytes that never became an object.
    pub fn discard(&self, stored: StoreRef) {
        lock(&self.inner).pending.remove(&stored.id());
    }

    /// Commit pending bytes as an object. Without an attendant a full store fails at once;
    /// with one, the caller waits until space frees up or the gate is paused.
    pub fn create_object(&self, stored: StoreRef, attendant: Option<&Attendant>) -> EngineResult<ObjectId> {
        let id = stored.id();
        loop {
            {
                let mut inner = lock(&self.inner);
                let len = match inner.pending.get(&id) {
                    Some(data) => data.len(),
                    None => return Err(ReturnCode::MessageObject),
                };
                if inner.in_use + len <= inner.capacity {
                    if let Some(data) = inner.pending.remove(&id) {
                        inner.in_use += len;
                        inner.objects.insert(
                            id,
                            Object {
                                data: data.into(),
                                refs: 1,
                            },
                        );
                        return Ok(ObjectId(id));
                    }
                }
                if attendant.is_none() {
                    inner.pending.remove(&id);
                    return Err(ReturnCode::MessageObject);
                }
            }
            if let Some(gate) = attendant {
                self.watch(gate);
                if let Err(code) = gate.admit(|| self.has_room_for(id)) {
                    lock(&self.inner).pending.remove(&id);
                    return Err(code);
                }
            }
        }
    }

    pub fn retain(&self, object: ObjectId) -> EngineResult<()> {
        let mut inner = lock(&self.inner);
        let entry = inner.objects.get_mut(&object.0).ok_or(ReturnCode::MessageObject)?;
        entry.refs += 1;
        Ok(())
    }

    pub fn release(&self, object: ObjectId) {
        let attendants = {
            let mut inner = lock(&self.inner);
            let refs = match inner.objects.get_mut(&object.0) {
                Some(entry) => {
                    entry.refs -= 1;
                    entry.refs
                }
                None => return,
            };
            if refs > 0 {
                return;
            }
            if let Some(freed) = inner.objects.remove(&object.0) {
                inner.in_use -= freed.data.len();
            }
            inner.attendants.retain(|a| a.mode() != GateMode::Stopped);
            inner.attendants.clone()
        };
        for attendant in attendants {
            attendant.notify();
        }
    }

    pub fn len(&self, object: ObjectId) -> EngineResult<usize> {
        lock(&self.inner)
            .objects
            .get(&object.0)
            .map(|o| o.data.len())
            .ok_or(ReturnCode::MessageObject)
    }

    /// Copy the object's bytes into `buf`; returns the number copied.
    pub fn read(&self, object: ObjectId, buf: &mut [u8]) -> EngineResult<usize> {
        let data = lock(&self.inner)
            .objects
            .get(&object.0)
            .map(|o| o.data.clone())
            .ok_or(ReturnCode::MessageObject)?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    pub fn contents(&self, object: ObjectId) -> EngineResult<Arc<[u8]>> {
        lock(&self.inner)
            .objects
            .get(&object.0)
            .map(|o| o.data.clone())
            .ok_or(ReturnCode::MessageObject)
    }

    pub fn usage(&self) -> StoreUsage {
        let inner = lock(&self.inner);
        StoreUsage {
            objects: inner.objects.len(),
            bytes_in_use: inner.in_use,
            pending: inner.pending.len(),
            capacity: inner.capacity,
        }
    }

    fn has_room_for(&self, id: u64) -> bool {
        let inner = lock(&self.inner);
        match inner.pending.get(&id) {
            Some(data) => inner.in_use + data.len() <= inner.capacity,
            None => true,
        }
    }

    fn watch(&self, gate: &Attendant) {
        let mut inner = lock(&self.inner);
        if !inner.attendants.iter().any(|a| a.same_gate(gate)) {
            inner.attendants.push(gate.clone());
        }
    }
}
