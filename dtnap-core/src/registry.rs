//! Generational handle registry: host code holds `u64` tokens, never addresses.
//! Token layout: generation in the high 32 bits, slot index + 1 in the low 32. Zero is never issued.

use std::sync::Mutex;

use crate::lock;

// Keeps tokens positive when handed out as i64.
const GENERATION_MASK: u32 = 0x7fff_ffff;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    live: usize,
}

pub struct Registry<T> {
    inner: Mutex<Slots<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    pub fn insert(&self, value: T) -> u64 {
        let mut inner = lock(&self.inner);
        inner.live += 1;
        let index = match inner.free.pop() {
            Some(index) => {
                inner.slots[index].value = Some(value);
                index
            }
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    value: Some(value),
                });
                inner.slots.len() - 1
            }
        };
        token(inner.slots[index].generation, index)
    }

    pub fn remove(&self, token: u64) -> Option<T> {
        let mut inner = lock(&self.inner);
        let index = inner.resolve(token)?;
        let slot = &mut inner.slots[index];
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1) & GENERATION_MASK;
        inner.free.push(index);
        inner.live -= 1;
        Some(value)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> Registry<T> {
    pub fn get(&self, token: u64) -> Option<T> {
        let inner = lock(&self.inner);
        let index = inner.resolve(token)?;
        inner.slots[index].value.clone()
    }
}

impl<T> Slots<T> {
    fn resolve(&self, token: u64) -> Option<usize> {
        let low = (token & 0xffff_ffff) as usize;
        let generation = (token >> 32) as u32;
        let index = low.checked_sub(1)?;
        let slot = self.slots.get(index)?;
        (slot.generation == generation && slot.value.is_some()).then_some(index)
    }
}

fn token(generation: u32, index: usize) -> u64 {
    ((generation as u64) << 32) | (index as u64 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let reg = Registry::new();
        let t = reg.insert("a");
        assert_ne!(t, 0);
        assert_eq!(reg.get(t), Some("a"));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.remove(t), Some("a"));
        assert_eq!(reg.get(t), None);
        assert_eq!(reg.remove(t), None);
        assert!(reg.is_empty());
    }

    #[test]
    fn stale_token_after_slot_reuse() {
        let reg = Registry::new();
        let old = reg.insert(1);
        reg.remove(old);
        let new = reg.insert(2);
        assert_ne!(old, new);
        assert_eq!(reg.get(old), None);
        assert_eq!(reg.get(new), Some(2));
    }

    #[test]
    fn forged_tokens_miss() {
        let reg: Registry<u8> = Registry::new();
        reg.insert(9);
        assert_eq!(reg.get(0), None);
        assert_eq!(reg.get(2), None);
        assert_eq!(reg.get(1 | (5 << 32)), None);
    }

    #[test]
    fn tokens_fit_in_i64() {
        let reg = Registry::new();
        let mut t = reg.insert(0u8);
        for _ in 0..1000 {
            reg.remove(t);
            t = reg.insert(0);
            assert!(i64::try_from(t).is_ok());
        }
    }
}
