//! The wrapper registry: reverse lookup from a forwarded right to the wrapper intercepting it,
//! plus a LIFO freelist of reusable wrapper slots.
//!
//! Registry, freelist and every wrapper are touched only from the forward loop's single worker
//! (see the crate's concurrency notes), so plain [`HashMap`]/[`Vec`] are enough; nothing here
//! needs locking.

use crate::wrapper::{Wrapper, WrapperRef};
use mach2::port::mach_port_t;
use std::collections::HashMap;
use std::{cell::RefCell, rc::Rc};
use thiserror::Error;

/// Returned by [`Registry::insert`] when the forward right is already registered.
#[derive(Debug, Clone, Copy, Error)]
#[error("a wrapper is already registered for this forward right")]
pub struct Duplicate;

/// Maps each real, tracee-observable send right to the unique wrapper intercepting it.
#[derive(Debug, Default)]
pub struct Registry {
    by_forward: HashMap<mach_port_t, WrapperRef>,
    freelist: Vec<WrapperRef>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// O(1) reverse lookup: the wrapper currently registered for `raw_forward`, if any.
    pub fn find(&self, raw_forward: mach_port_t) -> Option<WrapperRef> {
        self.by_forward.get(&raw_forward).cloned()
    }

    /// Registers `wrapper` under `raw_forward`. Fails if a wrapper is already registered for
    /// that forward right — per the invariant that no two live send-wrappers share a forward
    /// right, this should never legitimately happen and callers may `.unwrap()`.
    pub fn insert(&mut self, raw_forward: mach_port_t, wrapper: WrapperRef) -> Result<(), Duplicate> {
        if self.by_forward.contains_key(&raw_forward) {
            return Err(Duplicate);
        }

        self.by_forward.insert(raw_forward, wrapper);
        Ok(())
    }

    /// Removes the registry entry keyed by `raw_forward`. A no-op if none exists (e.g. the
    /// wrapper being torn down was a send-once wrapper, which is never registered).
    pub fn remove(&mut self, raw_forward: mach_port_t) {
        self.by_forward.remove(&raw_forward);
    }

    /// Pops a reusable slot from the freelist. The returned wrapper is guaranteed to be empty
    /// (no receive right, no forward right, no name) per the freelist discipline.
    pub fn claim_freelist_slot(&mut self) -> Option<WrapperRef> {
        self.freelist.pop()
    }

    /// Allocates a brand new, empty wrapper slot (used when the freelist is exhausted).
    pub fn new_slot() -> WrapperRef {
        Rc::new(RefCell::new(Wrapper::empty()))
    }

    /// Pushes `wrapper` onto the freelist for reuse. The caller guarantees the wrapper has
    /// already been reset to the empty state and removed from `by_forward` — asserted here.
    pub fn release_to_freelist(&mut self, wrapper: WrapperRef) {
        assert!(
            matches!(wrapper.borrow().state(), crate::wrapper::WrapperState::Empty),
            "released wrapper must be empty"
        );

        self.freelist.push(wrapper);
    }

    /// The number of live (registered) send-wrappers. Exposed for the freelist-reuse testable
    /// property: the number of live wrapper allocations is bounded by the maximum simultaneous
    /// outstanding right count, not the cumulative message count.
    pub fn live_count(&self) -> usize {
        self.by_forward.len()
    }

    /// The number of slots currently sitting on the freelist.
    pub fn freelist_len(&self) -> usize {
        self.freelist.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{rights::RecvRight, traits::AsRawName};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_insert_find_remove() {
        let mut registry = Registry::new();

        let receive = RecvRight::alloc();
        let forward_recv = RecvRight::alloc();
        let forward = forward_recv.make_send();
        let raw_forward = forward.as_raw_name();

        let mut wrapper = Wrapper::empty();
        wrapper.install_send(receive, forward, None);
        let wrapper_ref: WrapperRef = Rc::new(RefCell::new(wrapper));

        registry.insert(raw_forward, wrapper_ref.clone()).unwrap();
        assert_eq!(registry.live_count(), 1);
        assert!(registry.find(raw_forward).is_some());
        assert!(registry
            .insert(raw_forward, wrapper_ref.clone())
            .is_err());

        registry.remove(raw_forward);
        assert_eq!(registry.live_count(), 0);
        assert!(registry.find(raw_forward).is_none());
    }

    #[test]
    fn test_freelist_roundtrip() {
        let mut registry = Registry::new();
        assert!(registry.claim_freelist_slot().is_none());

        let wrapper_ref: WrapperRef = Registry::new_slot();
        registry.release_to_freelist(wrapper_ref.clone());
        assert_eq!(registry.freelist_len(), 1);

        let reclaimed = registry.claim_freelist_slot().unwrap();
        assert!(Rc::ptr_eq(&reclaimed, &wrapper_ref));
        assert_eq!(registry.freelist_len(), 0);
    }
}
