//! The Mach port set every wrapper's receive right is a member of, and the thin transport layer
//! the forward loop blocks on.
//!
//! This is the concrete implementation of the `msg_receive_into(bucket)` primitive: the core
//! engine only needs a `(message, local wrapper)` pair out of a receive, not any of the port-set
//! machinery below.

use crate::{
    msg::{Buffer, MsgParser, RecvError},
    rights::recv_raw_impl,
    wrapper::WrapperRef,
};
use mach2::{
    kern_return::KERN_SUCCESS,
    mach_port,
    port::{mach_port_t, MACH_PORT_NULL, MACH_PORT_RIGHT_PORT_SET},
    traps,
};
use std::collections::HashMap;

/// A Mach port set plus the raw-name → wrapper table used to resolve which member a message
/// arrived on.
#[derive(Debug)]
pub struct Bucket {
    raw_port_set: mach_port_t,
    members: HashMap<mach_port_t, WrapperRef>,
}

impl Bucket {
    /// Allocates a fresh, empty port set.
    pub fn new() -> Self {
        let mut raw_port_set = MACH_PORT_NULL;
        let result = unsafe {
            mach_port::mach_port_allocate(
                traps::mach_task_self(),
                MACH_PORT_RIGHT_PORT_SET,
                &mut raw_port_set,
            )
        };

        assert_eq!(result, KERN_SUCCESS);

        Bucket {
            raw_port_set,
            members: HashMap::new(),
        }
    }

    /// Inserts `wrapper`'s receive right into the set and records it for dispatch, making it
    /// eligible to be returned by [`receive`](Self::receive).
    pub fn insert(&mut self, wrapper: WrapperRef) {
        let raw_name = wrapper.borrow().raw_receive_name();

        let result = unsafe {
            mach_port::mach_port_move_member(traps::mach_task_self(), raw_name, self.raw_port_set)
        };
        assert_eq!(result, KERN_SUCCESS);

        self.members.insert(raw_name, wrapper);
    }

    /// Removes a receive right from the set by its raw name, e.g. right before its wrapper is
    /// freelisted or claimed by a receive-right transfer.
    pub fn remove(&mut self, raw_name: mach_port_t) {
        let result = unsafe {
            mach_port::mach_port_move_member(traps::mach_task_self(), raw_name, MACH_PORT_NULL)
        };
        assert_eq!(result, KERN_SUCCESS);

        self.members.remove(&raw_name);
    }

    /// Looks up the wrapper owning receive right `raw_name`, whether or not it is presently a
    /// bucket member. Used by the rewriter to recognize the tracee handing one of our own
    /// wrapper rights back to us.
    pub fn find_by_receive(&self, raw_name: mach_port_t) -> Option<WrapperRef> {
        self.members.get(&raw_name).cloned()
    }

    /// Blocks until a message arrives on any member of the set, and returns it together with the
    /// wrapper it arrived on.
    ///
    /// # Panics
    /// Panics if the message arrives on a local port that isn't a known member — per the forward
    /// loop's contract this is an assertion, not a recoverable error.
    pub fn receive<'buffer>(
        &self,
        buffer: &'buffer mut Buffer,
    ) -> Result<(WrapperRef, MsgParser<'buffer>), RecvError> {
        recv_raw_impl(self.raw_port_set, buffer)?;

        let raw_local = buffer.header().msgh_local_port;
        let wrapper = self
            .members
            .get(&raw_local)
            .cloned()
            .expect("message arrived on a port absent from the bucket");

        Ok((wrapper, MsgParser::new(buffer)))
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{rights::RecvRight, wrapper::Wrapper};
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn test_insert_find_remove() {
        let mut bucket = Bucket::new();

        let receive = RecvRight::alloc();
        let forward_recv = RecvRight::alloc();
        let forward = forward_recv.make_send();

        let mut wrapper = Wrapper::empty();
        wrapper.install_send(receive, forward, None);
        let raw_name = wrapper.raw_receive_name();
        let wrapper_ref: WrapperRef = Rc::new(RefCell::new(wrapper));

        bucket.insert(wrapper_ref.clone());
        assert!(bucket.find_by_receive(raw_name).is_some());

        bucket.remove(raw_name);
        assert!(bucket.find_by_receive(raw_name).is_none());
    }
}
