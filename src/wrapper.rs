//! Wrapper objects: tracer-owned receive rights that stand in for a real port right.
//!
//! A wrapper's per-kind fields are mutually exclusive by construction (a wrapper is either
//! standing in for a `send` right or for a `send-once` right, never both), so they are modeled
//! as a tagged [`WrapperState`] rather than a struct with overlapping optional fields.

use crate::{
    msg::MsgId,
    rights::{RecvRight, SendOnceRight, SendRight},
    traits::AsRawName,
};
use mach2::port::mach_port_t;
use std::cell::RefCell;
use std::rc::Rc;

/// A shared handle to a wrapper's state.
///
/// Kernel-observable reference counts (how many send rights the tracee and its peers hold) are
/// tracked by the kernel itself via no-senders and dead-name notifications, not by this `Rc`'s
/// strong count: a wrapper is reclaimed explicitly by the forward loop when a notification says
/// so, never implicitly when the last `WrapperRef` clone is dropped.
pub type WrapperRef = Rc<RefCell<Wrapper>>;

/// State specific to a `send-wrapper`.
#[derive(Debug)]
pub struct SendState {
    /// The real send right this wrapper relays to.
    pub forward: SendRight,
}

/// State specific to a `send-once-wrapper`.
#[derive(Debug)]
pub struct SendOnceState {
    /// The real send-once right this wrapper relays to.
    pub forward: SendOnceRight,
    /// The request id the reply is expected to echo back as `sent_msgid + 100`.
    pub sent_msgid: MsgId,
}

/// The mutually exclusive per-kind state of a wrapper.
#[derive(Debug)]
pub enum WrapperState {
    /// Stands in for a real send right; lives as long as senders exist to `receive`.
    Send(SendState),
    /// Stands in for a real send-once right; reclaimed after its one message is forwarded or a
    /// send-once notification reports the sender died unused.
    SendOnce(SendOnceState),
    /// A freelisted slot: no receive right, no forward right, no name.
    Empty,
}

/// A tracer-owned object whose receive right stands in for a real port right.
///
/// Any message received on `receive` is delivered, with interposition applied, as if sent from
/// the tracer to [`forward`](Wrapper::forward_raw_name).
#[derive(Debug)]
pub struct Wrapper {
    receive: Option<RecvRight>,
    state: WrapperState,
    name: Option<String>,
}

impl Wrapper {
    /// Creates a freelisted placeholder with no receive right and no per-kind state.
    pub fn empty() -> Self {
        Wrapper {
            receive: None,
            state: WrapperState::Empty,
            name: None,
        }
    }

    /// Turns an empty slot into a live send-wrapper. Panics if the slot wasn't empty.
    pub fn install_send(&mut self, receive: RecvRight, forward: SendRight, name: Option<String>) {
        assert!(matches!(self.state, WrapperState::Empty));
        assert!(self.receive.is_none());

        self.receive = Some(receive);
        self.state = WrapperState::Send(SendState { forward });
        self.name = name;
    }

    /// Turns an empty slot into a live send-once wrapper. Panics if the slot wasn't empty.
    pub fn install_send_once(
        &mut self,
        receive: RecvRight,
        forward: SendOnceRight,
        sent_msgid: MsgId,
    ) {
        assert!(matches!(self.state, WrapperState::Empty));
        assert!(self.receive.is_none());

        self.receive = Some(receive);
        self.state = WrapperState::SendOnce(SendOnceState { forward, sent_msgid });
    }

    /// Clears every field, leaving a slot that satisfies the freelist discipline: no receive
    /// right, no forward right, no name.
    pub fn reset_to_empty(&mut self) -> Option<RecvRight> {
        self.state = WrapperState::Empty;
        self.name = None;
        self.receive.take()
    }

    /// Takes the forward right out of a send-once wrapper, leaving its per-kind state empty.
    ///
    /// A send-once right is consumed by its one send, so the forward loop takes it out to pass
    /// to [`SendOnceRight::send`](crate::rights::SendOnceRight::send) and reclaims the rest of
    /// the wrapper (receive right, freelist slot) separately.
    pub fn take_send_once_forward(&mut self) -> SendOnceRight {
        match std::mem::replace(&mut self.state, WrapperState::Empty) {
            WrapperState::SendOnce(s) => {
                self.name = None;
                s.forward
            }
            _ => panic!("wrapper is not a send-once wrapper"),
        }
    }

    /// Produces the right to forward a message through, regardless of whether this wrapper is
    /// currently a send-wrapper or a send-once wrapper.
    ///
    /// A send-wrapper's forward right is reusable and so is cloned; a send-once wrapper's forward
    /// right is single-use and so is taken out, leaving the wrapper's per-kind state empty exactly
    /// as [`take_send_once_forward`](Self::take_send_once_forward) does.
    pub fn forward_for_send(&mut self) -> crate::rights::AnySendRight {
        match &self.state {
            WrapperState::Send(s) => return s.forward.clone().into(),
            WrapperState::SendOnce(_) => {}
            WrapperState::Empty => panic!("wrapper has no forward right"),
        }

        self.take_send_once_forward().into()
    }

    /// Takes the wrapper's own receive right out, leaving the wrapper with no receive right.
    ///
    /// Used when a receive-right transfer claims an existing send-wrapper's receive right to
    /// forward it to its new owner (the "move-receive, already registered" case).
    pub fn take_receive(&mut self) -> RecvRight {
        self.receive.take().expect("wrapper has no receive right")
    }

    /// The wrapper's own receive right, if it still owns one.
    pub fn receive(&self) -> &RecvRight {
        self.receive.as_ref().expect("wrapper has no receive right")
    }

    /// The raw name of the wrapper's own receive right; this is what peers of the tracee are
    /// handed a send right to, and what the forward loop uses as the bucket member / local-port
    /// dispatch key.
    pub fn raw_receive_name(&self) -> mach_port_t {
        self.receive().as_raw_name()
    }

    /// Mints a fresh send right to the wrapper's own receive right.
    pub fn make_send(&self) -> SendRight {
        self.receive().make_send()
    }

    /// The raw name of the real right this wrapper relays to, regardless of whether it is a
    /// send-wrapper or a send-once-wrapper.
    pub fn forward_raw_name(&self) -> mach_port_t {
        match &self.state {
            WrapperState::Send(s) => s.forward.as_raw_name(),
            WrapperState::SendOnce(s) => s.forward.as_raw_name(),
            WrapperState::Empty => panic!("wrapper has no forward right"),
        }
    }

    /// The per-kind state.
    pub fn state(&self) -> &WrapperState {
        &self.state
    }

    /// The per-kind state, mutably.
    pub fn state_mut(&mut self) -> &mut WrapperState {
        &mut self.state
    }

    /// The human-readable trace-output label, if one has been assigned.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Assigns a trace-output label. Only done once, the first time a wrapper is printed.
    pub fn set_name(&mut self, name: String) {
        self.name = Some(name);
    }

    /// Whether this wrapper is currently a live send-wrapper.
    pub fn is_send(&self) -> bool {
        matches!(self.state, WrapperState::Send(_))
    }

    /// Whether this wrapper is currently a live send-once wrapper.
    pub fn is_send_once(&self) -> bool {
        matches!(self.state, WrapperState::SendOnce(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_then_install() {
        let mut wrapper = Wrapper::empty();
        assert!(matches!(wrapper.state(), WrapperState::Empty));

        let receive = RecvRight::alloc();
        let forward_recv = RecvRight::alloc();
        let forward = forward_recv.make_send();
        wrapper.install_send(receive, forward, Some("task<1337>".into()));

        assert!(wrapper.is_send());
        assert_eq!(wrapper.name(), Some("task<1337>"));

        let _ = wrapper.reset_to_empty();
        assert!(matches!(wrapper.state(), WrapperState::Empty));
        assert_eq!(wrapper.name(), None);
    }

    #[test]
    #[should_panic]
    fn test_double_install_panics() {
        let mut wrapper = Wrapper::empty();
        let receive = RecvRight::alloc();
        let forward_recv = RecvRight::alloc();
        wrapper.install_send(receive, forward_recv.make_send(), None);

        let receive2 = RecvRight::alloc();
        let forward_recv2 = RecvRight::alloc();
        wrapper.install_send(receive2, forward_recv2.make_send(), None);
    }
}
