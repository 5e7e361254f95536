//! The right rewriter: given a port right carried in a message from the tracee,
//! decides whether to reuse an existing wrapper, unwrap one of our own wrappers being handed
//! back, or allocate a new one, and returns the right to place in the forwarded message together
//! with the wrapper now associated with it (for naming and reply correlation).
//!
//! Every function here takes the [`Registry`] and [`Bucket`] together because allocating a new
//! wrapper always means both registering its forward right *and* making its receive right a
//! bucket member so the forward loop starts dispatching messages to it.

use crate::{
    bucket::Bucket,
    notify,
    registry::Registry,
    rights::{RecvRight, SendOnceRight, SendRight},
    traits::AsRawName,
    wrapper::{Wrapper, WrapperRef},
};

/// Allocates a receive/send pair, installs a brand new send-wrapper around `forward`, registers
/// it, and makes its receive right a bucket member — the common tail shared by every place a
/// never-seen-before send right needs wrapping (the rewriter's fresh-wrapper case and the
/// spawner's task-port wrapper).
///
/// Requests the wrapper's own no-senders notification and `forward`'s dead-name notification
/// before installing either right, since both calls only need the raw names and are easier to
/// get right before the rights are moved into the wrapper.
pub fn wrap_new_forward(
    forward: SendRight,
    registry: &mut Registry,
    bucket: &mut Bucket,
    name: Option<String>,
) -> WrapperRef {
    let raw_forward = forward.as_raw_name();
    let receive = RecvRight::alloc();

    notify::request_no_senders(&receive);
    notify::request_dead_name(&forward, &receive);

    let slot = registry.claim_freelist_slot().unwrap_or_else(Registry::new_slot);
    slot.borrow_mut().install_send(receive, forward, name);
    registry
        .insert(raw_forward, slot.clone())
        .expect("freshly minted forward right cannot already be registered");
    bucket.insert(slot.clone());

    slot
}

/// Tears down a wrapper in response to a dead-name or no-senders notification: removes its
/// registry entry (send-wrappers only; send-once wrappers are never registered) before
/// reclaiming it to the freelist.
pub fn destroy(wrapper: WrapperRef, registry: &mut Registry, bucket: &mut Bucket) {
    if let crate::wrapper::WrapperState::Send(s) = wrapper.borrow().state() {
        registry.remove(s.forward.as_raw_name());
    }
    reclaim(wrapper, registry, bucket);
}

/// Mach message IDs for "pass-through" operations that manipulate port *names* in a foreign
/// task's name space rather than transfer rights. The only one currently recognized is
/// `mach_port_insert_right`, whose request ID is stable across all its MIG interface revisions.
///
/// Whether every caller of every such RPC is covered by this single ID is left open; see
/// DESIGN.md.
pub const PASS_THROUGH_MSG_IDS: &[i32] = &[3215];

/// Returns whether `msg_id` identifies a pass-through operation, for which port-name array
/// elements must be printed but never looked up against our own wrapper state.
pub fn is_pass_through(msg_id: i32) -> bool {
    PASS_THROUGH_MSG_IDS.contains(&msg_id)
}

/// Rewrites a received send right, covering move-send, copy-send and make-send alike
/// (indistinguishable on arrival; the kernel always delivers a plain send right regardless of
/// the sender's original disposition).
///
/// Returns the send right to place in the forwarded message and the wrapper it is now
/// associated with.
pub fn rewrite_send(
    right: SendRight,
    registry: &mut Registry,
    bucket: &mut Bucket,
) -> (SendRight, WrapperRef) {
    let raw = right.as_raw_name();

    if let Some(wrapper) = registry.find(raw) {
        // Already tracing this port: the incoming right is a duplicate reference to a forward
        // we already hold, so it is simply dropped (released) and we hand out a fresh send to
        // our existing wrapper's receive right instead.
        drop(right);
        let new_send = wrapper.borrow().make_send();
        return (new_send, wrapper);
    }

    if let Some(wrapper) = bucket.find_by_receive(raw) {
        // The tracee is handing back a send right to one of our own wrappers. Unwrap it: the
        // peer gets the real forward right directly rather than a second layer of wrapping,
        // which would otherwise recurse forever as a right bounces between tracee and peer.
        let forward = match wrapper.borrow().state() {
            crate::wrapper::WrapperState::Send(s) => s.forward.clone(),
            _ => unreachable!("bucket member with a send-wrapper raw name must be a send-wrapper"),
        };
        drop(right);
        return (forward, wrapper);
    }

    // Never seen before: allocate a brand new send-wrapper and register it.
    let slot = wrap_new_forward(right, registry, bucket, None);
    let our_send = slot.borrow().make_send();

    (our_send, slot)
}

/// Rewrites a received send-once right (move-send-once or make-send-once).
///
/// Every send-once transfer is unique by construction (a send-once right has no stable
/// identity), so this unconditionally mints a fresh disposable wrapper — reusing a freelist slot
/// when one is available — and never registers it.
pub fn rewrite_send_once(
    right: SendOnceRight,
    registry: &mut Registry,
    bucket: &mut Bucket,
    sent_msgid: crate::msg::MsgId,
) -> (SendOnceRight, WrapperRef) {
    let slot = registry.claim_freelist_slot().unwrap_or_else(Registry::new_slot);
    let receive = RecvRight::alloc();
    let our_send_once = receive.make_send_once();

    slot.borrow_mut().install_send_once(receive, right, sent_msgid);
    bucket.insert(slot.clone());

    (our_send_once, slot)
}

/// Rewrites a received receive right (move-receive).
///
/// If a send-wrapper is already registered for this same raw name (the tracee previously handed
/// us send rights to the same port and is now handing over the receive right itself), that
/// wrapper's own receive right is claimed and handed onward in its place, preserving the
/// identity existing send-wrapper sends already point at; a fresh send right is synthesized to
/// stand in as the old wrapper's replacement `forward`. Otherwise a fresh receive/send pair is
/// allocated.
pub fn rewrite_receive(
    right: RecvRight,
    registry: &mut Registry,
    bucket: &mut Bucket,
) -> (RecvRight, WrapperRef) {
    let raw = right.as_raw_name();

    let (outgoing_recv, name) = if let Some(old_wrapper) = registry.find(raw) {
        registry.remove(raw);
        bucket.remove(old_wrapper.borrow().raw_receive_name());

        let mut w = old_wrapper.borrow_mut();
        let claimed = w.take_receive();
        let name = w.name().map(ToOwned::to_owned);
        w.reset_to_empty();
        drop(w);

        registry.release_to_freelist(old_wrapper);

        (claimed, name)
    } else {
        (RecvRight::alloc(), None)
    };

    let new_forward = outgoing_recv.make_send();
    let raw_forward = new_forward.as_raw_name();

    // Unlike a fresh send-wrapper, this wrapper's own receive right is the real transferred
    // receive right itself (the tracer now physically owns the port), so the two notification
    // registrations are requested directly rather than through `wrap_new_forward`.
    notify::request_no_senders(&right);
    notify::request_dead_name(&new_forward, &right);

    let new_slot = registry.claim_freelist_slot().unwrap_or_else(Registry::new_slot);
    new_slot.borrow_mut().install_send(right, new_forward, name);
    registry
        .insert(raw_forward, new_slot.clone())
        .expect("freshly minted forward right cannot already be registered");
    bucket.insert(new_slot.clone());

    (outgoing_recv, new_slot)
}

/// Reclaims `wrapper` — a send-once wrapper whose one use is spent, or any wrapper whose
/// registry entry the caller has already removed (see [`destroy`]) — back to the freelist,
/// leaving it with no receive right, no forward right and no name.
pub fn reclaim(wrapper: WrapperRef, registry: &mut Registry, bucket: &mut Bucket) {
    let raw_receive = wrapper.borrow().raw_receive_name();
    bucket.remove(raw_receive);

    let mut w = wrapper.borrow_mut();
    let _receive = w.reset_to_empty();
    drop(w);

    debug_assert!(matches!(
        Wrapper::empty().state(),
        crate::wrapper::WrapperState::Empty
    ));

    registry.release_to_freelist(wrapper);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_send_right_creates_wrapper() {
        let mut registry = Registry::new();
        let mut bucket = Bucket::new();

        let real_recv = RecvRight::alloc();
        let real_send = real_recv.make_send();
        let raw_real = real_send.as_raw_name();

        let (outgoing, wrapper) = rewrite_send(real_send, &mut registry, &mut bucket);

        assert_ne!(outgoing.as_raw_name(), raw_real);
        assert!(wrapper.borrow().is_send());
        assert_eq!(registry.live_count(), 1);
        assert!(registry.find(raw_real).is_some());
    }

    #[test]
    fn test_repeated_send_right_reuses_wrapper() {
        let mut registry = Registry::new();
        let mut bucket = Bucket::new();

        let real_recv = RecvRight::alloc();
        let send_a = real_recv.make_send();
        let send_b = real_recv.make_send();

        let (_outgoing_a, wrapper_a) = rewrite_send(send_a, &mut registry, &mut bucket);
        let (_outgoing_b, wrapper_b) = rewrite_send(send_b, &mut registry, &mut bucket);

        assert!(std::rc::Rc::ptr_eq(&wrapper_a, &wrapper_b));
        assert_eq!(registry.live_count(), 1);
    }

    #[test]
    fn test_handing_back_our_wrapper_unwraps() {
        let mut registry = Registry::new();
        let mut bucket = Bucket::new();

        let real_recv = RecvRight::alloc();
        let real_send = real_recv.make_send();
        let raw_real = real_send.as_raw_name();

        let (wrapper_send, wrapper) = rewrite_send(real_send, &mut registry, &mut bucket);
        let raw_wrapper_recv = wrapper.borrow().raw_receive_name();
        assert_eq!(wrapper_send.as_raw_name(), raw_wrapper_recv);

        // The tracee hands the wrapper's send right back to us in a later message.
        let (unwrapped, same_wrapper) = rewrite_send(wrapper_send, &mut registry, &mut bucket);

        assert!(std::rc::Rc::ptr_eq(&wrapper, &same_wrapper));
        assert_eq!(unwrapped.as_raw_name(), raw_real);
    }

    #[test]
    fn test_send_once_never_registered() {
        let mut registry = Registry::new();
        let mut bucket = Bucket::new();

        let real_recv = RecvRight::alloc();
        let real_send_once = real_recv.make_send_once();

        let (_outgoing, wrapper) = rewrite_send_once(real_send_once, &mut registry, &mut bucket, 0);

        assert!(wrapper.borrow().is_send_once());
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_destroy_removes_registered_send_wrapper() {
        let mut registry = Registry::new();
        let mut bucket = Bucket::new();

        let real_recv = RecvRight::alloc();
        let real_send = real_recv.make_send();
        let raw_real = real_send.as_raw_name();

        let (_outgoing, wrapper) = rewrite_send(real_send, &mut registry, &mut bucket);
        assert_eq!(registry.live_count(), 1);

        destroy(wrapper, &mut registry, &mut bucket);

        assert_eq!(registry.live_count(), 0);
        assert!(registry.find(raw_real).is_none());
        assert_eq!(registry.freelist_len(), 1);
    }

    #[test]
    fn test_freelist_reused_across_send_once_wrappers() {
        let mut registry = Registry::new();
        let mut bucket = Bucket::new();

        let recv1 = RecvRight::alloc();
        let (_o1, w1) = rewrite_send_once(recv1.make_send_once(), &mut registry, &mut bucket, 0);
        reclaim(w1.clone(), &mut registry, &mut bucket);
        assert_eq!(registry.freelist_len(), 1);

        let recv2 = RecvRight::alloc();
        let (_o2, w2) = rewrite_send_once(recv2.make_send_once(), &mut registry, &mut bucket, 0);
        assert!(std::rc::Rc::ptr_eq(&w1, &w2));
        assert_eq!(registry.freelist_len(), 0);
    }
}
