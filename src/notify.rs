//! Registers the two kernel notifications the forward loop watches for: no-senders,
//! self-registered on every wrapper's own receive right the moment it is minted, and
//! dead-name, registered on a freshly wrapped `forward` right so the tracer learns when the real
//! port it stands in for goes away.
//!
//! Neither notification is requested anywhere else in this crate: a wrapper is only ever reused
//! or unwrapped after this point, never re-registered, so each of the two calls here happens
//! exactly once per wrapper's lifetime.

use crate::{
    rights::{RecvRight, SendOnceRight, SendRight},
    traits::AsRawName,
};
use mach2::{
    mach_port,
    message::{MACH_MSG_TYPE_MAKE_SEND_ONCE, MACH_NOTIFY_DEAD_NAME, MACH_NOTIFY_NO_SENDERS},
    kern_return::KERN_SUCCESS,
    port::MACH_PORT_NULL,
    traps::mach_task_self,
};

/// Asks the kernel to send a no-senders notification to `recv` itself once every send right to
/// it has gone away.
pub fn request_no_senders(recv: &RecvRight) {
    request(recv.as_raw_name(), MACH_NOTIFY_NO_SENDERS, recv.as_raw_name());
}

/// Asks the kernel to send a dead-name notification to `recv` if the real port `forward` points
/// at is ever destroyed while we still hold this send right to it.
pub fn request_dead_name(forward: &SendRight, recv: &RecvRight) {
    request(forward.as_raw_name(), MACH_NOTIFY_DEAD_NAME, recv.as_raw_name());
}

fn request(name: mach2::port::mach_port_t, msgid: mach2::message::mach_msg_id_t, notify: mach2::port::mach_port_t) {
    let mut previous = MACH_PORT_NULL;

    // `notify` is passed with disposition `MAKE_SEND_ONCE`: the kernel mints a fresh send-once
    // right from the receive right we name, rather than consuming one we'd have to make
    // ourselves first.
    let result = unsafe {
        mach_port::mach_port_request_notification(
            mach_task_self(),
            name,
            msgid,
            0,
            notify,
            MACH_MSG_TYPE_MAKE_SEND_ONCE,
            &mut previous,
        )
    };
    assert_eq!(result, KERN_SUCCESS, "mach_port_request_notification failed");

    if previous != MACH_PORT_NULL {
        // A previous registration existed (shouldn't happen given each wrapper registers once,
        // but the kernel hands back whatever was there before and we own it now).
        drop(SendOnceRight::from_raw_name(previous));
    }
}
