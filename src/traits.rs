//! Contains traits for Mach port name wrappers.

use mach2::port::{mach_port_right_t, mach_port_t};

/// A trait for everything that wraps a raw Mach port name (aka `mach_port_t`) and can be converted
/// into it.
pub trait AsRawName {
    /// The right-kind wrapper this value ultimately refers to (e.g. a `&SendRight` and a
    /// `SendRight` both have `Base = SendRight`). Used to constrain builder methods to the right
    /// kind of right without losing the reference/owned distinction.
    type Base;

    /// Converts a type into a raw Mach port name. This function should not alter reference counts
    /// of any port rights.
    fn as_raw_name(&self) -> mach_port_t;
}

/// A trait for everything that wraps a raw Mach port name (aka `mach_port_t`) and can be converted
/// into it, consuming the wrapper.
pub trait IntoRawName {
    /// The right-kind wrapper this value is.
    type Base: BaseRight;

    /// Converts a type into a raw Mach port name. This function should not alter reference counts
    /// of any port rights.
    fn into_raw_name(self) -> mach_port_t;
}

/// A trait implemented by the three right-kind marker types ([`SendRight`](crate::rights::SendRight),
/// [`SendOnceRight`](crate::rights::SendOnceRight), [`RecvRight`](crate::rights::RecvRight))
/// describing the Mach message type name used when that kind of right is moved into a message.
pub trait BaseRight {
    /// The `mach_msg_type_name_t` disposition used when a right of this kind is moved (consumed)
    /// into a message.
    const MSG_TYPE: mach_port_right_t;
}

/// Marker trait for right kinds that can be used as the destination of a message send (i.e.
/// [`SendRight`](crate::rights::SendRight) and [`SendOnceRight`](crate::rights::SendOnceRight), but
/// not [`RecvRight`](crate::rights::RecvRight)).
pub trait BaseSendRight: BaseRight {}
