//! The scalar payload formatter: renders the primitive (non-port-right) arrays a message's
//! inline data and OOL data descriptors carry, for the trace grammar's `(<space-separated args>)`
//! body.
//!
//! The rewriter and walker decide *which* bytes are a scalar payload and hand them here; this
//! module only knows how to print them.

use mach2::message::*;
use std::io::{self, Write};

/// Stands in for `type_` when the caller has no per-element type tag at all (this wire model's
/// inline body and OOL data descriptors carry no `mach_msg_type_t`), routing the payload straight
/// to [`format_fallback`] without risking a collision with a real `MACH_MSG_TYPE_*` value — notably
/// `MACH_MSG_TYPE_BIT`, which is `0` and would otherwise be mistaken for an integer array.
const UNTYPED_BYTES: mach_msg_type_name_t = mach_msg_type_name_t::MAX;

/// Prints a primitive array to `out`.
///
/// `type_` is the Mach message type name the descriptor or inline argument carried (e.g.
/// `MACH_MSG_TYPE_INTEGER_32`); `count` is the element count and `eltsize` the size in bytes of
/// each element. Unrecognized `(type_, eltsize)` combinations fall back to a raw hex dump
/// annotated with the metadata that didn't match anything; this function never panics on
/// malformed input, only on a `data` slice shorter than
/// `count * eltsize` (a walker bug, not a wire condition).
pub fn format_scalar(
    out: &mut dyn Write,
    type_: mach_msg_type_name_t,
    data: &[u8],
    count: usize,
    eltsize: usize,
) -> io::Result<()> {
    assert!(data.len() >= count * eltsize, "payload shorter than nelt*eltsize");

    match type_ {
        MACH_MSG_TYPE_PORT_NAME => {
            assert_eq!(eltsize, std::mem::size_of::<u32>());
            return format_port_names(out, data, count);
        }
        MACH_MSG_TYPE_STRING | MACH_MSG_TYPE_CHAR => {
            return format_string(out, &data[..count * eltsize]);
        }
        MACH_MSG_TYPE_BIT
        | MACH_MSG_TYPE_INTEGER_8
        | MACH_MSG_TYPE_INTEGER_16
        | MACH_MSG_TYPE_INTEGER_32
        | MACH_MSG_TYPE_INTEGER_64 => {
            if let Some(()) = format_integers(out, data, count, eltsize)? {
                return Ok(());
            }
        }
        MACH_MSG_TYPE_REAL => {
            if format_reals(out, data, count, eltsize)? {
                return Ok(());
            }
        }
        _ => {}
    }

    format_fallback(out, type_, data, count, eltsize)
}

fn format_port_names(out: &mut dyn Write, data: &[u8], count: usize) -> io::Result<()> {
    if count == 1 {
        let name = u32::from_ne_bytes(data[..4].try_into().unwrap());
        return write!(out, "{name}");
    }

    write!(out, "pn{{")?;
    for (i, chunk) in data.chunks_exact(4).take(count).enumerate() {
        let name = u32::from_ne_bytes(chunk.try_into().unwrap());
        if i > 0 {
            write!(out, " ")?;
        }
        write!(out, "{name}")?;
    }
    write!(out, "}}")
}

fn format_string(out: &mut dyn Write, data: &[u8]) -> io::Result<()> {
    let text = String::from_utf8_lossy(data);
    let text = text.trim_end_matches('\0');
    write!(out, "\"{text}\"")
}

macro_rules! format_int_width {
    ($out:ident, $data:ident, $count:ident, $ty:ty) => {{
        let mut iter = $data
            .chunks_exact(std::mem::size_of::<$ty>())
            .take($count)
            .map(|c| <$ty>::from_ne_bytes(c.try_into().unwrap()));

        if $count > 1 {
            write!($out, "{{")?;
        }
        for (i, value) in iter.by_ref().enumerate() {
            if i > 0 {
                write!($out, " ")?;
            }
            write!($out, "{value}")?;
        }
        if $count > 1 {
            write!($out, "}}")?;
        }
        Ok(Some(()))
    }};
}

fn format_integers(
    out: &mut dyn Write,
    data: &[u8],
    count: usize,
    eltsize: usize,
) -> io::Result<Option<()>> {
    match eltsize {
        1 => format_int_width!(out, data, count, i8),
        2 => format_int_width!(out, data, count, i16),
        4 => format_int_width!(out, data, count, i32),
        8 => format_int_width!(out, data, count, i64),
        _ => Ok(None),
    }
}

fn format_reals(out: &mut dyn Write, data: &[u8], count: usize, eltsize: usize) -> io::Result<bool> {
    match eltsize {
        4 => {
            if count > 1 {
                write!(out, "{{")?;
            }
            for (i, chunk) in data.chunks_exact(4).take(count).enumerate() {
                if i > 0 {
                    write!(out, " ")?;
                }
                write!(out, "{}", f32::from_ne_bytes(chunk.try_into().unwrap()))?;
            }
            if count > 1 {
                write!(out, "}}")?;
            }
            Ok(true)
        }
        8 => {
            if count > 1 {
                write!(out, "{{")?;
            }
            for (i, chunk) in data.chunks_exact(8).take(count).enumerate() {
                if i > 0 {
                    write!(out, " ")?;
                }
                write!(out, "{}", f64::from_ne_bytes(chunk.try_into().unwrap()))?;
            }
            if count > 1 {
                write!(out, "}}")?;
            }
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Prints the trailing inline body of a message that carries no typed descriptors at all (a
/// non-complex message, or data following the last descriptor of a complex one).
///
/// This crate's wire model has no equivalent of the classic inline `mach_msg_type_t` header MIG
/// emits before every scalar argument, so there is no real type name to pass [`format_scalar`];
/// [`UNTYPED_BYTES`] stands in for one, which always takes `format_scalar`'s fallback branch and
/// prints the same `type`/`nelt`/`eltsize`-annotated hex dump as any other unrecognized type.
pub fn format_raw_bytes(out: &mut dyn Write, data: &[u8]) -> io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }

    format_scalar(out, UNTYPED_BYTES, data, data.len(), 1)
}

fn format_fallback(
    out: &mut dyn Write,
    type_: mach_msg_type_name_t,
    data: &[u8],
    count: usize,
    eltsize: usize,
) -> io::Result<()> {
    let first_word = data
        .get(..4)
        .map(|b| u32::from_ne_bytes(b.try_into().unwrap()))
        .unwrap_or(0);

    write!(
        out,
        "{first_word:#x} (type {type_}, nelt {count}, eltsize {eltsize})"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(type_: mach_msg_type_name_t, data: &[u8], count: usize, eltsize: usize) -> String {
        let mut buf = Vec::new();
        format_scalar(&mut buf, type_, data, count, eltsize).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn test_single_port_name() {
        let data = 1337u32.to_ne_bytes();
        assert_eq!(render(MACH_MSG_TYPE_PORT_NAME, &data, 1, 4), "1337");
    }

    #[test]
    fn test_port_name_batch() {
        let mut data = vec![];
        data.extend(1u32.to_ne_bytes());
        data.extend(2u32.to_ne_bytes());
        assert_eq!(render(MACH_MSG_TYPE_PORT_NAME, &data, 2, 4), "pn{1 2}");
    }

    #[test]
    fn test_string() {
        assert_eq!(
            render(MACH_MSG_TYPE_STRING, b"hello\0", 6, 1),
            "\"hello\""
        );
    }

    #[test]
    fn test_integer_single() {
        let data = 42i32.to_ne_bytes();
        assert_eq!(render(MACH_MSG_TYPE_INTEGER_32, &data, 1, 4), "42");
    }

    #[test]
    fn test_integer_batch() {
        let mut data = vec![];
        data.extend(1i32.to_ne_bytes());
        data.extend((-2i32).to_ne_bytes());
        assert_eq!(render(MACH_MSG_TYPE_INTEGER_32, &data, 2, 4), "{1 -2}");
    }

    #[test]
    fn test_raw_bytes_empty_prints_nothing() {
        let mut buf = Vec::new();
        format_raw_bytes(&mut buf, &[]).unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_raw_bytes_short_slice() {
        let mut buf = Vec::new();
        format_raw_bytes(&mut buf, &[0xab]).unwrap();
        let out = String::from_utf8(buf).unwrap();
        assert!(out.contains("nelt 1"));
        assert!(out.contains("eltsize 1"));
    }

    #[test]
    fn test_fallback_never_panics() {
        let data = 0xdeadbeefu32.to_ne_bytes();
        let out = render(0xffff, &data, 1, 4);
        assert!(out.contains("type"));
        assert!(out.contains("nelt"));
        assert!(out.contains("eltsize"));
    }
}
