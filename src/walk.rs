//! The message walker: iterates a received message's typed descriptors, dispatches port-right
//! descriptors to the rewriter and scalar payloads to the formatter, and mirrors the walked
//! contents into the message being built for resend.
//!
//! Every rewrite function in [`crate::rewrite`] already returns an owned right of a single,
//! uniform kind for a whole batch (a [`PortArrayRights::Send`] batch always rewrites to a
//! `Vec<SendRight>`, never a mix of kinds), so normalizing a polymorphic batch is satisfied by
//! construction here rather than by a separate pass: see DESIGN.md.

use crate::{
    bucket::Bucket,
    format,
    msg::{
        builder::Builder,
        parser::{BodyParser, DescOrBodyParser, ParsedMsgDesc, PortArrayRights},
    },
    registry::Registry,
    rewrite,
    traits::AsRawName,
};
use mach2::port::{mach_port_t, MACH_PORT_DEAD, MACH_PORT_NULL};
use std::io::{self, Write};

fn write_port_name(out: &mut dyn Write, raw: mach_port_t, label: Option<&str>) -> io::Result<()> {
    if raw == MACH_PORT_NULL {
        write!(out, "(null)")
    } else if raw == MACH_PORT_DEAD {
        write!(out, "(dead)")
    } else if let Some(label) = label {
        write!(out, "{label}")
    } else {
        write!(out, "{raw}")
    }
}

fn walk_descriptor(
    desc: ParsedMsgDesc,
    builder: &mut Builder,
    registry: &mut Registry,
    bucket: &mut Bucket,
    pass_through: bool,
    out: &mut dyn Write,
) -> io::Result<()> {
    match desc {
        ParsedMsgDesc::PortSend(right) => {
            let raw = right.as_raw_name();
            if raw == MACH_PORT_NULL || raw == MACH_PORT_DEAD {
                write_port_name(out, raw, None)?;
                builder.append_moved_right(right);
                return Ok(());
            }

            let (outgoing, wrapper) = rewrite::rewrite_send(right, registry, bucket);
            write_port_name(out, outgoing.as_raw_name(), wrapper.borrow().name())?;
            builder.append_moved_right(outgoing);
        }
        ParsedMsgDesc::PortSendOnce(right) => {
            let raw = right.as_raw_name();
            if raw == MACH_PORT_NULL || raw == MACH_PORT_DEAD {
                write_port_name(out, raw, None)?;
                builder.append_moved_right(right);
                return Ok(());
            }

            let (outgoing, wrapper) =
                rewrite::rewrite_send_once(right, registry, bucket, 0);
            write_port_name(out, outgoing.as_raw_name(), wrapper.borrow().name())?;
            builder.append_moved_right(outgoing);
        }
        ParsedMsgDesc::PortRecv(right) => {
            let raw = right.as_raw_name();
            if raw == MACH_PORT_NULL || raw == MACH_PORT_DEAD {
                write_port_name(out, raw, None)?;
                builder.append_moved_right(right);
                return Ok(());
            }

            let (outgoing, wrapper) = rewrite::rewrite_receive(right, registry, bucket);
            write_port_name(out, outgoing.as_raw_name(), wrapper.borrow().name())?;
            builder.append_moved_right(outgoing);
        }
        ParsedMsgDesc::PortName(raw) => {
            // Never rewritten; whether we even attempt a friendly-name lookup depends on whether
            // this integer denotes one of our own ports or a name in some other task's space
            // (the pass-through edge case).
            let label = if pass_through {
                None
            } else {
                registry
                    .find(raw)
                    .or_else(|| bucket.find_by_receive(raw))
                    .and_then(|w| w.borrow().name().map(ToOwned::to_owned))
            };
            write_port_name(out, raw, label.as_deref())?;
            builder.append_port_name(raw);
        }
        ParsedMsgDesc::OolData(data) => {
            format::format_raw_bytes(out, data.as_slice())?;
            builder.append_consumed_ool_data(data, crate::msg::builder::CopyKind::Virtual);
        }
        ParsedMsgDesc::OolPorts(rights) => walk_port_array(rights, builder, registry, bucket, out)?,
    }

    Ok(())
}

fn walk_port_array(
    rights: PortArrayRights,
    builder: &mut Builder,
    registry: &mut Registry,
    bucket: &mut Bucket,
    out: &mut dyn Write,
) -> io::Result<()> {
    let count = match &rights {
        PortArrayRights::Send(v) => v.len(),
        PortArrayRights::SendOnce(v) => v.len(),
        PortArrayRights::Receive(v) => v.len(),
    };

    if count > 1 {
        write!(out, "{{")?;
    }

    match rights {
        PortArrayRights::Send(rights) => {
            let mut outgoing = Vec::with_capacity(rights.len());
            for (i, right) in rights.into_iter().enumerate() {
                if i > 0 {
                    write!(out, " ")?;
                }
                let raw = right.as_raw_name();
                if raw == MACH_PORT_NULL || raw == MACH_PORT_DEAD {
                    write_port_name(out, raw, None)?;
                    outgoing.push(right);
                    continue;
                }
                let (new_right, wrapper) = rewrite::rewrite_send(right, registry, bucket);
                write_port_name(out, new_right.as_raw_name(), wrapper.borrow().name())?;
                outgoing.push(new_right);
            }
            builder.append_moved_port_array(outgoing);
        }
        PortArrayRights::SendOnce(rights) => {
            let mut outgoing = Vec::with_capacity(rights.len());
            for (i, right) in rights.into_iter().enumerate() {
                if i > 0 {
                    write!(out, " ")?;
                }
                let raw = right.as_raw_name();
                if raw == MACH_PORT_NULL || raw == MACH_PORT_DEAD {
                    write_port_name(out, raw, None)?;
                    outgoing.push(right);
                    continue;
                }
                let (new_right, wrapper) =
                    rewrite::rewrite_send_once(right, registry, bucket, 0);
                write_port_name(out, new_right.as_raw_name(), wrapper.borrow().name())?;
                outgoing.push(new_right);
            }
            builder.append_moved_port_array(outgoing);
        }
        PortArrayRights::Receive(rights) => {
            let mut outgoing = Vec::with_capacity(rights.len());
            for (i, right) in rights.into_iter().enumerate() {
                if i > 0 {
                    write!(out, " ")?;
                }
                let raw = right.as_raw_name();
                if raw == MACH_PORT_NULL || raw == MACH_PORT_DEAD {
                    write_port_name(out, raw, None)?;
                    outgoing.push(right);
                    continue;
                }
                let (new_right, wrapper) = rewrite::rewrite_receive(right, registry, bucket);
                write_port_name(out, new_right.as_raw_name(), wrapper.borrow().name())?;
                outgoing.push(new_right);
            }
            builder.append_moved_port_array(outgoing);
        }
    }

    if count > 1 {
        write!(out, "}}")?;
    }

    Ok(())
}

fn write_inline_body(
    body: BodyParser,
    builder: &mut Builder,
    first: bool,
    out: &mut dyn Write,
) -> io::Result<()> {
    let bytes = body.body();

    if !bytes.is_empty() {
        if !first {
            write!(out, " ")?;
        }
        format::format_raw_bytes(out, bytes)?;
    }

    builder.append_inline_data(bytes);
    Ok(())
}

/// Walks every descriptor (and any trailing inline body) of a received message, rewriting port
/// rights and mirroring each element into `builder` for resend, and renders a trace fragment for
/// each element into `out`, space-separated with no leading or trailing space.
///
/// `pass_through` marks messages whose remote id identifies a pass-through operation: port-name
/// elements are still printed and forwarded, but never looked up against our own wrapper state
/// for a friendly label, since the integers belong to a foreign name space.
pub fn walk_message(
    mut next: DescOrBodyParser,
    builder: &mut Builder,
    registry: &mut Registry,
    bucket: &mut Bucket,
    pass_through: bool,
    out: &mut dyn Write,
) -> io::Result<()> {
    let mut first = true;

    loop {
        match next {
            DescOrBodyParser::Descriptor(parser) => {
                let (desc, rest) = parser.next();
                if !first {
                    write!(out, " ")?;
                }
                first = false;
                walk_descriptor(desc, builder, registry, bucket, pass_through, out)?;
                next = rest;
            }
            DescOrBodyParser::Body(body) => {
                write_inline_body(body, builder, first, out)?;
                break;
            }
        }
    }

    Ok(())
}
