//! The forward loop: the single worker that receives every message addressed to a wrapper,
//! rewrites it, prints a trace line, and resends it to the real destination, plus the
//! [`TraceWriter`] that owns the trace output stream and the "line left open awaiting a reply"
//! state machine.
//!
//! Requests and replies share the same forward mechanics (look up the wrapper, rewrite the
//! header and body, resend to `forward`): a reply is just a message that happens to arrive
//! through a send-once wrapper instead of a send wrapper, and happens to be going back to
//! whoever made the original call instead of onward to a service. Only the trace text differs
//! between the two; see DESIGN.md for why this crate doesn't fork the forwarding code path on
//! request vs. reply.

use crate::{
    bucket::Bucket,
    msg::{Buffer, Builder, DescOrBodyParser, MsgId, ParsedMsgHdr},
    registry::Registry,
    rewrite,
    rights::AnySendRight,
    wrapper::{WrapperRef, WrapperState},
};
use mach2::{
    message::{
        MACH_MSG_TYPE_MOVE_SEND_ONCE, MACH_NOTIFY_DEAD_NAME, MACH_NOTIFY_NO_SENDERS,
        MACH_NOTIFY_SEND_ONCE,
    },
    port::mach_port_t,
};
use std::io::{self, Write};
use std::rc::Rc;
use std::time::Duration;

/// Send-buffer capacity: generous enough for the inline bodies this tracer ever forwards (it
/// never decodes OOL payloads beyond what the walker already copies through), re-allocated once
/// per message rather than reused, since a trace tool has no reason to chase the last allocation.
const SEND_BUFFER_CAPACITY: usize = 4096;

/// How long the loop keeps draining once the traced child's task port has gone dead, before the
/// process exits out from under anything still arriving.
const EXIT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// The receive-side port of the last request line left unterminated: a subsequent reply on
/// exactly this port closes the line with `=`; any other message first flushes it with `...`.
struct OpenLine {
    expected_port: mach_port_t,
}

/// Owns the trace output stream and the single "line left open awaiting a reply" slot.
///
/// Line-buffered: every `write!` below ends either mid-line (awaiting a reply) or with `\n`, and
/// the caller is expected to hand this a `Write`
/// that doesn't add its own buffering surprises (a `File` or `Stderr`, both unbuffered enough
/// that a trailing `\n` is effectively a flush point for a human tailing the file).
pub struct TraceWriter {
    out: Box<dyn Write>,
    open: Option<OpenLine>,
}

impl TraceWriter {
    /// Creates a writer over `out`.
    pub fn new(out: Box<dyn Write>) -> Self {
        TraceWriter { out, open: None }
    }

    /// Starts a request line: `<sender>-><msgid> (<args>)`. If `expected_port` is `Some`, the
    /// line is left unterminated awaiting the matching reply; otherwise (simpleroutine) it is
    /// immediately closed with `;`.
    fn request_line(
        &mut self,
        sender: &str,
        msgid: MsgId,
        args: &str,
        expected_port: Option<mach_port_t>,
    ) -> io::Result<()> {
        write!(self.out, "{sender}->{msgid} ({args})")?;

        match expected_port {
            Some(expected_port) => {
                self.open = Some(OpenLine { expected_port });
            }
            None => {
                writeln!(self.out, ";")?;
                self.open = None;
            }
        }

        self.out.flush()
    }

    /// Closes or flushes the open line (if any belongs to `reply_port`) and prints the reply.
    /// `label` is the reply wrapper's trace name (e.g. `reply(5:2000)`).
    fn reply_line(
        &mut self,
        reply_port: mach_port_t,
        label: &str,
        expected_msgid: MsgId,
        got_msgid: MsgId,
        retcode: i32,
    ) -> io::Result<()> {
        let belongs_to_open_line = self
            .open
            .as_ref()
            .is_some_and(|open| open.expected_port == reply_port);

        if belongs_to_open_line {
            self.open = None;
            if got_msgid == expected_msgid {
                writeln!(self.out, " = {retcode}")?;
            } else {
                writeln!(self.out, " > {reply_port} ...")?;
                writeln!(self.out, "{label}{reply_port} >({got_msgid}) {retcode}")?;
            }
        } else {
            if self.open.take().is_some() {
                writeln!(self.out, "...")?;
            }
            writeln!(self.out, "{label}{reply_port} >({got_msgid}) {retcode}")?;
        }

        self.out.flush()
    }

    /// Prints the child-exit footer.
    pub fn child_exited(&mut self, pid: libc::pid_t, code: i32) -> io::Result<()> {
        if self.open.take().is_some() {
            writeln!(self.out, "...")?;
        }
        writeln!(self.out, "Child {pid} exited with {code}")?;
        self.out.flush()
    }

    /// Prints the child-killed-by-signal footer.
    pub fn child_signaled(&mut self, pid: libc::pid_t, signal_name: &str) -> io::Result<()> {
        if self.open.take().is_some() {
            writeln!(self.out, "...")?;
        }
        writeln!(self.out, "Child {pid} {signal_name}")?;
        self.out.flush()
    }
}

/// Fatal, non-asserted kernel failures the forward loop reports before terminating the process:
/// any failure here is unrecoverable, so it terminates the tracer process outright.
pub fn fatal_kernel_error(operation: &str, detail: &dyn std::fmt::Display) -> ! {
    tracing::error!(operation, %detail, "fatal kernel error in forward loop");
    eprintln!("rpctrace: {operation}: {detail}");
    std::process::exit(2);
}

fn wrapper_label(wrapper: &WrapperRef) -> String {
    let w = wrapper.borrow();
    w.name()
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| w.raw_receive_name().to_string())
}

fn is_notification(msg_id: MsgId) -> bool {
    matches!(
        msg_id,
        MACH_NOTIFY_DEAD_NAME | MACH_NOTIFY_NO_SENDERS | MACH_NOTIFY_SEND_ONCE
    )
}

/// The minimum body length a classic MIG reply header's `RetCode` field occupies: this crate's
/// descriptor-based wire model carries no inline `mach_msg_type_t` tag to compare against the
/// canonical `RetCodeType`, so a reply is recognized by shape alone — no reply right attached and
/// a non-complex body long enough to hold one.
const RETCODE_LEN: usize = 4;

/// Whether a received, about-to-be-forwarded message looks like an RPC reply rather than a
/// request: no reply right of its own, and a plain (non-complex) body at least as long as a
/// `RetCode`. This mirrors the shape check against `msgh_local_port`/`RetCodeType`, not which kind
/// of wrapper the message happened to arrive through — a request can legitimately arrive via a
/// send-once wrapper (one minted for a send-once right found nested in some earlier message's
/// body), and a reply always arrives via a send-once wrapper but isn't identified by that alone.
fn is_reply_shaped(header: &ParsedMsgHdr, desc_or_body: &DescOrBodyParser) -> bool {
    header.reply_right.is_none()
        && matches!(desc_or_body, DescOrBodyParser::Body(body) if body.body().len() >= RETCODE_LEN)
}

fn signal_name(signal: libc::c_int) -> &'static str {
    match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGBUS => "SIGBUS",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGSYS => "SIGSYS",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        _ => "signal",
    }
}

/// Single-threaded engine driving the receive/trace/resend cycle.
///
/// Every field here is touched from exactly one worker thread; the struct itself holds no
/// `Send`/`Sync` bound weaker than that assumption requires since `WrapperRef = Rc<RefCell<_>>`
/// is neither `Send` nor `Sync` — the whole engine, not just its fields, must stay pinned to the
/// thread that constructs it.
pub struct ForwardLoop {
    bucket: Bucket,
    registry: Registry,
    trace: TraceWriter,
}

impl ForwardLoop {
    /// Builds an engine around an already-populated bucket/registry (the spawner has already
    /// installed the child's task-port wrapper by the time this runs) and a trace sink.
    pub fn new(bucket: Bucket, registry: Registry, trace: TraceWriter) -> Self {
        ForwardLoop {
            bucket,
            registry,
            trace,
        }
    }

    /// Runs the receive/trace/resend cycle until `task_wrapper`'s dead-name notification arrives
    /// (the traced child's task port going away, which happens when the child exits), then reaps
    /// `pid`, prints the exit footer, and ends the process itself — there is no cooperative
    /// cancellation otherwise, and no other thread is waiting to do it.
    pub fn run_until_child_exits(&mut self, pid: libc::pid_t, task_wrapper: &WrapperRef) -> ! {
        let mut recv_buffer = Buffer::with_capacity(SEND_BUFFER_CAPACITY);

        loop {
            let (wrapper, parser) = match self.bucket.receive(&mut recv_buffer) {
                Ok(pair) => pair,
                Err(err) => fatal_kernel_error("mach_msg_receive", &err),
            };

            let (header, desc_or_body) = parser.parse_header();

            if header.local_disposition == MACH_MSG_TYPE_MOVE_SEND_ONCE && is_notification(header.id) {
                let is_child_death = Rc::ptr_eq(&wrapper, task_wrapper);
                self.handle_notification(wrapper);
                if is_child_death {
                    self.finish(pid);
                }
                continue;
            }

            if is_reply_shaped(&header, &desc_or_body) {
                self.handle_reply(wrapper, header.id, desc_or_body);
            } else {
                self.handle_request(wrapper, header.id, header.reply_right, desc_or_body);
            }
        }
    }

    /// Reaps `pid`, prints the matching footer, and ends the process after the grace period.
    fn finish(&mut self, pid: libc::pid_t) -> ! {
        let mut status: libc::c_int = 0;
        let wait_result = unsafe { libc::waitpid(pid, &mut status, 0) };

        if wait_result < 0 {
            fatal_kernel_error("waitpid", &io::Error::last_os_error());
        }

        let exit_code = if libc::WIFSIGNALED(status) {
            let signal = libc::WTERMSIG(status);
            let _ = self.trace.child_signaled(pid, signal_name(signal));
            128 + signal
        } else {
            let code = libc::WEXITSTATUS(status);
            let _ = self.trace.child_exited(pid, code);
            code
        };

        std::thread::sleep(EXIT_GRACE_PERIOD);
        std::process::exit(exit_code);
    }

    fn handle_notification(&mut self, wrapper: WrapperRef) {
        rewrite::destroy(wrapper, &mut self.registry, &mut self.bucket);
    }

    fn handle_reply(&mut self, wrapper: WrapperRef, got_msgid: MsgId, desc_or_body: DescOrBodyParser) {
        let sent_msgid = match wrapper.borrow().state() {
            WrapperState::SendOnce(s) => s.sent_msgid,
            _ => unreachable!("a reply-shaped message must arrive through a send-once wrapper"),
        };

        let body = match desc_or_body {
            DescOrBodyParser::Body(body) => body,
            DescOrBodyParser::Descriptor(_) => {
                unreachable!("a reply carrying descriptors ahead of its RetCode is not supported")
            }
        };

        let bytes = body.body();
        assert!(bytes.len() >= 4, "reply body shorter than a RetCode");
        let retcode = i32::from_ne_bytes(bytes[..4].try_into().unwrap());

        let label = wrapper_label(&wrapper);
        let reply_port = wrapper.borrow().raw_receive_name();
        let forward = wrapper.borrow_mut().take_send_once_forward();

        let mut send_buffer = Buffer::with_capacity(SEND_BUFFER_CAPACITY);
        let mut builder = Builder::new(&mut send_buffer);
        builder.set_id(got_msgid);
        builder.append_inline_data(&retcode.to_ne_bytes());

        match forward.send(builder) {
            Ok(()) => {}
            Err(err) if err.kind() == crate::msg::SendErrorKind::InvalidDest => {
                tracing::debug!("reply destination died before delivery, discarding");
            }
            Err(err) => fatal_kernel_error("mach_msg_send (reply)", &err),
        }

        self.trace
            .reply_line(reply_port, &label, sent_msgid + 100, got_msgid, retcode)
            .expect("trace output write failed");

        rewrite::reclaim(wrapper, &mut self.registry, &mut self.bucket);
    }

    fn handle_request(
        &mut self,
        wrapper: WrapperRef,
        msgid: MsgId,
        reply_right: Option<AnySendRight>,
        desc_or_body: DescOrBodyParser,
    ) {
        let pass_through = rewrite::is_pass_through(msgid);
        let sender = wrapper_label(&wrapper);

        // Shape-based reply/request classification means a request can legitimately arrive
        // through a send-once wrapper minted for a send-once right nested in an earlier message's
        // body (not just the message's own reply slot); forwarding has to work either way.
        let was_send_once = wrapper.borrow().is_send_once();
        let forward = wrapper.borrow_mut().forward_for_send();

        let mut send_buffer = Buffer::with_capacity(SEND_BUFFER_CAPACITY);
        let mut builder = Builder::new(&mut send_buffer);
        builder.set_id(msgid);

        let mut args = Vec::new();
        let mut expected_port = None;

        match reply_right {
            Some(AnySendRight::Send(right)) => {
                let (outgoing, reply_wrapper) =
                    rewrite::rewrite_send(right, &mut self.registry, &mut self.bucket);
                let raw = reply_wrapper.borrow().raw_receive_name();
                if reply_wrapper.borrow().name().is_none() {
                    reply_wrapper
                        .borrow_mut()
                        .set_name(format!("reply({raw}:{msgid})"));
                }
                write!(&mut args, "{}", reply_wrapper.borrow().name().unwrap()).unwrap();
                expected_port = Some(raw);
                builder.set_moved_reply_port(outgoing);
            }
            Some(AnySendRight::SendOnce(right)) => {
                let (outgoing, reply_wrapper) =
                    rewrite::rewrite_send_once(right, &mut self.registry, &mut self.bucket, msgid);
                let raw = reply_wrapper.borrow().raw_receive_name();
                if reply_wrapper.borrow().name().is_none() {
                    reply_wrapper
                        .borrow_mut()
                        .set_name(format!("reply({raw}:{msgid})"));
                }
                write!(&mut args, "{}", reply_wrapper.borrow().name().unwrap()).unwrap();
                expected_port = Some(raw);
                builder.set_moved_reply_port(outgoing);
            }
            None => {}
        }

        if !args.is_empty() {
            args.push(b' ');
        }
        crate::walk::walk_message(
            desc_or_body,
            &mut builder,
            &mut self.registry,
            &mut self.bucket,
            pass_through,
            &mut args,
        )
        .expect("trace output write failed");
        while args.last() == Some(&b' ') {
            args.pop();
        }

        match forward.send(builder) {
            Ok(()) => {}
            Err(err) if err.kind() == crate::msg::SendErrorKind::InvalidDest => {
                tracing::debug!("request destination died before delivery, discarding");
            }
            Err(err) => fatal_kernel_error("mach_msg_send (request)", &err),
        }

        let args_text = String::from_utf8_lossy(&args);
        self.trace
            .request_line(&sender, msgid, &args_text, expected_port)
            .expect("trace output write failed");

        if was_send_once {
            rewrite::reclaim(wrapper, &mut self.registry, &mut self.bucket);
        }
    }
}
