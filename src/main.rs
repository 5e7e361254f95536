//! `rpctrace` binary entry point: parses the command line, opens the trace output, and hands
//! both to a single worker thread that spawns the traced child and runs the forward loop for the
//! rest of the process's life.
//!
//! `Registry`/`Bucket`/`Wrapper` are built on `Rc<RefCell<_>>` and so cannot cross a thread
//! boundary; rather than construct them on the main thread and fail to hand them to a worker,
//! this binary does all Mach-facing work — spawning the child included — on the worker itself.
//! The main thread only learns whether the spawn succeeded and otherwise has nothing left to do:
//! the worker reaps the child, prints the exit footer, and ends the process itself once the
//! child's task port goes dead.

use rpctrace::{
    bucket::Bucket,
    cli::Args,
    error::{SpawnError, TraceError},
    registry::Registry,
    spawn,
    trace::{ForwardLoop, TraceWriter},
};
use std::{
    fs::OpenOptions,
    io::{self, Write},
    sync::mpsc,
};

fn open_output(args: &Args) -> Result<Box<dyn Write + Send>, TraceError> {
    match &args.output {
        Some(path) => {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(io::stderr())),
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Whether the worker thread's startup (resolving and spawning the traced command) succeeded.
enum Startup {
    Spawned,
    Failed(SpawnError),
}

fn run() -> Result<(), TraceError> {
    let args = Args::parse_for_trace();
    let out = open_output(&args)?;
    let command = args.command;

    let (startup_tx, startup_rx) = mpsc::channel::<Startup>();

    std::thread::spawn(move || {
        let mut bucket = Bucket::new();
        let mut registry = Registry::new();

        let child = match spawn::spawn(&command, &mut registry, &mut bucket) {
            Ok(child) => child,
            Err(err) => {
                let _ = startup_tx.send(Startup::Failed(err));
                return;
            }
        };

        tracing::info!(pid = child.pid, "traced child spawned");
        let _ = startup_tx.send(Startup::Spawned);
        drop(startup_tx);

        let trace = TraceWriter::new(out);
        let mut forward_loop = ForwardLoop::new(bucket, registry, trace);
        forward_loop.run_until_child_exits(child.pid, &child.task_wrapper);
    });

    match startup_rx.recv() {
        Ok(Startup::Spawned) => {
            // The worker thread owns the rest of the program's life from here: it reaps the
            // child, prints the exit footer, and calls `std::process::exit` itself. The main
            // thread has nothing further to do but get out of its way.
            loop {
                std::thread::park();
            }
        }
        Ok(Startup::Failed(err)) => Err(TraceError::Spawn(err)),
        Err(_) => Err(TraceError::Kernel(
            "worker thread exited before spawning the child".into(),
        )),
    }
}

fn main() {
    init_logging();

    if let Err(err) = run() {
        eprintln!("rpctrace: {err}");
        std::process::exit(err.exit_code());
    }
}
