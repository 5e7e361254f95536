//! Command-line argument parsing: `rpctrace [-o FILE] COMMAND [ARG...]`.
//!
//! `clap`'s derive API parses the `-o` flag; everything from the first non-flag argument onward
//! is treated as the traced command and its arguments, not re-parsed by `clap` — this mirrors the
//! original `argp` callback's `ARGP_KEY_ARG` behavior of slurping the rest of `argv` the moment it
//! sees the first positional argument, rather than trying to apply flag parsing to the child's
//! own arguments (which may themselves look like flags).

use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;

/// Traces the Mach RPCs a child command exchanges with the rest of the system.
#[derive(Debug, Parser)]
#[command(name = "rpctrace", version, about, disable_help_subcommand = true)]
pub struct Args {
    /// Send trace output to FILE instead of standard error.
    #[arg(short = 'o', long = "output", value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// The command to trace, and its arguments.
    ///
    /// Not marked `required` here: `clap` only ever sees the leading `-o FILE` tokens (see
    /// `parse_from_argv` below), never the command itself, so a `required` positional would
    /// always appear unsatisfied. `parse_from_argv` checks for an empty command after the fact
    /// instead.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<OsString>,
}

impl Args {
    /// Parses `rpctrace`'s command line from the process's real `argv`.
    ///
    /// Unlike a plain `Args::parse()`, this only lets `clap` see the leading `-o FILE` flag (if
    /// any) and slurps everything from the first non-flag argument into `command` without
    /// attempting to interpret it, so a traced command's own `-o`-looking arguments are never
    /// mistaken for ours.
    pub fn parse_for_trace() -> Self {
        let raw: Vec<OsString> = std::env::args_os().collect();
        Self::parse_from_argv(raw)
    }

    fn parse_from_argv(raw: Vec<OsString>) -> Self {
        let mut iter = raw.into_iter();
        let prog = iter.next().unwrap_or_else(|| OsString::from("rpctrace"));

        let mut leading = vec![prog];
        let mut rest = Vec::new();
        let mut in_command = false;

        for arg in iter {
            if in_command {
                rest.push(arg);
                continue;
            }

            let text = arg.to_string_lossy();
            if text == "-o" || text == "--output" {
                leading.push(arg);
            } else if let Some(value) = text.strip_prefix("--output=") {
                leading.push(OsString::from(format!("--output={value}")));
            } else if !text.starts_with('-') {
                in_command = true;
                rest.push(arg);
            } else {
                leading.push(arg);
            }
        }

        // If `-o`/`--output` was seen without its value yet attached, its value is the next raw
        // token; since clap parses `leading` on its own it still needs that value appended.
        if let Some(last) = leading.last() {
            if last == "-o" || last == "--output" {
                if let Some(value) = rest.first().cloned() {
                    leading.push(value);
                    rest.remove(0);
                }
            }
        }

        let mut args = match Args::try_parse_from(&leading) {
            Ok(args) => args,
            Err(err) => err.exit(),
        };
        args.command = rest;

        if args.command.is_empty() {
            use clap::CommandFactory;
            Args::command()
                .error(clap::error::ErrorKind::MissingRequiredArgument, "missing COMMAND to trace")
                .exit();
        }

        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_no_flag() {
        let args = Args::parse_from_argv(argv(&["rpctrace", "echo", "hi"]));
        assert_eq!(args.output, None);
        assert_eq!(args.command, argv(&["echo", "hi"]));
    }

    #[test]
    fn test_output_flag_separate() {
        let args = Args::parse_from_argv(argv(&["rpctrace", "-o", "out.txt", "echo", "hi"]));
        assert_eq!(args.output, Some(PathBuf::from("out.txt")));
        assert_eq!(args.command, argv(&["echo", "hi"]));
    }

    #[test]
    fn test_command_flags_not_consumed() {
        let args = Args::parse_from_argv(argv(&["rpctrace", "ls", "-la", "/tmp"]));
        assert_eq!(args.output, None);
        assert_eq!(args.command, argv(&["ls", "-la", "/tmp"]));
    }

    #[test]
    fn test_long_output_flag_equals() {
        let args = Args::parse_from_argv(argv(&["rpctrace", "--output=out.txt", "echo"]));
        assert_eq!(args.output, Some(PathBuf::from("out.txt")));
        assert_eq!(args.command, argv(&["echo"]));
    }
}
