//! Purpose: `ckpool` CLI entry point and command dispatch.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Commands emit pretty JSON on stdout; diagnostics go to stderr.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::error::Error as StdError;
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::error::ErrorKind as ClapErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::aot::Shell;
use serde_json::{Map, Value, json};
use tracing_subscriber::EnvFilter;

mod inspect_json;
mod record;

use ckpool::api::{Error, ErrorKind, to_exit_code};
use inspect_json::inspect_chunk;
use record::{RecordArgs, run_record};

#[derive(Parser)]
#[command(
    name = "ckpool",
    version,
    about = "Checkpoint buffer manager for trace recordings",
    long_about = None,
    after_help = r#"EXAMPLES
  $ ckpool record --out /tmp/rec --threads 8 --chunks 3
  $ ckpool inspect /tmp/rec/chunk-0001.ckp --constants

Set RUST_LOG (e.g. RUST_LOG=ckpool=debug) for diagnostics on stderr."#
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Run a synthetic recording and write chunk files",
        long_about = r#"Run a synthetic recording and write chunk files.

Carrier threads write checkpoints concurrently, virtual threads write
thread-identity checkpoints, and the recorder rotates once per chunk into
DIR/chunk-NNNN.ckp. A JSON summary is printed to stdout."#
    )]
    Record {
        #[arg(long, help = "Output directory for chunk files")]
        out: PathBuf,
        #[arg(long, help = "Recorder options as JSON")]
        config: Option<PathBuf>,
        #[arg(long, default_value_t = 4, help = "Carrier threads")]
        threads: usize,
        #[arg(long, default_value_t = 0, help = "Virtual threads per carrier")]
        virtual_threads: usize,
        #[arg(long, default_value_t = 100, help = "Checkpoints per carrier per chunk")]
        checkpoints_per_thread: u64,
        #[arg(long, default_value_t = 256, help = "Payload bytes per checkpoint")]
        payload_bytes: usize,
        #[arg(long, default_value_t = 1, help = "Chunks to rotate through")]
        chunks: usize,
        #[arg(long, help = "Override thread-local buffer size in bytes")]
        thread_buffer_size: Option<usize>,
    },
    #[command(about = "Summarize a chunk file as JSON")]
    Inspect {
        #[arg(help = "Chunk file path")]
        file: PathBuf,
        #[arg(long, help = "Include resolved constants and thread records")]
        constants: bool,
    },
    #[command(
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ ckpool completion bash > ~/.local/share/bash-completion/completions/ckpool
  $ ckpool completion zsh > ~/.zfunc/_ckpool"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<i32, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let code = if err.kind() == ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                {
                    2
                } else {
                    0
                };
                return Ok(code);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("run `ckpool --help` for usage"));
            }
        },
    };

    match cli.command {
        Command::Record {
            out,
            config,
            threads,
            virtual_threads,
            checkpoints_per_thread,
            payload_bytes,
            chunks,
            thread_buffer_size,
        } => {
            let args = RecordArgs {
                out,
                config,
                threads,
                virtual_threads,
                checkpoints_per_thread,
                payload_bytes,
                chunks,
                thread_buffer_size,
            };
            emit_json(&run_record(&args).map_err(add_hint)?);
            Ok(0)
        }
        Command::Inspect { file, constants } => {
            emit_json(&inspect_chunk(&file, constants).map_err(add_hint)?);
            Ok(0)
        }
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "ckpool", &mut io::stdout());
            Ok(0)
        }
    }
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim_start_matches("error: ").trim().to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

fn add_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Busy => {
            err.with_hint("another recorder holds this chunk; wait for it to finish")
        }
        ErrorKind::Corrupt => {
            err.with_hint("the chunk may be truncated or was not written by ckpool")
        }
        ErrorKind::Exhausted => err.with_hint("raise buffer limits in the --config options"),
        ErrorKind::EpochViolation => err.with_hint("this is a recorder bug; please report it"),
        _ => err,
    }
}

fn emit_json(value: &Value) {
    let json = serde_json::to_string_pretty(value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Exhausted => "buffer memory exhausted".to_string(),
        ErrorKind::EpochViolation => "epoch invariant violated".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(offset) = err.offset() {
        lines.push(format!("offset: {offset}"));
    }
    if let Some(cause) = error_causes(err).first() {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}
