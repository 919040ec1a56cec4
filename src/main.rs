//! Purpose: `bodybind` CLI entry point: run the echo server or decode one body.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
use std::io::{self, IsTerminal, Read};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use clap::{Args, Parser, Subcommand, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;

mod echo;
mod serve;

use bodybind::api::{
    Culture, DEFAULT_MAX_DEPTH, DEFAULT_MAX_ERRORS, DEFAULT_MEMORY_THRESHOLD, DecodeOptions,
    DecodingPipeline, Error, ErrorKind, PipelineConfig, to_exit_code,
};

const DEFAULT_MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;
const INPUT_CHUNK_BYTES: usize = 8 * 1024;

fn main() {
    let exit_code = match run() {
        Ok(code) => code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
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
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(exit_code);
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint("Run `bodybind --help` for usage."));
            }
        },
    };

    match cli.command {
        Command::Serve(args) => {
            let config = serve::ServeConfig {
                bind: args.bind.parse::<SocketAddr>().map_err(|err| {
                    Error::new(ErrorKind::Usage)
                        .with_message(format!("invalid --bind address: {}", args.bind))
                        .with_source(err)
                })?,
                allow_non_loopback: args.allow_non_loopback,
                max_body_bytes: args.max_body_bytes,
                pipeline: args.pipeline.into_config()?,
            };
            let runtime = build_runtime()?;
            runtime.block_on(serve::serve(config))?;
            Ok(0)
        }
        Command::Decode(args) => {
            serve::init_tracing();
            let input = read_input(args.input.as_ref())?;
            let pipeline = DecodingPipeline::new(args.pipeline.into_config()?)?;
            let content_length = Some(input.len() as u64);
            let runtime = build_runtime()?;
            let reply = runtime.block_on(echo::decode_echo(
                &pipeline,
                Some(args.content_type.as_str()),
                content_length,
                tokio_stream::iter(chunked(input)),
            ))?;
            emit_json(&reply);
            Ok(0)
        }
    }
}

#[derive(Parser)]
#[command(
    name = "bodybind",
    version,
    about = "Buffered, error-tolerant JSON request-body binding",
    long_about = None,
    after_help = r#"EXAMPLES
  $ bodybind serve --bind 127.0.0.1:9800
  $ curl -s -H 'content-type: application/json' -d '{"count":null,"name":"x"}' \
      http://127.0.0.1:9800/api/echo
  $ echo '{"count":"","tags":["a",1,"b"]}' | bodybind decode"#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Run the HTTP echo server (POST /api/echo)")]
    Serve(ServeArgs),
    #[command(about = "Decode one body from a file or stdin and print the echo reply")]
    Decode(DecodeArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1:9800", help = "Bind address", help_heading = "Connection")]
    bind: String,
    #[arg(long, help = "Allow non-loopback binds", help_heading = "Safety")]
    allow_non_loopback: bool,
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_BODY_BYTES,
        help = "Max request body size in bytes",
        help_heading = "Safety"
    )]
    max_body_bytes: u64,
    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[derive(Args)]
struct DecodeArgs {
    #[arg(help = "Input file (default: stdin)", value_hint = ValueHint::FilePath)]
    input: Option<PathBuf>,
    #[arg(
        long,
        default_value = "application/json",
        help = "Content type of the input, including any charset"
    )]
    content_type: String,
    #[command(flatten)]
    pipeline: PipelineArgs,
}

#[derive(Args)]
struct PipelineArgs {
    #[arg(
        long,
        default_value_t = DEFAULT_MEMORY_THRESHOLD,
        help = "Bodies larger than this are buffered to a temp file",
        help_heading = "Decoding"
    )]
    memory_threshold_bytes: usize,
    #[arg(long, help = "Show parser messages in field errors", help_heading = "Decoding")]
    allow_internal_error_messages: bool,
    #[arg(long, help = "Treat an empty body as an explicit empty value", help_heading = "Decoding")]
    treat_empty_body_as_default: bool,
    #[arg(long, value_name = "TAG", help = "Culture for numeric strings (e.g. de-DE)", help_heading = "Decoding")]
    culture: Option<String>,
    #[arg(long, default_value_t = DEFAULT_MAX_DEPTH, help = "Maximum JSON nesting depth", help_heading = "Decoding")]
    max_depth: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_ERRORS, help = "Field errors kept per body", help_heading = "Decoding")]
    max_errors: usize,
    #[arg(long, value_name = "MS", help = "Deadline for buffering one body", help_heading = "Decoding")]
    drain_timeout_ms: Option<u64>,
}

impl PipelineArgs {
    fn into_config(self) -> Result<PipelineConfig, Error> {
        let parsing_culture = self.culture.as_deref().map(Culture::from_tag).transpose()?;
        Ok(PipelineConfig {
            parsing_culture,
            max_depth: self.max_depth,
            max_errors: self.max_errors,
            options: DecodeOptions {
                memory_threshold_bytes: self.memory_threshold_bytes,
                allow_internal_error_messages: self.allow_internal_error_messages,
                treat_empty_body_as_default: self.treat_empty_body_as_default,
                drain_timeout: self.drain_timeout_ms.map(Duration::from_millis),
                ..DecodeOptions::default()
            },
            ..PipelineConfig::default()
        })
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime, Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })
}

fn read_input(path: Option<&PathBuf>) -> Result<Bytes, Error> {
    let mut data = Vec::new();
    match path {
        Some(path) => {
            data = std::fs::read(path).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message(format!("failed to read {}", path.display()))
                    .with_source(err)
            })?;
        }
        None => {
            io::stdin().read_to_end(&mut data).map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("failed to read stdin")
                    .with_source(err)
            })?;
        }
    }
    Ok(Bytes::from(data))
}

fn chunked(input: Bytes) -> Vec<io::Result<Bytes>> {
    (0..input.len())
        .step_by(INPUT_CHUNK_BYTES)
        .map(|start| Ok(input.slice(start..(start + INPUT_CHUNK_BYTES).min(input.len()))))
        .collect()
}

fn emit_json(value: &Value) {
    let json = serde_json::to_string_pretty(value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.trim_start_matches("error: ").to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
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
        ErrorKind::Io => "i/o error".to_string(),
        ErrorKind::Timeout => "timed out".to_string(),
        ErrorKind::Unsupported => "unsupported input".to_string(),
        ErrorKind::Syntax => "malformed json".to_string(),
        ErrorKind::Conversion => "invalid value".to_string(),
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
        inner.insert("path".to_string(), json!(path));
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
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}
