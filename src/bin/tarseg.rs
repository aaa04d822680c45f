use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mantar::asm::assemble;
use mantar::disasm::split;
use mantar::storage::{
    DiscardFilePutter, JsonPacker, JsonUnpacker, PathFileGetter, PathFilePutter,
};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "tarseg",
    version,
    about = "Disassemble a tar stream into segment/file records and put it\n\
             back together again, byte for byte.",
    long_about = None,
)]
struct Cli {
    /// Debug logging (DEBUG=1 in the environment does the same)
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a tar stream into a record file plus stored payloads
    Disasm {
        /// Input archive (`-` for stdin); gzip input is inflated first
        input: String,

        /// Where to write the record stream (JSON, one record per line)
        #[arg(short = 'o', long, value_name = "FILE")]
        output: PathBuf,

        /// Directory to store file payloads under
        #[arg(long, value_name = "DIR", conflicts_with = "discard")]
        payloads: Option<PathBuf>,

        /// Checksum payloads but store nothing
        #[arg(long)]
        discard: bool,
    },

    /// Rebuild the original tar stream from records plus payloads
    Asm {
        /// Record stream produced by `disasm`
        #[arg(short = 'i', long, value_name = "FILE")]
        input: PathBuf,

        /// Directory holding the stored payloads
        #[arg(long, value_name = "DIR")]
        payloads: PathBuf,

        /// Where to write the tar stream (`-` for stdout)
        #[arg(short = 'o', long, value_name = "FILE", default_value = "-")]
        output: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);
    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging(debug: bool) {
    let debug = debug || std::env::var("DEBUG").map(|v| v == "1").unwrap_or(false);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if debug { "debug" } else { "warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Disasm {
            input,
            output,
            payloads,
            discard,
        } => cmd_disasm(&input, &output, payloads, discard),
        Commands::Asm {
            input,
            payloads,
            output,
        } => cmd_asm(&input, &payloads, &output),
    }
}

// ── disasm ────────────────────────────────────────────────────────────────────

fn cmd_disasm(
    input: &str,
    output: &PathBuf,
    payloads: Option<PathBuf>,
    discard: bool,
) -> Result<()> {
    let source = open_archive(input)?;
    let packer = JsonPacker::new(
        File::create(output).with_context(|| format!("cannot create {}", output.display()))?,
    );

    // The split stream yields the original bytes; nobody downstream wants
    // them here, so finish() just drains.
    if discard || payloads.is_none() {
        let stream = split(source, packer, DiscardFilePutter::new());
        stream.finish().context("splitting archive")?;
    } else {
        let dir = payloads.expect("checked above");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create {}", dir.display()))?;
        let stream = split(source, packer, PathFilePutter::new(dir));
        stream.finish().context("splitting archive")?;
    }
    Ok(())
}

fn open_archive(spec: &str) -> Result<Box<dyn Read + Send + 'static>> {
    if spec == "-" {
        return Ok(Box::new(io::stdin()));
    }
    let f = File::open(spec).with_context(|| format!("cannot open {spec}"))?;
    if spec.ends_with(".gz") || spec.ends_with(".tgz") {
        return Ok(Box::new(flate2::read::GzDecoder::new(f)));
    }
    Ok(Box::new(f))
}

// ── asm ───────────────────────────────────────────────────────────────────────

fn cmd_asm(input: &PathBuf, payloads: &PathBuf, output: &str) -> Result<()> {
    let records = File::open(input)
        .with_context(|| format!("cannot open {}", input.display()))?;
    let mut stream = assemble(
        PathFileGetter::new(payloads.clone()),
        JsonUnpacker::new(records),
    );

    let copied = match output {
        "-" => io::copy(&mut stream, &mut io::stdout().lock()),
        path => {
            let mut out = File::create(path)
                .with_context(|| format!("cannot create {path}"))?;
            io::copy(&mut stream, &mut out)
        }
    };

    // The producer's structured error beats the pipe's rendition of it.
    stream.finish().context("assembling archive")?;
    copied?;
    io::stdout().flush()?;
    Ok(())
}
