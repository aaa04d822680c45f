use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};

use mantar::compare::{check, check_tar, DeltaType, InodeDelta};
use mantar::keywords::{self, Keyword, KEYWORDS};
use mantar::{parse_spec, walk, DirectoryHierarchy};

// ── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "mantar",
    version,
    about = "Create and validate mtree-style directory hierarchy manifests,\n\
             from directory trees or tar archives.",
    long_about = None,
)]
struct Cli {
    /// Create a manifest (to -f FILE, or stdout)
    #[arg(short = 'c')]
    create: bool,

    /// Manifest file to validate against, or to write with -c
    #[arg(short = 'f', value_name = "PATH")]
    file: Option<PathBuf>,

    /// Root directory the manifest is relative to
    #[arg(short = 'p', value_name = "PATH", conflicts_with = "tar")]
    path: Option<PathBuf>,

    /// Validate against (or with -c, create from) a tar archive; `-` is stdin
    #[arg(short = 'T', value_name = "PATH")]
    tar: Option<String>,

    /// Use exactly these keywords (comma or space delimited)
    #[arg(short = 'k', value_name = "LIST")]
    use_keywords: Option<String>,

    /// Add keywords to the set in use
    #[arg(short = 'K', value_name = "LIST")]
    add_keywords: Option<String>,

    /// List supported keywords, marking the default and BSD subsets
    #[arg(long)]
    list_keywords: bool,

    /// List the keywords used by the manifest given with -f
    #[arg(long, requires = "file")]
    list_used: bool,

    /// Restrict the keyword set to what BSD mtree(8) understands
    #[arg(long)]
    bsd_keywords: bool,

    /// How to report validation results
    #[arg(long, value_enum, default_value = "bsd", value_name = "FMT")]
    result_format: ResultFormat,

    /// Debug logging (DEBUG=1 in the environment does the same)
    #[arg(long)]
    debug: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ResultFormat {
    /// One line per failed keyword, mtree(8)-style
    Bsd,
    /// A JSON array of per-path deltas
    Json,
    /// One affected path per line
    Path,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);
    match run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
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

/// Returns whether the run was clean (no validation failures).
fn run(cli: Cli) -> Result<bool> {
    if cli.list_keywords {
        cmd_list_keywords();
        return Ok(true);
    }

    let selected = selected_keywords(&cli);

    if cli.list_used {
        let dh = load_manifest(cli.file.as_deref().expect("clap requires -f"))?;
        for k in dh.used_keywords() {
            println!("{k}");
        }
        return Ok(true);
    }

    if cli.create {
        let dh = match &cli.tar {
            Some(tar) => ingest_archive(tar, &selected)?,
            None => {
                let root = cli.path.clone().unwrap_or_else(|| PathBuf::from("."));
                walk(&root, &[], &selected)
                    .with_context(|| format!("walking {}", root.display()))?
            }
        };
        match &cli.file {
            Some(path) => {
                let mut out = File::create(path)
                    .with_context(|| format!("cannot create {}", path.display()))?;
                dh.write_to(&mut out)?;
            }
            None => {
                dh.write_to(&mut io::stdout().lock())?;
            }
        }
        return Ok(true);
    }

    // Validation.
    let Some(file) = &cli.file else {
        bail!("validation needs a manifest; pass -f PATH (or -c to create one)");
    };
    let dh = load_manifest(file)?;

    // A narrowed comparison only happens when the caller asked for one.
    let narrowed = cli.use_keywords.is_some() || cli.add_keywords.is_some() || cli.bsd_keywords;
    let filter = narrowed.then_some(selected.as_slice());

    let deltas = match &cli.tar {
        Some(tar) => {
            let input = open_archive(tar)?;
            check_tar(input, &dh, filter).context("validating tar archive")?
        }
        None => {
            let root = cli.path.clone().unwrap_or_else(|| PathBuf::from("."));
            check(&root, &dh, filter)
                .with_context(|| format!("validating {}", root.display()))?
        }
    };

    report(&deltas, cli.result_format)?;
    Ok(deltas.is_empty())
}

// ── Commands ──────────────────────────────────────────────────────────────────

fn cmd_list_keywords() {
    println!("Available keywords:");
    for def in KEYWORDS {
        let mut line = format!("  {}", def.name);
        if def.default {
            line.push_str(" (default)");
        }
        if def.bsd {
            line.push_str(" (bsd)");
        }
        println!("{line}");
    }
}

fn report(deltas: &[InodeDelta], format: ResultFormat) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match format {
        ResultFormat::Bsd => {
            for delta in deltas {
                match delta.delta {
                    DeltaType::Missing => writeln!(out, "{:?}: missing", delta.path)?,
                    DeltaType::Extra => writeln!(out, "{:?}: extra", delta.path)?,
                    DeltaType::Modified => {
                        for key in &delta.keys {
                            writeln!(
                                out,
                                "{:?}: keyword {:?}: expected {}; got {}",
                                delta.path,
                                key.name.as_str(),
                                key.old.as_deref().unwrap_or("-"),
                                key.new.as_deref().unwrap_or("-"),
                            )?;
                        }
                    }
                }
            }
        }
        ResultFormat::Json => {
            serde_json::to_writer(&mut out, deltas)?;
            writeln!(out)?;
        }
        ResultFormat::Path => {
            for delta in deltas {
                writeln!(out, "{}", delta.path)?;
            }
        }
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn selected_keywords(cli: &Cli) -> Vec<Keyword> {
    let mut selected = match &cli.use_keywords {
        Some(list) => split_keyword_list(list),
        None => keywords::default_keywords(),
    };
    if let Some(list) = &cli.add_keywords {
        for k in split_keyword_list(list) {
            if !selected.contains(&k) {
                selected.push(k);
            }
        }
    }
    if cli.bsd_keywords {
        selected.retain(|k| k.is_bsd());
    }
    selected
}

fn split_keyword_list(list: &str) -> Vec<Keyword> {
    list.split([',', ' '])
        .filter(|s| !s.is_empty())
        .map(Keyword::new)
        .collect()
}

fn load_manifest(path: &Path) -> Result<DirectoryHierarchy> {
    let f = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    parse_spec(f).with_context(|| format!("parsing {}", path.display()))
}

fn open_archive(spec: &str) -> Result<Box<dyn Read + Send>> {
    if spec == "-" {
        return Ok(Box::new(io::stdin()));
    }
    let f = File::open(spec).with_context(|| format!("cannot open {spec}"))?;
    Ok(Box::new(f))
}

fn ingest_archive(spec: &str, keywords: &[Keyword]) -> Result<DirectoryHierarchy> {
    let input = open_archive(spec)?;
    let stream = mantar::tar::ingest_tar(input, keywords)?;
    let dh = stream
        .hierarchy()
        .with_context(|| format!("reading tar archive {spec}"))?;
    Ok(dh)
}
