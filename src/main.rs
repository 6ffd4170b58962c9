//! # docqa CLI
//!
//! Ask questions about a document from the command line, or serve the HTTP
//! API.
//!
//! ## Usage
//!
//! ```bash
//! docqa --config ./config/docqa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docqa serve` | Start the HTTP server |
//! | `docqa chunk <file>` | Extract and split a document, print the chunks |
//! | `docqa ask <file> "<question>"` | Index a document and answer one question |
//! | `docqa completions <shell>` | Print shell completions |
//!
//! Logs go to stderr and are controlled with `RUST_LOG`
//! (default `docqa=info`).

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use docqa::config::{self, Config};
use docqa::extract::extract_file;
use docqa::pipeline::{check_window, RagPipeline};
use docqa::server;
use docqa::session::Session;
use docqa_core::chunk::split_spans;

const DEFAULT_CONFIG: &str = "./config/docqa.toml";

/// docqa: retrieval-augmented question answering over a single document.
#[derive(Parser)]
#[command(name = "docqa", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/docqa.toml`; built-in defaults are used when
    /// that file does not exist. See `config/docqa.example.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Extract text from a document and print its chunks.
    ///
    /// No embedding is done; useful for tuning `chunk_size` and `overlap`.
    Chunk {
        /// Document to split (PDF, DOCX or plain text).
        file: PathBuf,
        /// Characters per chunk (overrides `[chunking].chunk_size`).
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Characters shared by neighbouring chunks (overrides `[chunking].overlap`).
        #[arg(long)]
        overlap: Option<usize>,
    },

    /// Index a document and answer a question about it.
    Ask {
        /// Document to ask about.
        file: PathBuf,
        /// The question.
        question: String,
        /// Number of chunks to retrieve (overrides `[retrieval].top_k`).
        #[arg(long)]
        top_k: Option<usize>,
        /// Print the answer as it is generated.
        #[arg(long)]
        stream: bool,
    },

    /// Print shell completions to stdout.
    Completions {
        shell: clap_complete::Shell,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("docqa=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// An explicit `--config` must exist; the default path is optional.
fn resolve_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_config(path),
        None if Path::new(DEFAULT_CONFIG).exists() => config::load_config(Path::new(DEFAULT_CONFIG)),
        None => Ok(Config::default()),
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    let flat: String = text
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .take(max_chars)
        .collect();
    if text.chars().count() > max_chars {
        format!("{}…", flat)
    } else {
        flat
    }
}

fn run_chunk(cfg: &Config, file: &Path, chunk_size: Option<usize>, overlap: Option<usize>) -> Result<()> {
    let text = extract_file(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let chunk_size = chunk_size.unwrap_or(cfg.chunking.chunk_size);
    let overlap = overlap.unwrap_or(cfg.chunking.overlap);
    check_window(chunk_size, overlap)?;
    let spans = split_spans(&text, chunk_size, overlap)?;

    println!(
        "{} chunks (chunk_size={}, overlap={}, {} chars)",
        spans.len(),
        chunk_size,
        overlap,
        text.chars().count()
    );
    println!("{:>5}  {:>8}  {:>6}  text", "index", "offset", "chars");
    for span in &spans {
        println!(
            "{:>5}  {:>8}  {:>6}  {}",
            span.index,
            span.char_offset,
            span.char_len(),
            preview(&span.text, 60)
        );
    }
    Ok(())
}

async fn run_ask(cfg: Config, file: &Path, question: &str, top_k: Option<usize>, stream: bool) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");

    let pipeline = Arc::new(RagPipeline::from_config(cfg)?);
    let session = Session::new(pipeline)?;
    let status = session.ingest(file_name, &bytes).await;
    if session.document_name().await.is_none() {
        session.close();
        bail!("{}", status);
    }
    eprintln!("{}", status);

    if stream {
        let mut answers = session.ask_stream(question, top_k).await;
        let mut printed = String::new();
        let mut stdout = std::io::stdout();
        while let Some(answer) = answers.next().await {
            match answer.strip_prefix(printed.as_str()) {
                Some(rest) => write!(stdout, "{}", rest)?,
                None => write!(stdout, "\n{}", answer)?,
            }
            stdout.flush()?;
            printed = answer;
        }
        println!();
    } else {
        println!("{}", session.ask(question, top_k).await);
    }
    session.close();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    // Commands that don't require config
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "docqa", &mut std::io::stdout());
        return Ok(());
    }

    let cfg = resolve_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => server::run_server(&cfg).await?,
        Commands::Chunk {
            file,
            chunk_size,
            overlap,
        } => run_chunk(&cfg, &file, chunk_size, overlap)?,
        Commands::Ask {
            file,
            question,
            top_k,
            stream,
        } => run_ask(cfg, &file, &question, top_k, stream).await?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}
