use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use medical_chatbot::config::AppConfig;
use medical_chatbot::db::Database;
use medical_chatbot::ingest::{is_pdf_filename, Ingestor};
use medical_chatbot::providers::Providers;

#[derive(Parser, Debug)]
#[command(name = "index-pdfs")]
#[command(about = "Index a directory of PDFs into the shared medical corpus")]
struct Cli {
    /// Directory searched recursively for *.pdf files.
    #[arg(default_value = "data")]
    directory: PathBuf,
    /// Keep going when a single file fails.
    #[arg(long, default_value_t = false)]
    keep_going: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    if !cli.directory.is_dir() {
        bail!("{} is not a directory", cli.directory.display());
    }

    let config = AppConfig::from_env();
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let db = Database::new(&config).await?;
    let providers = Providers::from_config(&config)?;
    let ingestor = Ingestor::new(&config, db, providers);

    let files = find_pdfs(&cli.directory);
    if files.is_empty() {
        println!("No PDF files found under {}", cli.directory.display());
        return Ok(());
    }

    let mut total_chunks = 0;
    let mut failed = 0;
    for path in &files {
        match ingestor.index_global(path).await {
            Ok(chunks) => {
                println!("[indexed] {} chunks={}", path.display(), chunks);
                total_chunks += chunks;
            }
            Err(err) if cli.keep_going => {
                eprintln!("[failed] {}: {err:#}", path.display());
                failed += 1;
            }
            Err(err) => return Err(err.context(format!("failed to index {}", path.display()))),
        }
    }

    println!(
        "Index complete. files={} failed={} chunks={}",
        files.len(),
        failed,
        total_chunks
    );

    Ok(())
}

fn find_pdfs(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::warn!("skipping unreadable entry: {err}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| is_pdf_filename(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
