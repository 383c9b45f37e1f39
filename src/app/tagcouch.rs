use anyhow::{bail, Context, Result};
use clap::Parser;
use glob::glob;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tagcouch::cmd::{Args, Commands};
use tagcouch::codec::BinaryReader;
use tagcouch::store::{DocumentStore, FileStorage, StoreOptions};
use tagcouch::tag::{ByteRange, DecodedTag, FileFetcher, RangeFetcher, TagDecoder};
use tagcouch::workload;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_options(config: Option<&Path>) -> Result<StoreOptions> {
    match config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Ok(StoreOptions::from_json(&json)?)
        }
        None => Ok(StoreOptions::default()),
    }
}

fn input_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let files: Vec<PathBuf> = glob(pattern)?.flatten().filter(|p| p.is_file()).collect();
    if files.is_empty() {
        warn!("no files match {pattern}");
    }
    Ok(files)
}

async fn open_store(db: &Path, args: &Args) -> Result<DocumentStore> {
    let options = load_options(args.config.as_deref())?;
    let storage = Arc::new(FileStorage::new(db));
    Ok(DocumentStore::open(args.name.clone(), storage, options).await?)
}

/// Decodes the tag of every file, skipping (and logging) the ones that fail.
async fn decode_all(
    decoder: &TagDecoder,
    files: &[PathBuf],
) -> Vec<(PathBuf, FileFetcher, DecodedTag)> {
    let mut decoded = Vec::with_capacity(files.len());
    for path in files {
        let fetcher = FileFetcher::new(path);
        let identity = path.display().to_string();
        match decoder.decode(&identity, &fetcher).await {
            Ok(tag) => decoded.push((path.clone(), fetcher, tag)),
            Err(err) => warn!("{identity}: {err}"),
        }
    }
    decoded
}

async fn print_tags(input: &str, raw: bool) -> Result<()> {
    let decoder = TagDecoder::standard();
    for (path, fetcher, tag) in decode_all(&decoder, &input_files(input)?).await {
        let mut out = json!({ "path": path.display().to_string(), "tag": tag });
        if raw {
            let range = match &tag.header {
                Some(header) => ByteRange::Head {
                    offset: 0,
                    length: header.size,
                },
                None => ByteRange::Tail { length: 128 },
            };
            let bytes = BinaryReader::new(fetcher.fetch(range).await?);
            out["raw"] = json!(bytes.to_encoded_string());
        }
        println!("{}", serde_json::to_string_pretty(&out)?);
    }
    Ok(())
}

async fn scan(input: &str, store: &DocumentStore) -> Result<()> {
    let decoder = TagDecoder::standard();
    let files = input_files(input)?;
    let songs: Vec<_> = decode_all(&decoder, &files)
        .await
        .iter()
        .filter_map(|(path, _, tag)| workload::song_document(&path.display().to_string(), tag))
        .collect();
    let skipped = files.len() - songs.len();

    let outcome = store.put_many(songs).await?;
    info!(written = outcome.written, skipped, "scan finished");
    println!(
        "Stored {} songs in `{}` ({} files skipped)",
        outcome.written,
        store.name(),
        skipped
    );
    Ok(())
}

async fn print_view(store: &DocumentStore, name: &str, args: &[String]) -> Result<()> {
    let definition = workload::named(name, args)?
        .definition(name)
        .on_finished(|_| {});
    let Some(view) = store.view(definition).await? else {
        bail!("workload `{name}` was refused by the store");
    };
    for (key, value) in view.rows() {
        println!("{}\t{}", serde_json::to_string(key)?, value);
    }
    info!(rows = view.len(), "view `{name}` computed");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    match &args.command {
        Commands::Tags { input, raw } => print_tags(input, *raw).await?,
        Commands::Scan { input, db } => {
            let store = open_store(db, &args).await?;
            scan(input, &store).await?;
        }
        Commands::View {
            db,
            workload,
            args: workload_args,
        } => {
            let store = open_store(db, &args).await?;
            let workload_args = workload_args.clone().unwrap_or_default();
            print_view(&store, workload, &workload_args).await?;
        }
        Commands::Wipe { db } => {
            let store = open_store(db, &args).await?;
            let count = store.len();
            store.wipe().await?;
            println!("Wiped {} documents from `{}`", count, store.name());
        }
    }

    Ok(())
}
