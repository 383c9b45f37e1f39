//! Command line arguments of the `tagcouch` binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Commands,

    /// Name of the store inside the database directory
    #[arg(short, long, global = true, default_value = "music")]
    pub name: String,

    /// JSON file with store options (chunk_size, breathe_ms, workers)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Decode the tags of audio files and print them as JSON
    Tags {
        /// Glob spec for the input files
        input: String,

        /// Also print the raw tag bytes, percent-encoded
        #[arg(long)]
        raw: bool,
    },
    /// Decode the tags of audio files and store them as song documents
    Scan {
        /// Glob spec for the input files
        #[arg(short, long)]
        input: String,

        /// Database directory
        #[arg(short, long)]
        db: PathBuf,
    },
    /// Compute a built-in view over the stored songs and print its rows
    View {
        /// Database directory
        #[arg(short, long)]
        db: PathBuf,

        /// Name of the workload: songs, artists, albums, genres or search
        #[arg(short, long)]
        workload: String,

        /// Auxiliary arguments to pass to the workload.
        #[clap(value_parser, last = true)]
        args: Option<Vec<String>>,
    },
    /// Delete every stored document
    Wipe {
        /// Database directory
        #[arg(short, long)]
        db: PathBuf,
    },
}
