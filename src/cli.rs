use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP service
    Daemon {},

    /// Semantic search over the index
    Search {
        query: String,

        /// Maximum number of results
        #[clap(short = 'n', long)]
        max_results: Option<usize>,
    },

    /// Index chunked content
    Add {
        /// Source type: note, image, drawing, audio, document
        #[clap(short = 't', long = "type")]
        source_type: String,

        #[clap(long)]
        title: String,

        /// Reuse an existing content id to regenerate its chunks
        #[clap(long)]
        id: Option<String>,

        /// Raw file to store next to the chunks
        #[clap(short, long)]
        file: Option<PathBuf>,

        /// Comma separated tags
        #[clap(long)]
        tags: Option<String>,

        /// JSON array of chunks: `[{"text": "...", "metadata": {...}}]`
        chunks: PathBuf,
    },

    /// Remove content and all of its chunks
    Delete {
        #[clap(short = 't', long = "type")]
        source_type: String,

        content_id: String,
    },

    /// Compare with the remote version and refresh if stale
    Sync {
        /// Ignore the check interval
        #[clap(short, long, default_value = "false")]
        force: bool,
    },

    /// Local and remote versions
    Status {},

    /// List indexed sources
    Library {
        #[clap(short = 't', long = "type")]
        source_type: Option<String>,

        /// Only titles containing this text
        #[clap(short, long)]
        query: Option<String>,
    },

    /// Show a topic, content id or chunk id
    Topic { id: String },
}
