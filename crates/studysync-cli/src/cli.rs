use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "studysync")]
#[command(about = "Offline-first sync for study data")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// CLI profile name for backend configuration
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Read and write documents in the local replica
    Doc {
        #[command(subcommand)]
        command: DocCommands,
    },
    /// Inspect and repair the offline change queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Drain queued changes and reconcile with the backend
    Sync {
        /// Only sync this source
        #[arg(long, value_name = "SOURCE")]
        source: Option<String>,
        #[command(subcommand)]
        command: Option<SyncCommands>,
    },
    /// List synced sources with their pending change counts
    Sources {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Configure CLI profiles
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum DocCommands {
    /// Create or replace a document
    Put {
        source: String,
        /// Document ID (generated when omitted; not accepted for single-document sources)
        #[arg(long)]
        id: Option<String>,
        /// Document body as a JSON object
        json: String,
    },
    /// Show one document
    Get {
        source: String,
        /// Document ID (omit for single-document sources)
        id: Option<String>,
    },
    /// List documents
    List {
        source: String,
        /// Equality filter on a top-level field, e.g. `subject_id=math`
        #[arg(long = "where", value_name = "FIELD=VALUE")]
        filters: Vec<String>,
        /// Number of documents to show
        #[arg(short, long)]
        limit: Option<usize>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete documents
    Delete {
        source: String,
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Pending changes in drain order
    List {
        #[arg(long, value_name = "SOURCE")]
        source: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Changes the backend refused
    Parked {
        #[arg(long, value_name = "SOURCE")]
        source: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Move a parked change back onto its queue
    Retry {
        /// Change id
        id: String,
    },
    /// Drop a parked change for good
    Discard {
        /// Change id
        id: String,
    },
    /// Drop every pending change of a source
    Clear { source: String },
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// List recently resolved sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Keep syncing with live updates until interrupted
    Watch,
    /// Delete matching documents on the backend and locally
    Purge {
        source: String,
        /// Equality filter on a top-level field, e.g. `subject_id=math`
        #[arg(long = "where", value_name = "FIELD=VALUE", required = true)]
        filters: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Initialize or update a profile
    Init {
        /// Backend base URL
        #[arg(long, value_name = "URL")]
        api_url: Option<String>,
        /// Realtime endpoint (derived from the API URL when omitted)
        #[arg(long, value_name = "URL")]
        realtime_url: Option<String>,
        /// Public project key
        #[arg(long, value_name = "KEY")]
        api_key: Option<String>,
        /// Bearer token of the signed-in user
        #[arg(long, value_name = "TOKEN")]
        access_token: Option<String>,
        /// User the data belongs to
        #[arg(long, value_name = "ID")]
        user_id: Option<String>,
        /// Keep current active profile instead of activating this one
        #[arg(long)]
        no_activate: bool,
    },
    /// Show the resolved profile with secrets redacted
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
