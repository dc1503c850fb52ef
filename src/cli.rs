use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "docdex", version, about = "Local semantic search over a documentation corpus")]
pub struct Args {
    /// Directory holding config.yaml and the model cache
    #[arg(long, global = true, default_value = "./")]
    pub data_dir: String,

    /// Remote backend url (overrides config.yaml)
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// Anonymous read-scoped api key (overrides config.yaml)
    #[arg(long, global = true)]
    pub anon_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search the documentation corpus
    Search {
        query: String,

        /// Wait for local replication instead of falling back to the
        /// server-side full-text search
        #[arg(long)]
        wait_ready: bool,

        /// How long to wait for the local database before giving up, seconds
        #[arg(long, default_value_t = 120)]
        ready_timeout_secs: u64,
    },

    /// Replicate the remote tables once and print row counts
    Replicate {
        /// Abort replication after this many seconds
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },
}
