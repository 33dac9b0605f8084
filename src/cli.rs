use crate::config::Config;
use clap::{Parser, Subcommand};

/// crawl sink cli
#[derive(Parser)]
#[command(name = "crawlsink")]
#[command(about = "Coordination and storage sink for breadth-first web crawls")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the sink HTTP server
    Serve {
        /// listen port
        #[arg(short, long, default_value = "8841", help = "TCP port to listen on")]
        port: u16,

        /// project root
        #[arg(
            short,
            long,
            default_value = "./data",
            help = "Project root holding BFS_crawl/ and downloads/"
        )]
        root: String,

        /// watchdog cadence
        #[arg(
            long,
            default_value_t = Config::WATCHDOG_INTERVAL_MS,
            help = "Auto-finalize watchdog interval in milliseconds"
        )]
        watchdog_interval_ms: u64,

        /// idle threshold
        #[arg(
            long,
            default_value_t = Config::IDLE_FINALIZE_MS,
            help = "Idle time before an unfinalized streaming bucket is auto-finalized"
        )]
        idle_finalize_ms: u64,
    },

    /// Repair on-disk placement against the content-hash registry
    ResortDownloads {
        /// target domain key
        #[arg(long, help = "Domain key to reconcile (e.g. results.example.com)")]
        domain: Option<String>,

        /// crawl root url
        #[arg(long, help = "Resolve the domain from this crawl root URL instead")]
        crawl_root: Option<String>,

        /// perform mutations
        #[arg(long, help = "Apply changes; without this flag the pass is a dry run")]
        apply: bool,

        /// project root
        #[arg(
            long,
            default_value = "./data",
            help = "Project root holding BFS_crawl/ and downloads/"
        )]
        root: String,

        /// residual collision policy
        #[arg(
            long,
            default_value = "suffix",
            help = "What to do when the canonical name stays occupied: suffix|skip|overwrite"
        )]
        conflict: String,

        /// entry cap
        #[arg(long, help = "Reconcile at most N registry entries")]
        limit: Option<usize>,
    },
}

impl Cli {
    /// parse args
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
