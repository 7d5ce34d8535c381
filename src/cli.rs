/// CLI surface (spec §6): flags for batch size, worker count, endpoint
/// list, dictionary URL, unfinalized-blocks mode, store cache sizing,
/// profiler toggle, and bypass-blocks list, plus subcommands for MMR
/// migration and a test runner — both out of core scope and modeled here
/// only as the command surface, not their implementation.
///
/// The teacher parses flags entirely via the `config` crate; this engine's
/// manifest-driven surface needs positional/flag parsing `config` doesn't
/// give us, so `clap` (already a teacher dependency) is used directly here.
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "near-indexer-engine", version, about = "NEAR blockchain indexing engine core")]
pub struct Cli {
    /// Path to the project manifest (`project.yaml`).
    #[arg(short, long, default_value = "project.yaml")]
    pub manifest: String,

    /// Comma-separated chain RPC endpoints; overrides the manifest's `network.endpoint`.
    #[arg(long, value_delimiter = ',')]
    pub endpoint: Vec<String>,

    /// Dictionary service base URL; overrides the manifest's `network.dictionary`.
    #[arg(long)]
    pub dictionary: Option<String>,

    /// Target blocks enqueued per scheduler scan.
    #[arg(long, default_value_t = 50)]
    pub batch_size: usize,

    /// Bounded concurrency for block fetch/assembly.
    #[arg(long, default_value_t = 10)]
    pub fetch_batch_size: usize,

    /// Worker-pool size; 0 selects single-process dispatcher mode.
    #[arg(long, default_value_t = 0)]
    pub workers: usize,

    /// Index against the best (optimistic) block instead of the finalized one.
    #[arg(long, default_value_t = false)]
    pub unfinalized_blocks: bool,

    /// Entity-store write-behind cache size, handed to the store collaborator.
    #[arg(long, default_value_t = 1000)]
    pub store_cache_size: usize,

    /// Enable profiler hooks (exposed to the host process, not implemented here).
    #[arg(long, default_value_t = false)]
    pub profiler: bool,

    /// Heights the scheduler always skips, comma-separated.
    #[arg(long, value_delimiter = ',')]
    pub bypass_blocks: Vec<i64>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Migrate the store's proof-of-indexing / Merkle-mountain-range
    /// tracker to a newer format. Delegated entirely to the store
    /// collaborator (spec §1); the engine core only recognizes the verb.
    MigrateMmr,
    /// Run the project's mapping-handler test suite against recorded
    /// fixtures. Out of core scope (spec §1); the sandboxed runtime that
    /// executes user handlers owns this.
    Test {
        #[arg(long)]
        block_height: Option<i64>,
    },
}

impl Cli {
    pub fn bypass_blocks_sorted(&self) -> Vec<i64> {
        let mut blocks = self.bypass_blocks.clone();
        blocks.sort_unstable();
        blocks.dedup();
        blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoint_list() {
        let cli = Cli::parse_from(["near-indexer-engine", "--endpoint", "https://a,https://b"]);
        assert_eq!(cli.endpoint, vec!["https://a", "https://b"]);
    }

    #[test]
    fn dedupes_bypass_blocks() {
        let cli = Cli::parse_from(["near-indexer-engine", "--bypass-blocks", "5,5,3"]);
        assert_eq!(cli.bypass_blocks_sorted(), vec![3, 5]);
    }
}
