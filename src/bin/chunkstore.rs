//! # chunkstore CLI
//!
//! Drives a seeded synthetic workload against a [`ChunkStore`] and prints
//! the requested reports. Useful for watching placement and migration
//! behave under a cache that is much smaller than the data set.
//!
//! ## Usage
//!
//! ```bash
//! # 20k chunks, 2 MB of cache, default reports
//! chunkstore --chunks 20000 --cache-memory 2000000
//!
//! # load settings from a file, print every report
//! chunkstore --config chunkstore.toml --stats all
//!
//! # trace every page-in and page-out
//! RUST_LOG=chunkstore=debug chunkstore --rounds 5
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use eyre::{bail, Result, WrapErr};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use chunkstore::{ChunkConfig, ChunkReference, ChunkStore, OrAbort, StatsKind};

/// chunkstore - exercise the pageable chunk allocator
#[derive(Parser, Debug)]
#[command(name = "chunkstore")]
#[command(author, version, about = "Run a synthetic workload against a chunk store")]
struct Args {
    /// TOML settings file; command-line flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Swap file path
    #[arg(long)]
    swap_file: Option<PathBuf>,

    /// Bytes of region cache
    #[arg(long)]
    cache_memory: Option<usize>,

    /// Validate every region after each mutation
    #[arg(long)]
    paranoid: bool,

    /// Number of live chunks to keep
    #[arg(long, default_value = "5000")]
    chunks: usize,

    /// Largest payload to generate
    #[arg(long, default_value = "200")]
    max_len: usize,

    /// Workload rounds; each round reads, rewrites and migrates
    #[arg(long, default_value = "20")]
    rounds: usize,

    /// RNG seed
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Reports to print: summary, regions, region-map, paging,
    /// region-histogram, paging-histogram, freespace-histogram or all
    #[arg(long, value_delimiter = ',', default_value = "summary,paging")]
    stats: Vec<String>,
}

struct Entry {
    reference: ChunkReference,
    data: Vec<u8>,
}

fn main() -> ExitCode {
    init_tracing();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(args: Args) -> Result<()> {
    let reports = parse_reports(&args.stats)?;
    if args.max_len == 0 || args.max_len > chunkstore::config::MAX_CHUNK_LEN {
        bail!(
            "--max-len must be between 1 and {}",
            chunkstore::config::MAX_CHUNK_LEN
        );
    }

    let config = load_config(&args)?;
    let migrate_amount = config.migrate_amount;

    let mut store = ChunkStore::init(config).wrap_err("failed to open chunk store")?;
    let mut rng = StdRng::seed_from_u64(args.seed);

    let mut entries: Vec<Entry> = (0..args.chunks)
        .map(|_| {
            let data = random_payload(&mut rng, args.max_len);
            let reference = store.create(&data, 0).or_abort();
            Entry { reference, data }
        })
        .collect();
    info!(
        chunks = entries.len(),
        regions = store.region_count(),
        "initial population created"
    );

    let hot = (entries.len() / 10).max(1);
    let mut cursor = 0;
    for round in 0..args.rounds {
        if entries.is_empty() {
            break;
        }

        // a tenth of the chunks take most of the reads
        for _ in 0..entries.len() {
            let index = if rng.gen_bool(0.8) {
                rng.gen_range(0..hot.min(entries.len()))
            } else {
                rng.gen_range(0..entries.len())
            };
            let entry = &entries[index];
            let fetched = store.fetch_vec(entry.reference).or_abort();
            if fetched != entry.data {
                bail!("chunk {} came back with the wrong payload", entry.reference);
            }
        }

        for _ in 0..entries.len() / 20 {
            let index = rng.gen_range(0..entries.len());
            store.delete(entries[index].reference).or_abort();
            let data = random_payload(&mut rng, args.max_len);
            entries[index].reference = store.create(&data, 0).or_abort();
            entries[index].data = data;
        }

        if cursor >= entries.len() {
            cursor = 0;
        }
        let end = (cursor + migrate_amount).min(entries.len());
        let mut batch: Vec<&mut ChunkReference> = entries[cursor..end]
            .iter_mut()
            .map(|entry| &mut entry.reference)
            .collect();
        store.migrate(&mut batch).or_abort();
        cursor = end;

        info!(
            round,
            regions = store.region_count(),
            swapped = store.num_swapped(),
            page_in = store.statistics().page_in,
            "round finished"
        );
    }

    for entry in &entries {
        if store.fetch_vec(entry.reference).or_abort() != entry.data {
            bail!("chunk {} came back with the wrong payload", entry.reference);
        }
    }
    store.verify_all().or_abort();

    for kind in reports {
        for line in store.stats(kind) {
            println!("{}", line);
        }
        println!();
    }
    Ok(())
}

/// Settings file (or defaults) with command-line overrides applied.
fn load_config(args: &Args) -> Result<ChunkConfig> {
    let mut config = match &args.config {
        Some(path) => ChunkConfig::from_file(path)?,
        None => ChunkConfig::default(),
    };
    if let Some(path) = &args.swap_file {
        config.swap_file = path.clone();
    }
    if let Some(bytes) = args.cache_memory {
        config.cache_memory = bytes;
    }
    if args.paranoid {
        config.paranoid = true;
    }
    Ok(config)
}

fn random_payload(rng: &mut StdRng, max_len: usize) -> Vec<u8> {
    let mut data = vec![0u8; rng.gen_range(1..=max_len)];
    rng.fill(&mut data[..]);
    data
}

fn parse_reports(names: &[String]) -> Result<Vec<StatsKind>> {
    if names.iter().any(|n| n == "all") {
        return Ok(StatsKind::ALL.to_vec());
    }
    names
        .iter()
        .map(|name| match StatsKind::from_name(name) {
            Some(kind) => Ok(kind),
            None => bail!("unknown report: {}", name),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkstore::config::REGION_SIZE;
    use tempfile::tempdir;

    fn parse(flags: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("chunkstore").chain(flags.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[]);
        assert_eq!(args.chunks, 5000);
        assert_eq!(args.max_len, 200);
        assert_eq!(args.rounds, 20);
        assert_eq!(
            parse_reports(&args.stats).unwrap(),
            vec![StatsKind::Summary, StatsKind::Paging]
        );
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("chunkstore.toml");
        std::fs::write(
            &config_path,
            "swap_file = \"from-file\"\ncache_memory = 900000\nmigrate_amount = 7\n",
        )
        .unwrap();
        let swap = dir.path().join("swap");

        let args = parse(&[
            "--config",
            config_path.to_str().unwrap(),
            "--swap-file",
            swap.to_str().unwrap(),
            "--cache-memory",
            "200000",
            "--paranoid",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.swap_file, swap);
        assert_eq!(config.cache_memory, 200_000);
        assert_eq!(config.migrate_amount, 7);
        assert!(config.paranoid);
    }

    #[test]
    fn test_unknown_report_is_rejected() {
        let args = parse(&["--stats", "summary,bogus"]);
        assert!(parse_reports(&args.stats).is_err());
        let args = parse(&["--stats", "all"]);
        assert_eq!(parse_reports(&args.stats).unwrap(), StatsKind::ALL.to_vec());
    }

    #[test]
    fn test_workload_runs_against_small_cache() {
        let dir = tempdir().unwrap();
        let swap = dir.path().join("swap");
        let cache = (2 * REGION_SIZE).to_string();

        let args = parse(&[
            "--swap-file",
            swap.to_str().unwrap(),
            "--cache-memory",
            cache.as_str(),
            "--paranoid",
            "--chunks",
            "400",
            "--max-len",
            "1500",
            "--rounds",
            "3",
            "--seed",
            "9",
            "--stats",
            "all",
        ]);
        run(args).unwrap();
        assert!(!swap.exists());
    }

    #[test]
    fn test_bad_max_len_is_rejected() {
        let dir = tempdir().unwrap();
        let swap = dir.path().join("swap");
        let args = parse(&["--swap-file", swap.to_str().unwrap(), "--max-len", "0"]);
        assert!(run(args).is_err());
        assert!(!swap.exists());
    }
}
