use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use lodestone::storage::header::{read_u32, StoreHeader};
use lodestone::wal::WAL_HEADER_SIZE;
use lodestone::{logger, Engine, EngineConfig, WalRecord};

#[derive(Parser, Debug)]
#[command(name = "lodestone", version, about = "Lodestone storage engine tools", long_about = None)]
struct Cli {
    /// log4rs YAML file; logging stays off when omitted
    #[arg(long, global = true)]
    log_config: Option<PathBuf>,
    /// Write rolling logs under DIR/lodestone_logs instead of using a YAML file
    #[arg(long, global = true, conflicts_with = "log_config")]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Print the header of a page file")]
    Inspect {
        #[arg(help = "Page file written by the file or mmap backend")]
        store: PathBuf,
        #[arg(long, help = "Also hex-dump this data page")]
        page: Option<u64>,
    },
    #[command(about = "List WAL records")]
    Wal {
        #[arg(help = "WAL file")]
        file: PathBuf,
        #[arg(long, default_value_t = 0, help = "First LSN to show")]
        from: u64,
    },
    #[command(about = "Open the engine, run recovery and print its report")]
    Recover {
        #[arg(long, help = "Engine config (TOML); falls back to $LODESTONE_CONFIG, ./lodestone.toml, defaults")]
        config: Option<PathBuf>,
        #[arg(long, help = "Print the report as JSON")]
        json: bool,
    },
    #[command(about = "Force one checkpoint cycle")]
    Checkpoint {
        #[arg(long, help = "Engine config (TOML); falls back to $LODESTONE_CONFIG, ./lodestone.toml, defaults")]
        config: Option<PathBuf>,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

fn inspect(path: &Path, page: Option<u64>) -> CliResult {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 8 {
        return Err(format!("{} is too short for a page file header", path.display()).into());
    }
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&bytes[..4]);
    let page_size = read_u32(&bytes, 4) as usize;
    if page_size == 0 || bytes.len() < page_size {
        return Err(format!("{}: bad page size {page_size}", path.display()).into());
    }
    let header = StoreHeader::decode(&bytes[..page_size], magic, page_size)?;
    println!("file:       {}", path.display());
    println!("magic:      {}", String::from_utf8_lossy(&header.magic));
    println!("page size:  {}", header.page_size);
    println!("page count: {}", header.page_count);
    println!("free pages: {} {:?}", header.free_list.len(), header.free_list);
    println!("file pages: {}", (bytes.len() / page_size).saturating_sub(1));
    if let Some(id) = page {
        let Some(range) = page_range(id, page_size) else {
            return Err(format!("page {id} is out of range").into());
        };
        let Some(data) = bytes.get(range) else {
            return Err(format!("page {id} lies beyond the end of the file").into());
        };
        for (i, line) in data.chunks(32).enumerate() {
            println!("{:06x}  {}", i * 32, hex::encode(line));
        }
    }
    Ok(())
}

/// Byte range of data page `id`, `None` when it does not fit in memory offsets.
fn page_range(id: u64, page_size: usize) -> Option<std::ops::Range<usize>> {
    let slot = usize::try_from(id).ok()?.checked_add(1)?;
    let start = slot.checked_mul(page_size)?;
    Some(start..start.checked_add(page_size)?)
}

/// Read-only listing; a torn tail ends the listing instead of being cut off.
fn list_wal(path: &Path, from: u64) -> CliResult {
    let bytes = std::fs::read(path)?;
    if bytes.len() < WAL_HEADER_SIZE || &bytes[..4] != b"LSWL" {
        return Err(format!("{} is not a WAL file", path.display()).into());
    }
    let mut pos = WAL_HEADER_SIZE;
    let mut shown = 0usize;
    while let Some(record) = WalRecord::decode(&bytes[pos..])? {
        pos += record.encoded_len();
        if record.lsn < from {
            continue;
        }
        shown += 1;
        println!(
            "lsn={:<8} {:<12} txn={:<6} page={:<20} ref={:<8} image={}",
            record.lsn,
            record.record_type.to_string(),
            record.txn_id,
            record.page_id,
            record.ref_lsn,
            record.after.len()
        );
    }
    if pos < bytes.len() {
        println!("-- {} trailing bytes not decodable at offset {pos}", bytes.len() - pos);
    }
    println!("{shown} records");
    Ok(())
}

async fn recover(config: Option<&Path>, json: bool) -> CliResult {
    let mut cfg = EngineConfig::load(config)?;
    cfg.checkpoint.enabled = false;
    let engine = Engine::open(cfg).await?;
    let report = engine.recovery_report().cloned().unwrap_or_default();
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("winners:       {:?}", report.winners);
        println!("losers:        {:?}", report.losers);
        println!("pages redone:  {}", report.pages_redone);
        println!("pages undone:  {}", report.pages_undone);
        println!("entries:       {}", report.entries_processed);
        println!("recovered LSN: {}", report.recovered_lsn);
    }
    engine.close().await?;
    Ok(())
}

async fn checkpoint(config: Option<&Path>) -> CliResult {
    let mut cfg = EngineConfig::load(config)?;
    cfg.checkpoint.enabled = false;
    let engine = Engine::open(cfg).await?;
    let stats = engine.checkpoint().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    engine.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let logging = match (cli.log_config.as_deref(), cli.log_dir.as_deref()) {
        (Some(path), _) => Some(logger::init_path(path)),
        (None, Some(dir)) => Some(logger::init_for_store_in(dir, "lodestone")),
        (None, None) => None,
    };
    if let Some(Err(e)) = logging {
        eprintln!("warning: logging not configured: {e}");
    }
    let result = match cli.command {
        Commands::Inspect { store, page } => inspect(&store, page),
        Commands::Wal { file, from } => list_wal(&file, from),
        Commands::Recover { config, json } => recover(config.as_deref(), json).await,
        Commands::Checkpoint { config } => checkpoint(config.as_deref()).await,
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
