//! log4rs setup: one rolling application log plus recovery and checkpoint logs routed by target.

use std::path::{Path, PathBuf};

use log::LevelFilter;
use log4rs::append::rolling_file::policy::compound::{
    CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
};
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;

pub const RECOVERY_TARGET: &str = "lodestone::recovery";
pub const CHECKPOINT_TARGET: &str = "lodestone::checkpoint";

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";
const ROLL_SIZE: u64 = 10 * 1024 * 1024;
const DEFAULT_RETENTION: u32 = 7;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Initializes logging from a log4rs YAML file.
///
/// # Errors
/// Returns an error if the file cannot be loaded or a logger is already installed.
pub fn init_path(path: &Path) -> Result<(), BoxError> {
    log4rs::init_file(path, log4rs::config::Deserializers::default())?;
    Ok(())
}

fn rolling(dir: &Path, stem: &str, keep: u32) -> Result<RollingFileAppender, BoxError> {
    let roller = FixedWindowRoller::builder().build(&format!("{}", dir.join(format!("{stem}.{{}}.log")).display()), keep)?;
    let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(ROLL_SIZE)), Box::new(roller));
    let appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(dir.join(format!("{stem}.log")), Box::new(policy))?;
    Ok(appender)
}

fn parse_level(level: Option<&str>) -> LevelFilter {
    match level.unwrap_or("info").to_ascii_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

fn build_config(dir: &Path, name: &str, level: LevelFilter, keep: u32) -> Result<Config, BoxError> {
    std::fs::create_dir_all(dir)?;
    let app = rolling(dir, name, keep)?;
    let recovery = rolling(dir, &format!("{name}_recovery"), keep)?;
    let checkpoint = rolling(dir, &format!("{name}_checkpoint"), keep)?;
    let config = Config::builder()
        .appender(Appender::builder().build("app", Box::new(app)))
        .appender(Appender::builder().build("recovery", Box::new(recovery)))
        .appender(Appender::builder().build("checkpoint", Box::new(checkpoint)))
        .logger(Logger::builder().appender("recovery").additive(false).build(RECOVERY_TARGET, level))
        .logger(Logger::builder().appender("checkpoint").additive(false).build(CHECKPOINT_TARGET, level))
        .build(Root::builder().appender("app").build(level))?;
    Ok(config)
}

/// Writes `{base}/{name}_logs/{name}.log`, `{name}_recovery.log` and `{name}_checkpoint.log`.
///
/// # Errors
/// Returns an error if the directory cannot be created or a logger is already installed.
pub fn init_for_store_in(base: &Path, name: &str) -> Result<(), BoxError> {
    let dir = base.join(format!("{name}_logs"));
    let config = build_config(&dir, name, LevelFilter::Info, DEFAULT_RETENTION)?;
    log4rs::init_config(config)?;
    Ok(())
}

/// Configures process-wide logging under `dir` (the working directory when `None`).
/// `level` is error|warn|info|debug|trace, `retention` the number of rolled files kept.
///
/// Returns a handle that can swap the configuration later; `None` when a logger other than
/// log4rs is already installed.
///
/// # Errors
/// Returns an error if the directory or appenders cannot be created.
pub fn configure_logging(
    dir: Option<&Path>,
    level: Option<&str>,
    retention: Option<usize>,
) -> Result<Option<log4rs::Handle>, BoxError> {
    let base = dir
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    let keep = retention.map_or(DEFAULT_RETENTION, |r| u32::try_from(r).unwrap_or(u32::MAX));
    let config = build_config(&base, "lodestone", parse_level(level), keep)?;
    Ok(log4rs::init_config(config).ok())
}
