use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use slotloader_service::config::Config;
use slotloader_service::logging;
use slotloader_service::metrics;

mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Command line interface parser.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// The number of threads running loads.
    #[arg(long, default_value = "8")]
    load_threads: NonZeroUsize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;
    workloads.validate()?;

    let config = Config::get(cli.config.as_deref())?;

    // SAFETY: we have not spawned any threads yet
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd,
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    let load_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("slotloader-load")
        .max_blocking_threads(cli.load_threads.get())
        .enable_all()
        .build()?;
    let driver = tokio::runtime::Builder::new_multi_thread()
        .thread_name("slotloader-driver")
        .enable_all()
        .build()?;

    let result = driver.block_on(perform_stresstest(
        config,
        workloads,
        cli.duration,
        load_pool.handle().to_owned(),
    ));
    if let Err(ref err) = result {
        logging::ensure_log_error(err);
    }
    result
}
