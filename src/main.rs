//! framepump: multi-stream V4L2 capture with KMS page-flip display

use std::path::PathBuf;

use clap::Parser;
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use framepump::capture::{CaptureStream, V4l2Capture};
use framepump::display::KmsDisplay;
use framepump::pipeline::{ControlInput, EventScheduler, FramePump};
use framepump::sink::Outputs;
use framepump::{Config, ControlKind, StreamFilter, TxConfig};

#[derive(Debug, Parser)]
#[command(name = "framepump", version, about)]
struct Cli {
    /// Stream configuration (TOML)
    config: PathBuf,

    /// Show displayable streams on the screen
    #[arg(short, long)]
    display: bool,

    /// Save every frame into DIR
    #[arg(short, long, value_name = "DIR")]
    save: Option<PathBuf>,

    /// Send non-displayed frames to a server
    #[arg(short = 'x', long, value_name = "ADDR")]
    tx: Option<String>,

    /// Streams to send: "all" or a list like 0,2
    #[arg(long, value_name = "LIST")]
    tx_streams: Option<StreamFilter>,

    /// Print the resolved stream plan
    #[arg(short, long)]
    print_config: bool,

    /// Set everything up, then exit without streaming
    #[arg(short, long)]
    config_only: bool,

    /// Seconds to wait after the modeset before streaming
    #[arg(long, value_name = "SECS")]
    delay: Option<u64>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if self.display {
            config.display.enabled = true;
        }
        if let Some(delay) = self.delay {
            config.display.modeset_delay_secs = Some(delay);
        }
        if let Some(dir) = &self.save {
            config.output.save_dir = Some(dir.clone());
        }
        if let Some(address) = &self.tx {
            config.output.tx = Some(TxConfig {
                address: address.clone(),
                streams: self.tx_streams.clone().unwrap_or_default(),
            });
        } else if let (Some(tx), Some(streams)) = (config.output.tx.as_mut(), &self.tx_streams) {
            tx.streams = streams.clone();
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("framepump=info"));
    let fmt = tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime());
    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

fn pin_to_core(core: usize) {
    let target = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .find(|id| id.id == core);
    match target {
        Some(id) if core_affinity::set_for_current(id) => info!("Pinned to core {}", core),
        _ => warn!("Could not pin to core {}", core),
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;
    cli.apply(&mut config);
    config.validate()?;

    info!("framepump launching with {} streams", config.streams.len());

    if let Some(core) = config.pipeline.cpu_affinity {
        pin_to_core(core);
    }

    let mut builder = FramePump::builder()
        .stats_interval(config.stats_interval())
        .modeset_delay(config.modeset_delay());

    for info in config.stream_infos()? {
        let device = V4l2Capture::open(&info)?;
        builder = builder.stream(CaptureStream::new(info, Box::new(device)));
    }

    if config.any_displayed() {
        builder = builder.display(Box::new(KmsDisplay::open(&config.display.card)?));
    }

    let control = ControlInput::new(config.pipeline.control)?;
    if let Some(trigger) = control.trigger() {
        ctrlc::set_handler(move || {
            if let Err(e) = trigger.fire() {
                eprintln!("failed to signal shutdown: {}", e);
            }
        })?;
    }

    // Outputs open files and sockets, so a dry run leaves them alone.
    if !cli.config_only {
        let outputs = Outputs::from_config(&config.output)?;
        builder = builder.sink(outputs.transmit);
        if let Some(save) = outputs.save {
            builder = builder.save_sink(save);
        }
    }

    let mut pump = builder.control(control).build()?;

    if cli.print_config {
        for line in pump.plan() {
            println!("{}", line);
        }
    } else {
        pump.log_plan();
    }

    if cli.config_only {
        info!("configuration only, not streaming");
        return Ok(());
    }

    pump.start()?;

    let mut scheduler = EventScheduler::new();
    if let Err(e) = pump.register(&mut scheduler) {
        pump.shutdown()?;
        return Err(e.into());
    }

    if config.pipeline.control == ControlKind::Stdin {
        info!("press enter to stop");
    }
    scheduler.run(&mut pump)?;

    info!("framepump shutting down");
    Ok(())
}
