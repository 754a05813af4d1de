use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kmsprobe::flip::PendingFlipPolicy;
use kmsprobe::{Card, Config, KmsDevice, KmsError, KmsResult, PipelineOptions, Session, VirtualCard};
use kmsprobe_common::FileLogger;
use log::LevelFilter;

#[derive(Parser)]
#[command(name = "kmsprobe", version, about = "Drive a KMS display pipeline with dumb buffers")]
struct Cli {
    /// Card node to open, e.g. /dev/dri/card0
    #[arg(long, global = true)]
    device: Option<PathBuf>,

    /// Open the first card driven by this kernel driver
    #[arg(long, global = true, conflicts_with = "device")]
    driver: Option<String>,

    /// Config file to use instead of the default locations
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Run against an in-memory card instead of real hardware
    #[arg(long = "virtual", global = true)]
    virtual_card: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// Exit as soon as the pipeline is up instead of waiting for Enter
    #[arg(long, global = true)]
    no_wait: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Atomic mode-set of one test pattern on the first usable plane
    Atomic,
    /// Legacy mode-set of one test pattern
    Setcrtc,
    /// Legacy mode-set, then page flips between two patterns
    Pageflip {
        #[arg(long)]
        cycles: Option<usize>,

        #[arg(long)]
        interval_ms: Option<u64>,

        /// Fail instead of waiting when a flip is still pending
        #[arg(long)]
        reject_pending: bool,
    },
    /// Print the resource graph, properties and the chain that would be used
    Probe {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    };
    if let Err(e) = FileLogger::init(level) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: &Cli) -> KmsResult<()> {
    let config = Config::load(cli.config.as_deref())?;
    let mut options = config.pipeline_options()?;

    if let Command::Pageflip {
        cycles,
        interval_ms,
        reject_pending,
    } = &cli.command
    {
        if let Some(cycles) = cycles {
            options.flip.cycles = *cycles;
        }
        if let Some(interval) = interval_ms {
            options.flip.interval = Duration::from_millis(*interval);
        }
        if *reject_pending {
            options.flip.pending = PendingFlipPolicy::Reject;
        }
    }

    if cli.virtual_card {
        log::info!("Using virtual card");
        return drive(&VirtualCard::new(), cli, &options);
    }

    let card = open_card(cli, &config)?;
    log::info!("Opened {}", card.path().display());
    match card.driver_name() {
        Ok(name) => log::info!("Driver: {}", name),
        Err(e) => log::debug!("Could not query driver name: {}", e),
    }
    drive(&card, cli, &options)
}

fn open_card(cli: &Cli, config: &Config) -> KmsResult<Card> {
    if let Some(path) = &cli.device {
        return Card::open(path);
    }
    if let Some(driver) = &cli.driver {
        return Card::open_driver(driver);
    }
    if let Some(path) = config.device.device_path() {
        return Card::open(path);
    }
    match &config.device.driver {
        Some(driver) => Card::open_driver(driver),
        None => Card::open_auto(),
    }
}

/// The subcommands that put an image on screen.
#[derive(Clone, Copy)]
enum Program {
    Atomic,
    Setcrtc,
    Pageflip,
}

fn drive<D: KmsDevice>(device: &D, cli: &Cli, options: &PipelineOptions) -> KmsResult<()> {
    let program = match &cli.command {
        Command::Probe { json } => return probe(device, *json),
        Command::Atomic => Program::Atomic,
        Command::Setcrtc => Program::Setcrtc,
        Command::Pageflip { .. } => Program::Pageflip,
    };
    display(device, program, options, cli.no_wait)
}

fn probe<D: KmsDevice>(device: &D, json: bool) -> KmsResult<()> {
    let session = Session::inspect(device)?;
    let report = session.probe();
    if json {
        let text = serde_json::to_string_pretty(&report)
            .map_err(|e| KmsError::InvalidSnapshot(e.to_string()))?;
        println!("{}", text);
    } else {
        println!("{}", report);
    }
    Ok(())
}

fn display<D: KmsDevice>(
    device: &D,
    program: Program,
    options: &PipelineOptions,
    no_wait: bool,
) -> KmsResult<()> {
    let session = Session::open(device, matches!(program, Program::Atomic))?;
    let scanout = match program {
        Program::Atomic => session.run_atomic(options)?,
        Program::Setcrtc => session.run_setcrtc(options)?,
        Program::Pageflip => session.run_pageflip(options)?,
    };

    let selection = &scanout.selection;
    log::info!(
        "Showing {} on connector {} via crtc {} with framebuffers {:?}",
        selection.mode,
        selection.connector.id,
        selection.crtc.id,
        scanout.framebuffer_ids()
    );
    if let Some(stats) = scanout.flips {
        println!(
            "{} flips, {} completed, {} stray events",
            stats.flips, stats.completed, stats.stray_events
        );
    }

    if !no_wait {
        println!("Press Enter to exit");
        let mut line = String::new();
        if let Err(e) = std::io::stdin().lock().read_line(&mut line) {
            log::warn!("Failed to read stdin: {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("kmsprobe").chain(args.iter().copied()))
    }

    #[test]
    fn probe_never_allocates_or_sets_a_mode() {
        let card = VirtualCard::new();
        drive(&card, &cli(&["probe", "--json"]), &PipelineOptions::default()).unwrap();
        let calls = card.calls();
        assert_eq!(calls.create_dumb, 0);
        assert_eq!(calls.set_crtc, 0);
        assert_eq!(calls.atomic_commit, 0);
    }

    #[test]
    fn setcrtc_sets_one_mode() {
        let card = VirtualCard::new();
        drive(&card, &cli(&["--no-wait", "setcrtc"]), &PipelineOptions::default()).unwrap();
        assert_eq!(card.calls().set_crtc, 1);
        assert_eq!(card.calls().page_flip, 0);
    }

    #[test]
    fn pageflip_flags_parse() {
        let cli = cli(&["pageflip", "--cycles", "3", "--interval-ms", "5", "--reject-pending"]);
        assert!(matches!(
            cli.command,
            Command::Pageflip { cycles: Some(3), interval_ms: Some(5), reject_pending: true }
        ));
    }
}
