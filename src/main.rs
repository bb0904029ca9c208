use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use crossbeam_channel::tick;
use dig2_readout::{decode, Conf, PerModuleSettings, RunControl, SimDigitizer};
use log::{debug, error, info, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, Config as LogConfig, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::{
    fs::File,
    path::PathBuf,
    time::{Duration, Instant},
};

/// Channels per simulated module.
const SIM_CHANNELS: usize = 64;

#[derive(Parser, Debug)]
#[command(name = "dig2-readout")]
#[command(version)]
#[command(about = "Poll and drain a set of dig2 digitizer modules", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Stop after this many trigger cycles (0 for no limit)
    #[arg(long)]
    cycles: Option<u64>,

    /// Stop after this many seconds (0 for no limit)
    #[arg(long)]
    duration: Option<u64>,

    /// Seed for the simulated digitizers
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Decode and log every fragment
    #[arg(long)]
    dump: bool,

    /// Also write the log to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn init_logging(cli: &Cli) -> Result<()> {
    let mut level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    if cli.dump {
        level = level.max(LevelFilter::Debug);
    }

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = &cli.log_file {
        let file = File::create(path)
            .with_context(|| format!("unable to create log file {}", path.display()))?;
        loggers.push(WriteLogger::new(level, LogConfig::default(), file));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

fn load_conf(cli: &Cli) -> Result<Conf> {
    let mut conf = Conf::from_file(&cli.config)
        .with_context(|| format!("unable to load configuration {}", cli.config.display()))?;
    if let Some(cycles) = cli.cycles {
        conf.run_settings.cycles = cycles;
    }
    if let Some(duration) = cli.duration {
        conf.run_settings.run_duration = duration;
    }
    Ok(conf)
}

fn simulator(conf: &Conf, seed: u64) -> impl FnMut(&PerModuleSettings) -> SimDigitizer {
    let probability = conf.run_settings.sim_hit_probability;
    move |m: &PerModuleSettings| {
        SimDigitizer::new(SIM_CHANNELS, seed ^ u64::from(m.source_id))
            .with_hit_probability(probability)
    }
}

fn dump_fragment(source: u32, bytes: &[u8]) -> Result<()> {
    let fragment = decode(bytes).context("produced fragment does not decode")?;
    let hit = &fragment.hit;
    debug!(
        "[{} / source {}] ch {:2}  t = {} ns  E = {}  flags = {:#x}/{:#x}  {} bytes",
        fragment.name,
        source,
        hit.channel,
        hit.timestamp_ns,
        hit.energy,
        hit.low_priority_flags,
        hit.high_priority_flags,
        bytes.len()
    );
    Ok(())
}

fn acquire(cli: &Cli, run: &mut RunControl, mut conf: Conf) -> Result<()> {
    let ticker = tick(Duration::from_secs(1));
    let mut t_begin = Instant::now();
    let mut cycles = 0u64;
    let mut generation = 0u64;

    loop {
        let settings = &conf.run_settings;
        if settings.cycles > 0 && cycles >= settings.cycles {
            info!("Cycle limit of {} reached", settings.cycles);
            break;
        }
        if settings.run_duration > 0
            && t_begin.elapsed() >= Duration::from_secs(settings.run_duration)
        {
            info!("Run duration of {} s reached", settings.run_duration);
            break;
        }

        run.cycle(|source, bytes| {
            if cli.dump {
                dump_fragment(source, bytes)?;
            }
            Ok(())
        })?;
        cycles += 1;

        if ticker.try_recv().is_ok() {
            info!("Run {}: {}", run.run_num, run.counter);
        }

        let reload_every = conf.run_settings.reload_every;
        if reload_every > 0 && cycles % reload_every == 0 {
            info!("Reloading {}", cli.config.display());
            run.end_run()?;
            conf = load_conf(cli)?;
            generation += 1;
            run.load(conf.clone(), simulator(&conf, cli.seed.wrapping_add(generation)))?;
            run.begin_run()?;
            t_begin = Instant::now();
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let conf = load_conf(&cli)?;
    let mut run = RunControl::new();
    run.load(conf.clone(), simulator(&conf, cli.seed))?;
    run.begin_run()?;

    let res = acquire(&cli, &mut run, conf);
    if let Err(e) = &res {
        error!("Acquisition aborted: {:#}", e);
    }
    run.end_run()?;
    res
}
