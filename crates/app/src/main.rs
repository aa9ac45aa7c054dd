use std::{
    io::BufRead,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use beatlights_core::{
    dmx::FilePort, AppConfig, AudioPipeline, AudioReactor, AudioSource, DmxBuffer, DmxOutput,
    Fader, FileSource, Fixture, FixtureKind, LightPlot, LightingModes, SceneManager,
    SerialTransmitter, SimulatedTransmitter, StageError, Transmitter,
};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> beatlights_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Analyze { wav, config, fast } => analyze(&wav, &config, fast),
        Commands::Fixtures { plot, action } => fixtures(&plot, action),
    }
}

fn run(args: RunArgs) -> beatlights_core::Result<()> {
    let config = AppConfig::load_or_default(&args.config)?;
    let modes = LightingModes::load_or_default(&args.modes)?;
    tracing::debug!(modes = ?modes.names().collect::<Vec<_>>(), "lighting modes loaded");
    let mode = modes.mode(&args.mode)?.clone();
    tracing::info!(mode = %args.mode, file = ?args.file, "starting run");

    let source = open_source(args.file.as_deref(), &config)?;

    let buffer = Arc::new(DmxBuffer::new());
    let (transmitter, frame_rate): (Box<dyn Transmitter>, f32) = match &args.port {
        Some(port) if !args.simulate => {
            let port = FilePort::open(port)?;
            let transmitter = SerialTransmitter::new(port, config.dmx.baud_rate)?;
            (Box::new(transmitter), config.dmx.frame_rate)
        }
        _ => (Box::new(SimulatedTransmitter::new()), config.dmx.simulator_rate),
    };
    let mut output = DmxOutput::spawn(buffer.clone(), transmitter, frame_rate)?;

    let fader = Arc::new(Fader::spawn(
        buffer,
        config.dmx.fade_step(),
        config.dmx.fade(),
    )?);
    let plot = Arc::new(Mutex::new(LightPlot::load(&args.plot)?));
    let scenes = Arc::new(SceneManager::new(plot, config.groups.clone(), fader.clone()));
    let reactor = Arc::new(AudioReactor::new(scenes.clone(), mode));
    reactor.apply_defaults()?;

    let mut pipeline = AudioPipeline::new(source, config).with_beat_listener(reactor.clone());
    pipeline.start()?;

    let (enter_tx, enter) = bounded::<()>(1);
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            let mut line = String::new();
            match std::io::stdin().lock().read_line(&mut line) {
                Ok(0) => tracing::debug!("stdin closed"),
                Ok(_) => {
                    if enter_tx.send(()).is_err() {
                        tracing::debug!("run loop already finished");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "reading stdin failed, Enter will not stop the run")
                }
            }
        })?;
    println!("Running, press Enter to stop.");

    let mut stdin_open = true;
    loop {
        if stdin_open {
            match enter.recv_timeout(POLL_INTERVAL) {
                Ok(()) => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => stdin_open = false,
            }
        } else {
            thread::sleep(POLL_INTERVAL);
        }

        let state = pipeline.state()?;
        tracing::debug!(?state, "audio state");
        if let Err(err) = reactor.process_state(&state) {
            tracing::warn!(error = %err, "lighting update failed");
        }
        if pipeline.is_finished() {
            tracing::info!("input finished");
            break;
        }
    }

    let stopped = pipeline.stop();
    if let Err(err) = scenes.blackout(Duration::ZERO) {
        tracing::warn!(error = %err, "blackout failed");
    }
    // Let the output loop send the dark frame before it stops.
    thread::sleep(Duration::from_secs_f32(1.0 / frame_rate.max(1.0)));
    fader.shutdown()?;
    output.stop()?;
    stopped
}

fn analyze(wav: &Path, config: &Path, fast: bool) -> beatlights_core::Result<()> {
    let mut config = AppConfig::load_or_default(config)?;
    if fast {
        config.audio.realtime = false;
    }
    let source = FileSource::open(
        wav,
        config.audio.sample_rate,
        config.audio.buffer_size,
        config.audio.hop_size,
        config.audio.realtime,
    )?;
    // A fast run ends as soon as the file is read; keep the whole file around
    // for the final estimate.
    config.audio.history_secs = config
        .audio
        .history_secs
        .max(source.duration().as_secs_f32());
    let settle = Duration::from_secs_f32(
        config
            .tempo
            .period_secs
            .max(config.spectral.period_secs)
            .max(0.0),
    ) + POLL_INTERVAL;

    let mut pipeline = AudioPipeline::new(Box::new(source), config);
    pipeline.start()?;

    let mut next_print = Instant::now() + Duration::from_secs(1);
    while !pipeline.is_finished() {
        thread::sleep(POLL_INTERVAL);
        if Instant::now() >= next_print {
            print_state(&pipeline)?;
            next_print += Duration::from_secs(1);
        }
    }
    thread::sleep(settle);
    print_state(&pipeline)?;
    pipeline.stop()
}

fn print_state(pipeline: &AudioPipeline) -> beatlights_core::Result<()> {
    let state = pipeline.state()?;
    let elapsed = pipeline.clock().map(|clock| clock.now()).unwrap_or_default();
    let line = serde_json::json!({ "t": elapsed, "state": state });
    println!("{line}");
    Ok(())
}

fn fixtures(plot: &Path, action: FixtureAction) -> beatlights_core::Result<()> {
    let mut plot = LightPlot::load(plot)?;
    match action {
        FixtureAction::List => {
            if plot.is_empty() {
                println!("No fixtures patched.");
            }
            for line in plot.listing() {
                println!("{line}");
            }
        }
        FixtureAction::Add {
            kind,
            name,
            address,
            channels,
        } => {
            let kind: FixtureKind = kind.parse()?;
            let fixture = Fixture::build(
                kind,
                &name,
                address,
                channels.iter().map(|(key, offset)| (key.as_str(), *offset)),
            )?;
            // Reject channels that land outside the universe before persisting.
            for param in fixture.channel_map().into_keys() {
                fixture.resolve(param)?;
            }
            let label = fixture.to_string();
            plot.add(fixture)?;
            println!("Added {label}");
        }
        FixtureAction::Remove { index } => {
            let removed = index
                .checked_sub(1)
                .map(|index| plot.remove(index))
                .transpose()?
                .flatten();
            match removed {
                Some(fixture) => println!("Removed {fixture}"),
                None => {
                    return Err(StageError::msg(format!(
                        "no fixture number {index}, the plot has {}",
                        plot.len()
                    )))
                }
            }
        }
    }
    Ok(())
}

#[cfg(feature = "live")]
fn open_live(config: &AppConfig) -> beatlights_core::Result<Box<dyn AudioSource>> {
    let source = beatlights_core::LiveSource::open_default(
        config.audio.sample_rate,
        config.audio.buffer_size,
    )?;
    Ok(Box::new(source))
}

#[cfg(not(feature = "live"))]
fn open_live(_config: &AppConfig) -> beatlights_core::Result<Box<dyn AudioSource>> {
    Err(StageError::DeviceUnavailable {
        device: "microphone".into(),
        reason: "built without the `live` feature; pass --file to play a WAV".into(),
    })
}

fn open_source(
    file: Option<&Path>,
    config: &AppConfig,
) -> beatlights_core::Result<Box<dyn AudioSource>> {
    match file {
        Some(path) => Ok(Box::new(FileSource::open(
            path,
            config.audio.sample_rate,
            config.audio.buffer_size,
            config.audio.hop_size,
            config.audio.realtime,
        )?)),
        None => open_live(config),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

fn parse_channel(value: &str) -> Result<(String, u16), String> {
    let (key, offset) = value
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=OFFSET, got `{value}`"))?;
    let offset = offset
        .trim()
        .parse()
        .map_err(|err| format!("bad offset for `{key}`: {err}"))?;
    Ok((key.trim().to_string(), offset))
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio-reactive DMX lighting controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive the lights from a WAV file or the default microphone.
    Run(RunArgs),
    /// Print the analysis state of a WAV file as JSON lines.
    Analyze {
        wav: PathBuf,
        #[arg(short, long, default_value = "beatlights.json")]
        config: PathBuf,
        /// Read the file as fast as possible instead of in real time.
        #[arg(long)]
        fast: bool,
    },
    /// Inspect or edit the light plot.
    Fixtures {
        #[arg(short, long, default_value = "light_plot.ndjson")]
        plot: PathBuf,
        #[command(subcommand)]
        action: FixtureAction,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// WAV file to play instead of capturing the microphone.
    #[arg(short, long)]
    file: Option<PathBuf>,
    #[arg(short, long, default_value = "beatlights.json")]
    config: PathBuf,
    #[arg(long, default_value = "light_plot.ndjson")]
    plot: PathBuf,
    /// Lighting modes document.
    #[arg(long, default_value = "modes.json")]
    modes: PathBuf,
    #[arg(short, long, default_value = "default")]
    mode: String,
    /// Serial device of the DMX interface.
    #[arg(long, conflicts_with = "simulate")]
    port: Option<PathBuf>,
    /// Log DMX frames instead of sending them. The default without --port.
    #[arg(long)]
    simulate: bool,
}

#[derive(Subcommand, Debug)]
enum FixtureAction {
    /// List patched fixtures, numbered from 1.
    List,
    /// Patch a new fixture.
    Add {
        /// dimr, par, head or haze.
        kind: String,
        name: String,
        /// 0-based base address.
        address: u16,
        /// Channel offset relative to the base, e.g. `r=1`. Repeatable.
        #[arg(short, long = "channel", value_parser = parse_channel)]
        channels: Vec<(String, u16)>,
    },
    /// Remove the fixture with the given list number.
    Remove { index: usize },
}
