// SPDX-License-Identifier: MPL-2.0

//! Headless player for animated GIF and WebP files.
//!
//! Every source found at the given paths is decoded and played on a calloop
//! event loop. Presented frames can be written out as PNG files, which makes
//! the binary handy for checking timing and compositing without a display.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use calloop::{
    EventLoop,
    ping::make_ping,
    signals::{Signal, Signals},
    timer::{TimeoutAction, Timer},
};
use clap::Parser;
use eyre::{WrapErr, eyre};
use frameseq::{
    Configuration, ConfigurationBuilder, DecodeError, FrameSequenceKind, FrameSink, LogLevel,
    Player, Settings, sequence::is_animated_file,
};
use image::RgbaImage;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[derive(Debug, Parser)]
#[command(version, about = "Play animated GIF and WebP files without a display")]
struct Args {
    /// Files or directories to play
    #[arg(required = true)]
    sources: Vec<PathBuf>,

    /// Seconds to play before exiting
    #[arg(long, default_value_t = 10)]
    seconds: u64,

    /// Interval between render ticks, in milliseconds
    #[arg(long, default_value_t = 16)]
    tick_ms: u64,

    /// Write every presented frame as PNG into this directory
    #[arg(long)]
    dump_dir: Option<PathBuf>,

    /// Settings file to use instead of the one in the user config directory
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log every scheduling, swap and drop decision
    #[arg(short, long)]
    verbose: bool,
}

struct State {
    players: Vec<Player>,
    exit: bool,
}

impl State {
    fn tick(&mut self) {
        for player in &mut self.players {
            player.tick();
        }
    }
}

/// Logs playback events and optionally dumps frames.
struct FrameLog {
    label: String,
    dump: Option<(PathBuf, String)>,
    presented: u64,
}

impl FrameSink for FrameLog {
    fn present(&mut self, frame: usize, pixels: &RgbaImage) {
        self.presented += 1;
        let Some((dir, stem)) = &self.dump else {
            return;
        };
        let path = dir.join(format!("{stem}-{:06}-f{frame:04}.png", self.presented));
        if let Err(why) = pixels.save(&path) {
            warn!(path = %path.display(), "failed to write frame: {why}");
        }
    }

    fn playback_started(&mut self) {
        info!(label = %self.label, "first frame on screen");
    }

    fn looped(&mut self, count: u64) {
        debug!(label = %self.label, count, "looped");
    }

    fn failed(&mut self, error: &DecodeError) {
        error!(label = %self.label, %error, "playback halted");
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    init_tracing(args.verbose);

    // Signals are masked per thread, so register them before the decoding
    // pool spawns its workers.
    let mut event_loop: EventLoop<State> = EventLoop::try_new()?;
    let handle = event_loop.handle();
    let signals = Signals::new(&[Signal::SIGINT, Signal::SIGTERM])?;
    handle
        .insert_source(signals, |event, _, state| {
            info!(signal = ?event.signal(), "shutting down");
            state.exit = true;
        })
        .map_err(|err| eyre!("{}", err))?;

    let mut settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::load_default().unwrap_or_else(|why| {
            warn!("settings error, falling back to defaults: {why}");
            Settings::default()
        }),
    };
    if args.verbose {
        settings.log_level = LogLevel::Verbose;
    }
    let configuration =
        Configuration::init(ConfigurationBuilder::from_settings(&settings)?.build()?)?;

    if let Some(dir) = &args.dump_dir {
        fs::create_dir_all(dir).wrap_err_with(|| format!("failed to create {}", dir.display()))?;
    }

    let paths = collect_sources(&args.sources);
    if paths.is_empty() {
        eyre::bail!("no GIF or WebP files found");
    }

    let (ping, ping_source) = make_ping()?;
    handle
        .insert_source(ping_source, |_, _, state| state.tick())
        .map_err(|err| eyre!("{}", err))?;

    let mut players = Vec::with_capacity(paths.len());
    for path in &paths {
        match load_player(path, &configuration, args.dump_dir.as_deref()) {
            Ok(mut player) => {
                let ping = ping.clone();
                player.set_waker(move || ping.ping());
                player.play();
                players.push(player);
            }
            Err(why) => warn!(path = %path.display(), "skipping source: {why:?}"),
        }
    }
    if players.is_empty() {
        eyre::bail!("none of the {} sources could be decoded", paths.len());
    }
    info!(players = players.len(), memory = %configuration.memory_usage(), "playing");

    let tick = Duration::from_millis(args.tick_ms.max(1));
    handle
        .insert_source(Timer::from_duration(tick), move |_, _, state| {
            state.tick();
            TimeoutAction::ToDuration(tick)
        })
        .map_err(|err| eyre!("{}", err))?;
    handle
        .insert_source(
            Timer::from_duration(Duration::from_secs(args.seconds)),
            |_, _, state| {
                info!("playback time elapsed");
                state.exit = true;
                TimeoutAction::Drop
            },
        )
        .map_err(|err| eyre!("{}", err))?;

    let mut state = State {
        players,
        exit: false,
    };
    while !state.exit {
        event_loop.dispatch(tick, &mut state)?;
    }

    for player in &mut state.players {
        let stats = player.stats();
        info!(
            label = player.label(),
            presented = stats.frames_presented,
            dropped = stats.frames_dropped,
            failures = stats.decode_failures,
            loops = stats.loops,
            average_lateness = ?stats.average_lateness(),
            max_lateness = ?stats.max_lateness(),
            "playback summary"
        );
        player.release();
    }
    info!(memory = %configuration.memory_usage(), "released all players");

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info,frameseq=trace" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Expand directories into the animated files they contain, sorted by path.
fn collect_sources(sources: &[PathBuf]) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for source in sources {
        if source.is_dir() {
            let mut found: Vec<PathBuf> = WalkDir::new(source)
                .follow_links(true)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|entry| entry.file_type().is_file())
                .map(walkdir::DirEntry::into_path)
                .filter(|path| is_animated_file(path))
                .collect();
            found.sort();
            paths.extend(found);
        } else {
            paths.push(source.clone());
        }
    }
    paths
}

fn load_player(
    path: &Path,
    configuration: &Configuration,
    dump_dir: Option<&Path>,
) -> eyre::Result<Player> {
    let data = fs::read(path).wrap_err_with(|| format!("failed to read {}", path.display()))?;
    let kind = FrameSequenceKind::detect(&data)
        .or_else(|| FrameSequenceKind::from_path(path))
        .ok_or_else(|| eyre!("unrecognized format: {}", path.display()))?;

    let sequence = kind
        .decode(data, configuration.memory_usage())
        .wrap_err_with(|| format!("failed to decode {}", path.display()))?;
    let strategy = kind.drop_frames_strategy(!sequence.is_opaque());
    info!(
        path = %path.display(),
        format = kind.name(),
        width = sequence.width(),
        height = sequence.height(),
        frames = sequence.frame_count(),
        ?strategy,
        "loaded source"
    );

    let label = path.display().to_string();
    let stem = path
        .file_stem()
        .map_or_else(|| String::from("frame"), |stem| stem.to_string_lossy().into_owned());
    let sink = FrameLog {
        label: label.clone(),
        dump: dump_dir.map(|dir| (dir.to_path_buf(), stem)),
        presented: 0,
    };

    let player = Player::builder(sequence)
        .strategy(strategy)
        .label(label)
        .sink(Box::new(sink))
        .build(configuration)?;
    Ok(player)
}
