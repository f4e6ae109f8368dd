//! CLI for the chanfile filing engine.
//!
//! Provides commands for generating configurations, filing simulated
//! acquisitions into a block file, inspecting block files and benchmarking
//! the buffer write path.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chanfile::block::DEFAULT_BLOCK_SIZE;
use chanfile::record::ExtKind;
use chanfile::store::BlockStore;
use chanfile::time::MAX_TIME;
use chanfile::{
    BlockHeader, Channel, ChannelConfig, ChannelKind, ExtLayout, ExtMark, FileConfig, FileStore,
    Marker, MemStore, Tick, TimeRange,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// chanfile - channel-oriented time-series filing engine CLI.
#[derive(Parser)]
#[command(name = "chanfile", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Write an example file configuration with one channel of each kind.
    InitConfig {
        /// Where to write the JSON configuration.
        path: PathBuf,
    },

    /// File a simulated acquisition into a new block file.
    Simulate {
        /// JSON file configuration.
        config: PathBuf,

        /// Block file to create.
        output: PathBuf,

        /// Length of the acquisition in ticks.
        #[arg(long, default_value = "1000000")]
        duration: Tick,

        /// Ticks of data written per step.
        #[arg(long, default_value = "1000")]
        step: Tick,

        /// Discard every other span of this many ticks (0 saves everything).
        #[arg(long, default_value = "0")]
        discard_every: Tick,
    },

    /// List the blocks of a block file.
    Inspect {
        /// Block file to read.
        path: PathBuf,

        /// Block size the file was written with.
        #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: usize,

        /// Only show this channel.
        #[arg(long)]
        chan: Option<u16>,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Run a write, read and backward search microbenchmark against an in-memory store.
    Bench {
        /// Number of events to write.
        #[arg(long, default_value = "10000000")]
        items: usize,

        /// Circular buffer capacity in events.
        #[arg(long, default_value = "65536")]
        buffer: usize,

        /// Events per write call.
        #[arg(long, default_value = "64")]
        batch: usize,
    },
}

/// Output format for inspect results.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON array of objects.
    Json,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::InitConfig { path } => cmd_init_config(&path),
        Commands::Simulate {
            config,
            output,
            duration,
            step,
            discard_every,
        } => cmd_simulate(&config, &output, duration, step, discard_every),
        Commands::Inspect {
            path,
            block_size,
            chan,
            format,
        } => cmd_inspect(&path, block_size, chan, &format),
        Commands::Bench { items, buffer, batch } => cmd_bench(items, buffer, batch),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `chanfile init-config <path>`.
fn cmd_init_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut channels = BTreeMap::new();
    channels.insert(1, ChannelConfig::waveform(ChannelKind::Adc, 10, 100_000));
    channels.insert(2, ChannelConfig::waveform(ChannelKind::RealWave, 100, 10_000));
    channels.insert(3, ChannelConfig::events(ChannelKind::EventRise, 10_000));
    channels.insert(4, ChannelConfig::events(ChannelKind::EventBoth, 10_000));
    channels.insert(5, ChannelConfig::markers(1_000));
    channels.insert(
        6,
        ChannelConfig::ext_marks(
            ChannelKind::AdcMark,
            ExtLayout::grid(ExtKind::Short, 32, 2, 8),
            10,
            500,
        ),
    );
    channels.insert(
        7,
        ChannelConfig::ext_marks(ChannelKind::TextMark, ExtLayout::text(40), 1, 100),
    );

    let config = FileConfig {
        channels,
        ..FileConfig::default()
    };
    config.validate()?;
    config.save(path)?;
    println!("Wrote {} channel configuration to {}", config.channels.len(), path.display());
    Ok(())
}

/// Implements `chanfile simulate <config> <output>`.
fn cmd_simulate(
    config_path: &Path,
    output: &Path,
    duration: Tick,
    step: Tick,
    discard_every: Tick,
) -> Result<(), Box<dyn std::error::Error>> {
    if duration <= 0 || step <= 0 {
        return Err("duration and step must be positive".into());
    }
    let config = FileConfig::load(config_path)?;
    let mut store = FileStore::create(output, config.block_size, config.max_blocks)?;

    let mut channels = Vec::with_capacity(config.channels.len());
    for (&chan, channel_config) in &config.channels {
        channels.push(Channel::new(chan, channel_config.clone(), config.block_size)?);
    }
    info!(channels = channels.len(), duration, step, "simulating acquisition");

    let start = Instant::now();
    let mut t = 0;
    while t < duration {
        let upto = (t + step).min(duration);
        if discard_every > 0 && t % discard_every == 0 {
            let save = (t / discard_every) % 2 == 0;
            for chan in &mut channels {
                chan.set_save(t, save);
            }
        }
        for chan in &mut channels {
            simulate_step(chan, &mut store, t, upto)?;
        }
        t = upto;
    }
    for chan in &mut channels {
        chan.flush(&mut store)?;
    }
    store.sync()?;
    let elapsed = start.elapsed();

    println!("Simulated {duration} ticks in {elapsed:.3?}");
    for chan in &channels {
        let blocks = store.block_count(chan.number());
        println!(
            "  Channel {:>3} {:<10} blocks={blocks:<6} buffered={}",
            chan.number(),
            format!("{:?}", chan.kind()),
            chan.buffered(),
        );
    }
    println!("Free slots: {}", store.free_slots());
    Ok(())
}

/// Generates the data of `[from, upto)` for one channel.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::cast_sign_loss)]
fn simulate_step<T: BlockStore + ?Sized>(
    chan: &mut Channel,
    store: &mut T,
    from: Tick,
    upto: Tick,
) -> chanfile::Result<()> {
    let divide = chan.config().divide;
    // first multiple of `every` at or after `from`
    let aligned = |every: Tick| (from + every - 1) / every * every;

    match chan.kind() {
        ChannelKind::Adc => {
            let t0 = aligned(divide);
            let samples: Vec<i16> = (t0..upto)
                .step_by(divide as usize)
                .map(|t| ((t / divide) % 2000 - 1000) as i16)
                .collect();
            chan.write_wave(store, &samples, t0)
        }
        ChannelKind::RealWave => {
            let t0 = aligned(divide);
            let samples: Vec<f32> = (t0..upto)
                .step_by(divide as usize)
                .map(|t| ((t / divide) as f32 * 0.01).sin())
                .collect();
            chan.write_wave(store, &samples, t0)
        }
        ChannelKind::EventFall | ChannelKind::EventRise | ChannelKind::EventBoth => {
            let times: Vec<Tick> = (aligned(97)..upto).step_by(97).collect();
            chan.write_events(store, &times)
        }
        ChannelKind::Marker => {
            let markers: Vec<Marker> = (aligned(1000)..upto)
                .step_by(1000)
                .map(|t| Marker::with_codes(t, [((t / 1000) % 4) as u8, 0, 0, 0]))
                .collect();
            chan.write_markers(store, &markers)
        }
        ChannelKind::AdcMark | ChannelKind::RealMark | ChannelKind::TextMark => {
            let Some(layout) = chan.config().layout else {
                return Ok(());
            };
            let every = (layout.rows as Tick * divide).max(5000);
            let marks: Vec<ExtMark> = (aligned(every)..upto)
                .step_by(every as usize)
                .map(|t| {
                    let marker = Marker::with_codes(t, [((t / every) % 4) as u8, 0, 0, 0]);
                    let points = layout.rows * layout.cols;
                    match layout.kind {
                        ExtKind::Text => ExtMark::text(marker, &format!("mark at {t}")),
                        ExtKind::Short => {
                            let data: Vec<i16> = (0..points).map(|i| i as i16).collect();
                            ExtMark::shorts(marker, &data)
                        }
                        ExtKind::Real => {
                            let data: Vec<f32> = (0..points).map(|i| i as f32).collect();
                            ExtMark::reals(marker, &data)
                        }
                    }
                })
                .collect();
            chan.write_ext_marks(store, &marks)
        }
    }
}

/// Implements `chanfile inspect <path>`.
fn cmd_inspect(
    path: &Path,
    block_size: usize,
    only: Option<u16>,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStore::open(path, block_size)?;
    let channels: Vec<u16> = store
        .channels()
        .into_iter()
        .filter(|c| only.is_none_or(|o| o == *c))
        .collect();

    let mut rows = Vec::new();
    for &chan in &channels {
        for index in 0..store.block_count(chan) {
            let header = BlockHeader::read(&store.load(chan, index)?)?;
            debug!(chan, index, items = header.items, "read block header");
            rows.push((index, header));
        }
    }

    match format {
        OutputFormat::Csv => {
            println!("# file={}, block_size={block_size}, blocks={}", store.path(), rows.len());
            println!("chan,index,kind,items,used,first,last");
            for (index, h) in &rows {
                println!(
                    "{},{index},{:?},{},{},{},{}",
                    h.chan, h.kind, h.items, h.used, h.first, h.last
                );
            }
        }
        OutputFormat::Json => {
            let blocks: Vec<serde_json::Value> = rows
                .iter()
                .map(|(index, h)| {
                    serde_json::json!({
                        "chan": h.chan,
                        "index": index,
                        "kind": format!("{:?}", h.kind),
                        "items": h.items,
                        "used": h.used,
                        "first": h.first,
                        "last": h.last,
                    })
                })
                .collect();

            let output = serde_json::json!({
                "file": store.path(),
                "block_size": block_size,
                "channels": channels,
                "free_slots": store.free_slots(),
                "blocks": blocks,
            });

            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Implements `chanfile bench`.
#[allow(clippy::cast_precision_loss)]
fn cmd_bench(items: usize, buffer: usize, batch: usize) -> Result<(), Box<dyn std::error::Error>> {
    if batch == 0 {
        return Err("batch must be positive".into());
    }
    println!("chanfile write-path benchmark");
    println!("  Events: {items}");
    println!("  Buffer: {buffer}");
    println!("  Batch: {batch}");
    println!();

    let mut store = MemStore::new(DEFAULT_BLOCK_SIZE);
    let config = ChannelConfig::events(ChannelKind::EventRise, buffer);
    let mut chan = Channel::new(1, config, DEFAULT_BLOCK_SIZE)?;
    let times: Vec<Tick> = (1..=items as Tick).collect();

    let start = Instant::now();
    for chunk in times.chunks(batch) {
        chan.write_events(&mut store, chunk)?;
    }
    chan.flush(&mut store)?;
    let elapsed = start.elapsed();

    let ns_per_write = elapsed.as_nanos() as f64 / items.max(1) as f64;
    let writes_per_sec = items as f64 / elapsed.as_secs_f64();

    let mut out = Vec::with_capacity(items.min(1_000_000));
    let read_start = Instant::now();
    let mut cursor = TimeRange::new(0, MAX_TIME, 1_000_000, true, 0);
    let read = chan.read_events(&store, &mut cursor, &mut out)?;
    let read_elapsed = read_start.elapsed();

    let searches = 1000;
    let search_start = Instant::now();
    for k in 1..=searches {
        let mut cursor = TimeRange::new(0, MAX_TIME, k * 7, false, 0);
        chan.prev_n_time(&store, &mut cursor, None)?;
    }
    let ns_per_search = search_start.elapsed().as_nanos() as f64 / searches as f64;

    println!("Results:");
    println!("  Blocks stored: {}", store.total_blocks());
    println!("  Elapsed: {elapsed:.3?}");
    println!("  Avg latency: {ns_per_write:.1} ns/event");
    println!("  Throughput: {writes_per_sec:.0} events/sec");
    println!("  Read back {read} events in {read_elapsed:.3?}");
    println!("  Backward search: {ns_per_search:.1} ns/search");
    println!();

    Ok(())
}
