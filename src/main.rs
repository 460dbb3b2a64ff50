use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use cae::audio::{
    DriverConfig, DriverEvent, EngineMode, NORMAL_SPEED, PlayState, RecordRequest, RecordState,
};
use cae::Driver;
use tracing_subscriber::EnvFilter;

const PROCESS_INTERVAL: Duration = Duration::from_millis(50);

fn print_help() {
    println!("cae - real-time audio engine for broadcast automation");
    println!();
    println!("USAGE:");
    println!("    cae [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help                  Print this help message");
    println!("    --config PATH               Load driver settings from a TOML file");
    println!("    --debug                     Enable debug logging");
    println!("    --list                      Print the card list and exit");
    println!("    --card N                    Card used by --play and --record (default 0)");
    println!("    --play FILE                 Play a WAV file on the first free stream");
    println!("    --record FILE               Record input port 0 to a 16-bit WAV file");
    println!("    --seconds S                 Length of --record in seconds");
    println!("    --passthrough IN:OUT:LEVEL  Route input port IN to output port OUT");
    println!("                                at LEVEL hundredths of a dB (repeatable)");
    println!();
    println!("EXAMPLES:");
    println!("    cae --list");
    println!("    cae --play spot.wav --card 1");
    println!("    cae --record air.wav --seconds 30 --passthrough 0:0:-600");
}

#[derive(Debug, Default)]
struct Options {
    config: Option<PathBuf>,
    debug: bool,
    list: bool,
    card: usize,
    play: Option<PathBuf>,
    record: Option<PathBuf>,
    seconds: Option<u32>,
    passthrough: Vec<(usize, usize, i32)>,
}

fn parse_route(text: &str) -> Result<(usize, usize, i32)> {
    let mut parts = text.split(':');
    let (Some(input), Some(output), Some(level), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        bail!("passthrough route '{text}' is not IN:OUT:LEVEL");
    };
    Ok((
        input.parse().context("passthrough input port")?,
        output.parse().context("passthrough output port")?,
        level.parse().context("passthrough level")?,
    ))
}

fn parse_args(args: &[String]) -> Result<Option<Options>> {
    let mut options = Options::default();
    let mut args = args.iter().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .cloned()
                .ok_or_else(|| anyhow!("{name} needs a value"))
        };
        match arg.as_str() {
            "-h" | "--help" => return Ok(None),
            "--debug" => options.debug = true,
            "--list" => options.list = true,
            "--config" => options.config = Some(value("--config")?.into()),
            "--card" => options.card = value("--card")?.parse().context("--card")?,
            "--play" => options.play = Some(value("--play")?.into()),
            "--record" => options.record = Some(value("--record")?.into()),
            "--seconds" => options.seconds = Some(value("--seconds")?.parse().context("--seconds")?),
            "--passthrough" => options.passthrough.push(parse_route(&value("--passthrough")?)?),
            other => bail!("unknown option '{other}', see --help"),
        }
    }
    if options.record.is_some() && options.seconds.is_none() {
        bail!("--record needs --seconds");
    }
    Ok(Some(options))
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(options) = parse_args(&args)? else {
        print_help();
        return Ok(());
    };

    let default_level = if options.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = match &options.config {
        Some(path) => DriverConfig::load(path)?,
        None => DriverConfig::default(),
    };
    let freewheel = config.engine_mode == EngineMode::Freewheel;
    let mut driver = Driver::builder(config).build()?;

    for card in driver.cards() {
        println!(
            "{}: {} [{}] {} Hz inputs={} outputs={}",
            card.index, card.name, card.driver, card.sample_rate, card.inputs, card.outputs
        );
    }
    if options.list {
        return Ok(());
    }

    let card = options.card;
    let Some(info) = driver.card_info(card).cloned() else {
        bail!("no card {card}");
    };

    for (input, output, level) in &options.passthrough {
        driver.set_passthrough_level(card, *input, *output, *level)?;
    }

    let mut playing = None;
    if let Some(path) = &options.play {
        let stream = driver.load_playback(card, path)?;
        driver.play(card, stream, 0, NORMAL_SPEED, false)?;
        playing = Some(stream);
        println!("playing {} on card {card} stream {stream}", path.display());
    }

    let mut recording = false;
    if let (Some(path), Some(seconds)) = (&options.record, options.seconds) {
        driver.load_record(card, 0, RecordRequest::pcm16(2, info.sample_rate), path)?;
        driver.record(card, 0, seconds.saturating_mul(1000), cae::audio::MUTE_LEVEL)?;
        recording = true;
        println!("recording {} for {seconds} s", path.display());
    }

    let events = driver.events();
    let passthrough_only = playing.is_none() && !recording;
    if passthrough_only && options.passthrough.is_empty() {
        return Ok(());
    }

    let frames_per_tick = {
        let rate = info.sample_rate as u64;
        (rate * PROCESS_INTERVAL.as_millis() as u64 / 1000) as usize
    };
    let period = driver.config().period_size.max(1);
    loop {
        let started = Instant::now();
        if freewheel {
            driver.run_periods(card, frames_per_tick.div_ceil(period))?;
        }
        driver.process_buffers();

        for event in events.try_iter() {
            match event {
                DriverEvent::Play {
                    stream,
                    state: PlayState::Stopped,
                    ..
                } if Some(stream) == playing => {
                    println!("playback finished");
                    playing = None;
                }
                DriverEvent::Record {
                    state: RecordState::Stopped,
                    ..
                } => {
                    println!("recording finished");
                    recording = false;
                }
                other => tracing::debug!(?other, "event"),
            }
        }
        if !passthrough_only && playing.is_none() && !recording {
            break;
        }

        let meters = driver.output_meters(card, 0).unwrap_or([-10000; 2]);
        tracing::trace!(card = info.index, left = meters[0], right = meters[1], "output meters");
        thread::sleep(PROCESS_INTERVAL.saturating_sub(started.elapsed()));
    }

    driver.shutdown();
    println!("cae stopped.");
    Ok(())
}
