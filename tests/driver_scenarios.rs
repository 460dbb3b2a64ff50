use std::path::Path;
use std::time::{Duration, Instant};

use cae::audio::backend::{MemoryBackend, MemoryCardHandle, MemoryCardSpec};
use cae::audio::{
    Coding, Direction, Driver, DriverConfig, DriverError, DriverEvent, EngineMode, MUTE_LEVEL,
    NORMAL_SPEED, PlayState, RecordRequest, RecordState,
};
use tempfile::TempDir;

const PERIOD: usize = 256;

fn config() -> DriverConfig {
    DriverConfig {
        engine_mode: EngineMode::Freewheel,
        max_ports: 2,
        max_streams: 4,
        ..Default::default()
    }
}

fn driver_with(config: DriverConfig) -> (Driver, MemoryCardHandle) {
    let (backend, handle) = MemoryBackend::with_card(MemoryCardSpec::default());
    let driver = Driver::builder(config).backend(backend).build().unwrap();
    (driver, handle)
}

fn driver() -> (Driver, MemoryCardHandle) {
    driver_with(config())
}

fn write_wav(path: &Path, channels: u16, rate: u32, samples: &[i16]) {
    let spec = hound::WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for sample in samples {
        writer.write_sample(*sample).unwrap();
    }
    writer.finalize().unwrap();
}

/// Split S32 playback output of a 4-channel card into frames.
fn frames(bytes: Vec<u8>) -> Vec<[i32; 4]> {
    bytes
        .chunks_exact(16)
        .map(|frame| {
            let mut out = [0; 4];
            for (sample, b) in out.iter_mut().zip(frame.chunks_exact(4)) {
                *sample = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            }
            out
        })
        .collect()
}

fn push_capture(handle: &MemoryCardHandle, frame: [i32; 4], count: usize) {
    let bytes: Vec<u8> = frame.iter().flat_map(|s| s.to_le_bytes()).collect();
    for _ in 0..count {
        handle.push_capture(&bytes);
    }
}

fn drain_events(driver: &Driver) -> Vec<DriverEvent> {
    driver.events().try_iter().collect()
}

#[test]
fn test_enumerates_memory_card() {
    let (driver, _) = driver();
    let cards: Vec<_> = driver.cards().collect();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].name, "Memory Card");
    assert_eq!(cards[0].inputs, 2);
    assert_eq!(cards[0].outputs, 2);
    assert_eq!(cards[0].sample_rate, 48000);
}

#[test]
fn test_default_backend_from_toml() {
    let config = DriverConfig::from_toml_str(
        r#"
        backend = "memory"
        engine_mode = "freewheel"
        max_ports = 1
        "#,
    )
    .unwrap();
    let driver = Driver::builder(config).build().unwrap();
    let card = driver.card_info(0).unwrap();
    assert_eq!(card.driver, "memory");
    assert_eq!((card.inputs, card.outputs), (1, 1));
}

#[test]
fn test_mono_stream_reaches_both_channels_and_mute_is_silent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tone.wav");
    write_wav(&path, 1, 48000, &vec![8192; 4800]);

    let (mut driver, handle) = driver();
    let stream = driver.load_playback(0, &path).unwrap();
    assert_eq!(stream, 0);
    driver.set_output_volume(0, stream, 1, MUTE_LEVEL).unwrap();
    driver.play(0, stream, 0, NORMAL_SPEED, false).unwrap();
    driver.run_periods(0, 2).unwrap();

    let out = frames(handle.take_playback());
    assert_eq!(out.len(), 2 * PERIOD);
    let full = 8192 << 16;
    assert!(out.iter().all(|frame| *frame == [full, full, 0, 0]));

    assert_eq!(driver.output_meters(0, 1).unwrap(), [MUTE_LEVEL; 2]);
    let stream_meters = driver.stream_output_meters(0, stream).unwrap();
    assert_eq!(stream_meters[0], stream_meters[1]);
    assert!(stream_meters[0] > MUTE_LEVEL && stream_meters[0] < 0);
}

#[test]
fn test_loaded_but_stopped_stream_is_not_mixed() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tone.wav");
    write_wav(&path, 2, 48000, &vec![4000; 2000]);

    let (mut driver, handle) = driver();
    driver.load_playback(0, &path).unwrap();
    driver.run_periods(0, 1).unwrap();
    assert!(frames(handle.take_playback()).iter().all(|f| *f == [0; 4]));
    assert_eq!(driver.output_positions(0).unwrap()[0], 0);
}

#[test]
fn test_streams_sum_and_saturate() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("loud.wav");
    write_wav(&path, 1, 48000, &vec![24576; 4800]);

    let (mut driver, handle) = driver();
    for _ in 0..2 {
        let stream = driver.load_playback(0, &path).unwrap();
        driver.play(0, stream, 0, NORMAL_SPEED, false).unwrap();
    }
    driver.run_periods(0, 1).unwrap();

    let out = frames(handle.take_playback());
    assert!(out.iter().all(|frame| *frame == [i32::MAX; 4]));
}

#[test]
fn test_stream_slots_are_exhausted_and_reused() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tone.wav");
    write_wav(&path, 2, 48000, &vec![100; 960]);

    let (mut driver, _) = driver_with(DriverConfig {
        max_streams: 2,
        ..config()
    });
    assert_eq!(driver.load_playback(0, &path).unwrap(), 0);
    assert_eq!(driver.load_playback(0, &path).unwrap(), 1);
    assert!(matches!(
        driver.load_playback(0, &path),
        Err(DriverError::NoFreeStream(0))
    ));

    driver.stop_playback(0, 0).unwrap();
    assert_eq!(driver.load_playback(0, &path).unwrap(), 0);
    assert!(matches!(
        driver.stop_playback(0, 3),
        Err(DriverError::InvalidStream { card: 0, stream: 3 })
    ));
}

#[test]
fn test_passthrough_routes_input_without_streams() {
    let (mut driver, handle) = driver();
    driver.set_passthrough_level(0, 0, 1, 0).unwrap();
    push_capture(&handle, [1 << 20, 2 << 20, 7 << 20, 9 << 20], PERIOD);

    driver.run_periods(0, 1).unwrap();

    let out = frames(handle.take_playback());
    assert_eq!(out.len(), PERIOD);
    assert!(out.iter().all(|frame| *frame == [0, 0, 1 << 20, 2 << 20]));
    assert!(driver.input_meters(0, 0).unwrap()[1] > MUTE_LEVEL);
    assert!(driver.output_meters(0, 1).unwrap()[0] > MUTE_LEVEL);
}

#[test]
fn test_natural_end_frees_the_slot() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short.wav");
    write_wav(&path, 1, 48000, &vec![1000; 300]);

    let (mut driver, _) = driver();
    let stream = driver.load_playback(0, &path).unwrap();
    driver.play(0, stream, 0, NORMAL_SPEED, false).unwrap();
    driver.run_periods(0, 3).unwrap();
    driver.process_buffers();

    assert_eq!(
        drain_events(&driver),
        vec![
            DriverEvent::Play {
                card: 0,
                stream,
                state: PlayState::Playing
            },
            DriverEvent::Play {
                card: 0,
                stream,
                state: PlayState::Stopped
            },
        ]
    );
    assert!(matches!(
        driver.play(0, stream, 0, NORMAL_SPEED, false),
        Err(DriverError::NotLoaded { .. })
    ));
}

#[test]
fn test_play_length_stops_at_deadline() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tone.wav");
    write_wav(&path, 2, 48000, &vec![100; 96000]);

    let (mut driver, _) = driver();
    let stream = driver.load_playback(0, &path).unwrap();
    driver.play(0, stream, 250, NORMAL_SPEED, false).unwrap();
    assert!(matches!(
        driver.play(0, stream, 0, NORMAL_SPEED, false),
        Err(DriverError::AlreadyPlaying { .. })
    ));

    driver.process_buffers_at(Instant::now() + Duration::from_secs(1));
    let events = drain_events(&driver);
    assert_eq!(
        events.last(),
        Some(&DriverEvent::Play {
            card: 0,
            stream,
            state: PlayState::Stopped
        })
    );
    assert_eq!(driver.output_positions(0).unwrap()[stream], 0);
}

#[test]
fn test_seek_moves_position_and_rejects_past_end() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tone.wav");
    write_wav(&path, 1, 48000, &vec![100; 4800]);

    let (mut driver, _) = driver();
    let stream = driver.load_playback(0, &path).unwrap();
    driver.play(0, stream, 0, NORMAL_SPEED, false).unwrap();
    driver.run_periods(0, 2).unwrap();
    assert_eq!(driver.output_positions(0).unwrap()[stream], 10);

    assert!(matches!(
        driver.playback_position(0, stream, 200),
        Err(DriverError::SeekOutOfRange {
            position_ms: 200,
            length_ms: 100
        })
    ));
    driver.playback_position(0, stream, 50).unwrap();
    assert_eq!(driver.output_positions(0).unwrap()[stream], 50);
    driver.run_periods(0, 2).unwrap();
    assert_eq!(driver.output_positions(0).unwrap()[stream], 60);
}

#[test]
fn test_seek_keeps_the_play_deadline() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tone.wav");
    write_wav(&path, 2, 48000, &vec![100; 96000]);

    let (mut driver, _) = driver();
    let stream = driver.load_playback(0, &path).unwrap();
    let start = Instant::now();
    driver.play(0, stream, 1000, NORMAL_SPEED, false).unwrap();
    std::thread::sleep(Duration::from_millis(80));
    driver.playback_position(0, stream, 10).unwrap();

    driver.process_buffers_at(start + Duration::from_millis(1030));
    assert_eq!(
        drain_events(&driver).last(),
        Some(&DriverEvent::Play {
            card: 0,
            stream,
            state: PlayState::Stopped
        })
    );
}

#[test]
fn test_stream_meters_fall_silent_after_end() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("short.wav");
    write_wav(&path, 1, 48000, &vec![16384; 300]);

    let (mut driver, _) = driver();
    let stream = driver.load_playback(0, &path).unwrap();
    driver.play(0, stream, 0, NORMAL_SPEED, false).unwrap();
    driver.run_periods(0, 10).unwrap();
    driver.process_buffers();

    assert!(driver.output_positions(0).unwrap().iter().all(|&pos| pos == 0));
    assert_eq!(
        driver.stream_output_meters(0, stream).unwrap(),
        [MUTE_LEVEL, MUTE_LEVEL]
    );
}

#[test]
fn test_stopping_an_unplayed_stream_is_silent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tone.wav");
    write_wav(&path, 2, 48000, &vec![100; 960]);

    let (mut driver, _) = driver();
    let stream = driver.load_playback(0, &path).unwrap();
    driver.stop_playback(0, stream).unwrap();
    assert!(drain_events(&driver).is_empty());

    let stream = driver.load_playback(0, &path).unwrap();
    driver.play(0, stream, 0, NORMAL_SPEED, false).unwrap();
    driver.stop_playback(0, stream).unwrap();
    assert_eq!(
        drain_events(&driver),
        vec![
            DriverEvent::Play {
                card: 0,
                stream,
                state: PlayState::Playing
            },
            DriverEvent::Play {
                card: 0,
                stream,
                state: PlayState::Stopped
            },
        ]
    );
}

#[test]
fn test_resampled_file_plays_to_completion() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("low.wav");
    write_wav(&path, 1, 24000, &vec![2000; 2400]);

    let (mut driver, _) = driver();
    let stream = driver.load_playback(0, &path).unwrap();
    driver.play(0, stream, 0, NORMAL_SPEED, false).unwrap();
    driver.run_periods(0, 2).unwrap();
    assert_eq!(driver.output_positions(0).unwrap()[stream], 10);

    driver.run_periods(0, 20).unwrap();
    driver.process_buffers();
    assert!(drain_events(&driver).contains(&DriverEvent::Play {
        card: 0,
        stream,
        state: PlayState::Stopped
    }));
}

#[test]
fn test_record_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("take.wav");

    let (mut driver, handle) = driver();
    driver
        .load_record(0, 0, RecordRequest::pcm16(2, 48000), &path)
        .unwrap();
    assert!(matches!(
        driver.load_record(0, 0, RecordRequest::pcm16(2, 48000), &path),
        Err(DriverError::RecordBusy { card: 0, port: 0 })
    ));
    driver.record(0, 0, 0, MUTE_LEVEL).unwrap();

    push_capture(&handle, [1000 << 16, -1000 << 16, 5 << 16, 5 << 16], PERIOD);
    driver.run_periods(0, 1).unwrap();
    driver.process_buffers();
    assert_eq!(driver.stop_record(0, 0).unwrap(), PERIOD as u64);

    assert_eq!(
        drain_events(&driver),
        vec![
            DriverEvent::Record {
                card: 0,
                port: 0,
                state: RecordState::Recording
            },
            DriverEvent::Record {
                card: 0,
                port: 0,
                state: RecordState::Stopped
            },
        ]
    );

    let mut reader = hound::WavReader::open(&path).unwrap();
    assert_eq!(reader.spec().channels, 2);
    let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
    assert_eq!(samples.len(), 2 * PERIOD);
    assert!(samples.chunks_exact(2).all(|pair| pair == [1000, -1000]));
}

#[test]
fn test_mono_record_sums_channels() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mono.wav");

    let (mut driver, handle) = driver();
    driver
        .load_record(0, 1, RecordRequest::pcm16(1, 48000), &path)
        .unwrap();
    driver.record(0, 1, 0, MUTE_LEVEL).unwrap();
    push_capture(&handle, [0, 0, 300 << 16, 400 << 16], PERIOD);
    driver.run_periods(0, 1).unwrap();
    assert_eq!(driver.stop_record(0, 1).unwrap(), PERIOD as u64);

    let mut reader = hound::WavReader::open(&path).unwrap();
    let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
    assert!(samples.iter().all(|s| *s == 700));
}

#[test]
fn test_vox_holds_recording_until_threshold() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vox.wav");

    let (mut driver, handle) = driver();
    driver
        .load_record(0, 0, RecordRequest::pcm16(2, 48000), &path)
        .unwrap();
    driver.record(0, 0, 0, -2000).unwrap();

    push_capture(&handle, [100 << 16, 100 << 16, 0, 0], PERIOD);
    driver.run_periods(0, 1).unwrap();
    driver.process_buffers();
    assert!(drain_events(&driver).is_empty());

    push_capture(&handle, [16384 << 16, 16384 << 16, 0, 0], PERIOD);
    driver.run_periods(0, 1).unwrap();
    driver.process_buffers();
    assert_eq!(
        drain_events(&driver),
        vec![DriverEvent::Record {
            card: 0,
            port: 0,
            state: RecordState::Recording
        }]
    );
    assert_eq!(driver.stop_record(0, 0).unwrap(), PERIOD as u64);
}

#[test]
fn test_record_length_deadline() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("timed.wav");

    let (mut driver, _) = driver();
    driver
        .load_record(0, 0, RecordRequest::pcm16(2, 48000), &path)
        .unwrap();
    driver.record(0, 0, 100, MUTE_LEVEL).unwrap();
    driver.run_periods(0, 4).unwrap();
    driver.process_buffers_at(Instant::now() + Duration::from_secs(1));

    let events = drain_events(&driver);
    assert_eq!(
        events.last(),
        Some(&DriverEvent::Record {
            card: 0,
            port: 0,
            state: RecordState::Stopped
        })
    );
    assert!(matches!(
        driver.stop_record(0, 0),
        Err(DriverError::NotArmed { card: 0, port: 0 })
    ));
    assert_eq!(
        hound::WavReader::open(&path).unwrap().duration(),
        4 * PERIOD as u32
    );
}

#[test]
fn test_record_request_validation() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.wav");
    let (mut driver, _) = driver();

    assert!(matches!(
        driver.load_record(0, 0, RecordRequest::pcm16(2, 44100), &path),
        Err(DriverError::SampleRateMismatch {
            requested: 44100,
            device: 48000
        })
    ));
    assert!(matches!(
        driver.load_record(0, 0, RecordRequest::pcm16(3, 48000), &path),
        Err(DriverError::UnsupportedChannels(3))
    ));
    let mpeg = RecordRequest {
        coding: Coding::MpegLayer2,
        channels: 2,
        sample_rate: 48000,
        bit_rate: 256_000,
    };
    assert!(matches!(
        driver.load_record(0, 0, mpeg, &path),
        Err(DriverError::UnsupportedCoding(Coding::MpegLayer2))
    ));
    assert!(matches!(
        driver.record(0, 0, 0, MUTE_LEVEL),
        Err(DriverError::NotArmed { card: 0, port: 0 })
    ));
}

#[test]
fn test_unload_armed_record_is_silent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("armed.wav");
    let (mut driver, _) = driver();
    driver
        .load_record(0, 0, RecordRequest::pcm16(2, 48000), &path)
        .unwrap();
    assert_eq!(driver.unload_record(0, 0).unwrap(), 0);
    assert!(drain_events(&driver).is_empty());
    assert_eq!(hound::WavReader::open(&path).unwrap().duration(), 0);
}

#[test]
fn test_fade_moves_gain_over_ticks() {
    let (mut driver, _) = driver();
    let start = Instant::now();
    driver.fade_output_volume(0, 1, 0, -3000, 200).unwrap();

    driver.process_buffers_at(start + Duration::from_millis(55));
    let midway = driver.output_volume(0, 1, 0).unwrap();
    assert!(midway < 0 && midway > -3000, "midway level {midway}");

    driver.process_buffers_at(start + Duration::from_secs(2));
    assert_eq!(driver.output_volume(0, 1, 0).unwrap(), -3000);
}

#[test]
fn test_xruns_are_recovered() {
    let (mut driver, handle) = driver();
    handle.inject_xrun(Direction::Playback);
    handle.inject_xrun(Direction::Capture);
    driver.run_periods(0, 2).unwrap();
    assert_eq!(handle.recoveries(), 2);
    driver.process_buffers();
}

#[test]
fn test_invalid_card_and_port() {
    let (mut driver, _) = driver();
    assert!(matches!(
        driver.set_passthrough_level(0, 2, 0, 0),
        Err(DriverError::InvalidPort { card: 0, port: 2 })
    ));
    assert!(matches!(
        driver.output_meters(3, 0),
        Err(DriverError::NoSuchCard(3))
    ));
}
