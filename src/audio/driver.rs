// src/audio/driver.rs
// Driver facade: card discovery, stream/port lifecycle, gains and bookkeeping

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use super::backend::{CpalBackend, MemoryBackend, MemoryCardSpec};
use super::capture::{CaptureEngine, PASSTHROUGH_FRAME_BYTES};
use super::card::{AudioCard, Stream};
use super::config::{BackendKind, DriverConfig, EngineMode};
use super::error::{DriverError, DriverResult};
use super::fade::Fade;
use super::format::PcmFormat;
use super::io::{EncoderFactory, MediaOpener, RecordRequest, WavOpener, create_sink};
use super::level::{MUTE_LEVEL, clamp_level};
use super::lockfree_buffer::ring_buffer;
use super::negotiator::{FormatRequest, negotiate};
use super::pcm::{Backend, Direction, PcmDevice};
use super::playback::PlaybackEngine;
use super::session::{PlaybackSession, RecordSession};
use super::timer::{DeadlineQueue, TimerKey};
use super::{DriverEvent, PlayState, RecordState};

/// The only playback speed this engine accepts, in the scheduler's
/// fixed-point units.
pub const NORMAL_SPEED: u32 = 100_000;

const EVENT_QUEUE_DEPTH: usize = 1024;

/// Enumeration record for one active card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub index: usize,
    pub driver: String,
    pub name: String,
    pub inputs: usize,
    pub outputs: usize,
    /// Negotiated rate shared by both directions.
    pub sample_rate: u32,
}

struct LoadedPlayback {
    session: PlaybackSession,
    /// Absolute stop time armed by `play`.
    deadline: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordPhase {
    Armed,
    WaitingForVox,
    Recording,
}

struct LoadedRecord {
    session: RecordSession,
    phase: RecordPhase,
    length_ms: u32,
}

enum Engines {
    Threaded(Vec<JoinHandle<()>>),
    Freewheel {
        capture: Option<CaptureEngine>,
        playback: Option<PlaybackEngine>,
    },
}

struct CardRuntime {
    card: Arc<AudioCard>,
    info: CardInfo,
    engines: Engines,
    playback: Vec<Option<LoadedPlayback>>,
    records: Vec<Option<LoadedRecord>>,
    fades: Vec<Option<Fade>>,
}

impl CardRuntime {
    fn check_stream(&self, stream: usize) -> DriverResult<()> {
        if stream < self.card.streams.len() {
            Ok(())
        } else {
            Err(DriverError::InvalidStream {
                card: self.info.index,
                stream,
            })
        }
    }

    fn check_input(&self, port: usize) -> DriverResult<()> {
        if self.card.capture.is_none() {
            return Err(DriverError::NoCaptureDevice(self.info.index));
        }
        if port < self.card.inputs() {
            Ok(())
        } else {
            Err(DriverError::InvalidPort {
                card: self.info.index,
                port,
            })
        }
    }

    fn check_output(&self, port: usize) -> DriverResult<()> {
        if self.card.playback.is_none() {
            return Err(DriverError::NoPlaybackDevice(self.info.index));
        }
        if port < self.card.outputs() {
            Ok(())
        } else {
            Err(DriverError::InvalidPort {
                card: self.info.index,
                port,
            })
        }
    }

    fn loaded_stream(&self, stream: usize) -> DriverResult<&Stream> {
        self.check_stream(stream)?;
        if self.playback[stream].is_none() {
            return Err(DriverError::NotLoaded {
                card: self.info.index,
                stream,
            });
        }
        Ok(&self.card.streams[stream])
    }
}

fn runtime(cards: &[CardRuntime], card: usize) -> DriverResult<&CardRuntime> {
    cards.get(card).ok_or(DriverError::NoSuchCard(card))
}

fn runtime_mut(cards: &mut [CardRuntime], card: usize) -> DriverResult<&mut CardRuntime> {
    cards.get_mut(card).ok_or(DriverError::NoSuchCard(card))
}

fn emit(events: &Sender<DriverEvent>, event: DriverEvent) {
    if let Err(TrySendError::Full(event)) = events.try_send(event) {
        debug!(?event, "event queue full, dropping");
    }
}

fn millis(ms: u32) -> Duration {
    Duration::from_millis(ms as u64)
}

pub struct DriverBuilder {
    config: DriverConfig,
    backend: Option<Box<dyn Backend>>,
    opener: Option<Arc<dyn MediaOpener>>,
    encoder: Option<Arc<dyn EncoderFactory>>,
}

impl DriverBuilder {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            backend: None,
            opener: None,
            encoder: None,
        }
    }

    /// Use this backend instead of the one named in the config.
    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Some(Box::new(backend));
        self
    }

    pub fn media_opener(mut self, opener: Arc<dyn MediaOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn encoder_factory(mut self, encoder: Arc<dyn EncoderFactory>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    pub fn build(self) -> DriverResult<Driver> {
        let backend = match self.backend {
            Some(backend) => backend,
            None => default_backend(&self.config)?,
        };
        let opener = self.opener.unwrap_or_else(|| Arc::new(WavOpener));
        Driver::initialize(self.config, backend.as_ref(), opener, self.encoder)
    }
}

fn default_backend(config: &DriverConfig) -> DriverResult<Box<dyn Backend>> {
    match config.backend {
        BackendKind::Cpal => Ok(Box::new(CpalBackend::new())),
        BackendKind::Memory => {
            let spec = MemoryCardSpec {
                paced: config.engine_mode == EngineMode::Threaded,
                ..Default::default()
            };
            Ok(Box::new(MemoryBackend::with_card(spec).0))
        }
        BackendKind::Alsa => alsa_backend(config),
    }
}

#[cfg(all(feature = "alsa", target_os = "linux"))]
fn alsa_backend(config: &DriverConfig) -> DriverResult<Box<dyn Backend>> {
    Ok(Box::new(super::backend::AlsaBackend::new(config.clone())))
}

#[cfg(not(all(feature = "alsa", target_os = "linux")))]
fn alsa_backend(_config: &DriverConfig) -> DriverResult<Box<dyn Backend>> {
    Err(DriverError::BackendUnavailable("alsa"))
}

type Negotiated = (Box<dyn PcmDevice>, PcmFormat);

fn negotiate_direction(
    mut pcm: Box<dyn PcmDevice>,
    request: &FormatRequest,
    device: usize,
) -> Option<Negotiated> {
    match negotiate(pcm.as_mut(), request) {
        Ok(format) => Some((pcm, format)),
        Err(err) => {
            warn!(device, direction = ?pcm.direction(), %err, "device rejected");
            None
        }
    }
}

fn spawn_engine(
    name: String,
    body: impl FnOnce() + Send + 'static,
) -> DriverResult<JoinHandle<()>> {
    thread::Builder::new()
        .name(name)
        .spawn(body)
        .map_err(DriverError::Spawn)
}

fn start_card(
    index: usize,
    name: String,
    capture: Option<Negotiated>,
    playback: Option<Negotiated>,
    config: &DriverConfig,
    driver: &str,
) -> DriverResult<CardRuntime> {
    let card = Arc::new(AudioCard::new(
        index,
        name,
        capture.as_ref().map(|(_, f)| *f),
        playback.as_ref().map(|(_, f)| *f),
        config,
    ));

    let mut writers = Vec::new();
    let mut readers = Vec::new();
    if let (Some((_, input)), Some((_, output))) = (&capture, &playback) {
        let capacity = PASSTHROUGH_FRAME_BYTES * input.buffer_frames.max(output.buffer_frames);
        for _ in 0..card.inputs() {
            let (writer, reader) = ring_buffer(capacity);
            writers.push(writer);
            readers.push(reader);
        }
    }

    let capture = capture.map(|(pcm, format)| {
        CaptureEngine::new(Arc::clone(&card), pcm, format, writers)
    });
    let playback = playback.map(|(pcm, format)| {
        PlaybackEngine::new(Arc::clone(&card), pcm, format, readers)
    });

    let engines = match config.engine_mode {
        EngineMode::Freewheel => Engines::Freewheel { capture, playback },
        EngineMode::Threaded => {
            let mut threads = Vec::new();
            let mut spawned = Ok(());
            if let Some(engine) = capture {
                match spawn_engine(format!("cae-capture-{index}"), move || engine.run()) {
                    Ok(handle) => threads.push(handle),
                    Err(err) => spawned = Err(err),
                }
            }
            let playback = playback.filter(|_| spawned.is_ok());
            if let Some(engine) = playback {
                match spawn_engine(format!("cae-playback-{index}"), move || engine.run()) {
                    Ok(handle) => threads.push(handle),
                    Err(err) => spawned = Err(err),
                }
            }
            if let Err(err) = spawned {
                card.exiting.store(true, Ordering::Release);
                for handle in threads {
                    let _ = handle.join();
                }
                return Err(err);
            }
            Engines::Threaded(threads)
        }
    };

    let info = CardInfo {
        index,
        driver: driver.to_string(),
        name: card.name.clone(),
        inputs: card.inputs(),
        outputs: card.outputs(),
        sample_rate: card
            .playback
            .or(card.capture)
            .map_or(0, |format| format.sample_rate),
    };
    info!(
        card = index,
        name = %info.name,
        inputs = info.inputs,
        outputs = info.outputs,
        "card added"
    );

    Ok(CardRuntime {
        playback: (0..config.max_streams).map(|_| None).collect(),
        records: (0..config.max_ports).map(|_| None).collect(),
        fades: vec![None; config.max_streams],
        card,
        info,
        engines,
    })
}

/// Owns every active card and exposes the scheduler-facing operations.
///
/// Control operations and [`process_buffers`](Self::process_buffers) are
/// called from one non-real-time thread; the engines run on their own
/// threads (or are stepped with [`run_periods`](Self::run_periods) in
/// freewheel mode).
pub struct Driver {
    config: DriverConfig,
    cards: Vec<CardRuntime>,
    timers: DeadlineQueue<TimerKey>,
    events_tx: Sender<DriverEvent>,
    events_rx: Receiver<DriverEvent>,
    opener: Arc<dyn MediaOpener>,
    encoder: Option<Arc<dyn EncoderFactory>>,
}

impl Driver {
    pub fn builder(config: DriverConfig) -> DriverBuilder {
        DriverBuilder::new(config)
    }

    fn initialize(
        config: DriverConfig,
        backend: &dyn Backend,
        opener: Arc<dyn MediaOpener>,
        encoder: Option<Arc<dyn EncoderFactory>>,
    ) -> DriverResult<Self> {
        config.validate()?;

        let mut cards = Vec::new();
        for device in 0..config.max_cards {
            let playback_pcm = backend.open(device, Direction::Playback);
            let capture_pcm = backend.open(device, Direction::Capture);
            if playback_pcm.is_none() && capture_pcm.is_none() {
                break;
            }
            let name = backend
                .card_name(device)
                .unwrap_or_else(|| format!("card {device}"));

            let request = FormatRequest::from_config(&config, config.sample_rate);
            let playback = playback_pcm.and_then(|pcm| negotiate_direction(pcm, &request, device));

            // Capture follows the playback rate so passthrough needs no conversion.
            let capture_rate = playback
                .as_ref()
                .map_or(config.sample_rate, |(_, f)| f.sample_rate);
            let request = FormatRequest::from_config(&config, capture_rate);
            let capture = capture_pcm.and_then(|pcm| negotiate_direction(pcm, &request, device));

            if playback.is_none() && capture.is_none() {
                warn!(device, %name, "no usable direction, card skipped");
                continue;
            }
            let index = cards.len();
            cards.push(start_card(
                index,
                name,
                capture,
                playback,
                &config,
                backend.label(),
            )?);
        }
        info!(cards = cards.len(), backend = backend.label(), "driver initialized");

        let (events_tx, events_rx) = channel::bounded(EVENT_QUEUE_DEPTH);
        Ok(Self {
            config,
            cards,
            timers: DeadlineQueue::new(),
            events_tx,
            events_rx,
            opener,
            encoder,
        })
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn cards(&self) -> impl Iterator<Item = &CardInfo> {
        self.cards.iter().map(|rt| &rt.info)
    }

    pub fn card_info(&self, card: usize) -> Option<&CardInfo> {
        self.cards.get(card).map(|rt| &rt.info)
    }

    /// Receiver for play/record state changes.
    pub fn events(&self) -> Receiver<DriverEvent> {
        self.events_rx.clone()
    }

    // ---- playback -------------------------------------------------------

    /// Load a media file into the first free stream and prime its ring.
    pub fn load_playback(&mut self, card: usize, path: impl AsRef<Path>) -> DriverResult<usize> {
        let path = path.as_ref();
        let ring_size = self.config.ring_buffer_size;
        let rt = runtime_mut(&mut self.cards, card)?;
        let format = rt.card.playback.ok_or(DriverError::NoPlaybackDevice(card))?;
        let slot = rt
            .playback
            .iter()
            .position(Option::is_none)
            .ok_or(DriverError::NoFreeStream(card))?;

        let source = self.opener.open(path)?;
        let channels = source.channels();
        if !(1..=2).contains(&channels) {
            return Err(DriverError::UnsupportedChannels(channels));
        }

        let (writer, reader) = ring_buffer(ring_size);
        let mut session = PlaybackSession::new(source, writer, format.sample_rate)?;
        let stream = &rt.card.streams[slot];
        stream.reset(channels as u8);
        stream.play_ring.install(reader);
        match session.fill() {
            Ok(done) => stream.eof.store(done, Ordering::Release),
            Err(err) => {
                stream.play_ring.take();
                return Err(err.into());
            }
        }
        if session.is_resampling() {
            debug!(
                card,
                stream = slot,
                from = session.source_rate(),
                to = session.device_rate(),
                "resampling playback"
            );
        }

        rt.playback[slot] = Some(LoadedPlayback {
            session,
            deadline: None,
        });
        info!(card, stream = slot, path = %path.display(), "playback loaded");
        Ok(slot)
    }

    /// Release a loaded stream, stopping it first if it is playing.
    pub fn unload_playback(&mut self, card: usize, stream: usize) -> DriverResult<()> {
        let was_playing = runtime(&self.cards, card)?
            .loaded_stream(stream)?
            .is_playing();
        self.release_stream(card, stream);
        if was_playing {
            emit(
                &self.events_tx,
                DriverEvent::Play {
                    card,
                    stream,
                    state: PlayState::Stopped,
                },
            );
        }
        info!(card, stream, "playback unloaded");
        Ok(())
    }

    pub fn play(
        &mut self,
        card: usize,
        stream: usize,
        length_ms: u32,
        speed: u32,
        preserve_pitch: bool,
    ) -> DriverResult<()> {
        if speed != NORMAL_SPEED {
            return Err(DriverError::UnsupportedSpeed(speed));
        }
        let rt = runtime_mut(&mut self.cards, card)?;
        let s = rt.loaded_stream(stream)?;
        if s.is_playing() {
            return Err(DriverError::AlreadyPlaying { card, stream });
        }
        if preserve_pitch {
            debug!(card, stream, "pitch preservation has no effect at normal speed");
        }
        s.playing.store(true, Ordering::Release);
        let deadline = (length_ms > 0).then(|| Instant::now() + millis(length_ms));
        if let Some(loaded) = rt.playback[stream].as_mut() {
            loaded.deadline = deadline;
        }
        if let Some(deadline) = deadline {
            self.timers
                .schedule(TimerKey::StopPlayback { card, stream }, deadline);
        }
        emit(
            &self.events_tx,
            DriverEvent::Play {
                card,
                stream,
                state: PlayState::Playing,
            },
        );
        debug!(card, stream, length_ms, "playback started");
        Ok(())
    }

    /// Stop a loaded stream and free its slot.
    pub fn stop_playback(&mut self, card: usize, stream: usize) -> DriverResult<()> {
        let was_playing = runtime(&self.cards, card)?
            .loaded_stream(stream)?
            .is_playing();
        self.release_stream(card, stream);
        if was_playing {
            emit(
                &self.events_tx,
                DriverEvent::Play {
                    card,
                    stream,
                    state: PlayState::Stopped,
                },
            );
        }
        info!(card, stream, "playback stopped");
        Ok(())
    }

    /// Seek a loaded stream to `position_ms` and re-prime its ring.
    pub fn playback_position(
        &mut self,
        card: usize,
        stream: usize,
        position_ms: u32,
    ) -> DriverResult<()> {
        let rt = runtime_mut(&mut self.cards, card)?;
        rt.loaded_stream(stream)?;
        let s = &rt.card.streams[stream];
        let Some(loaded) = rt.playback[stream].as_mut() else {
            return Err(DriverError::NotLoaded { card, stream });
        };
        let length_ms = loaded.session.length_ms();
        if position_ms as u64 > length_ms {
            return Err(DriverError::SeekOutOfRange {
                position_ms,
                length_ms: length_ms.min(u32::MAX as u64) as u32,
            });
        }

        s.eof.store(false, Ordering::Release);
        s.play_ring.with(|ring| {
            ring.reset();
            s.output_pos.store(0, Ordering::Release);
        });
        loaded.session.seek(position_ms as u64)?;
        let done = loaded.session.fill()?;
        s.eof.store(done, Ordering::Release);

        // A seek never extends the stop time armed by `play`.
        let deadline = loaded.deadline.filter(|_| s.is_playing());
        if let Some(deadline) = deadline {
            self.timers
                .schedule(TimerKey::StopPlayback { card, stream }, deadline);
        }
        debug!(card, stream, position_ms, "playback position set");
        Ok(())
    }

    fn release_stream(&mut self, card: usize, stream: usize) -> bool {
        self.timers.cancel(TimerKey::StopPlayback { card, stream });
        self.timers.cancel(TimerKey::FadeTick { card, stream });
        let Some(rt) = self.cards.get_mut(card) else {
            return false;
        };
        let Some(s) = rt.card.streams.get(stream) else {
            return false;
        };
        s.playing.store(false, Ordering::Release);
        s.play_ring.take();
        s.stopping.store(false, Ordering::Release);
        s.eof.store(false, Ordering::Release);
        for meter in &s.meters {
            meter.reset();
        }
        rt.fades[stream] = None;
        rt.playback[stream].take().is_some()
    }

    // ---- recording ------------------------------------------------------

    /// Arm `port` for recording into `path`.
    pub fn load_record(
        &mut self,
        card: usize,
        port: usize,
        request: RecordRequest,
        path: impl AsRef<Path>,
    ) -> DriverResult<()> {
        let ring_size = self.config.ring_buffer_size;
        let rt = runtime_mut(&mut self.cards, card)?;
        rt.check_input(port)?;
        let format = rt.card.capture.ok_or(DriverError::NoCaptureDevice(card))?;
        if rt.records[port].is_some() {
            return Err(DriverError::RecordBusy { card, port });
        }
        if request.sample_rate != format.sample_rate {
            return Err(DriverError::SampleRateMismatch {
                requested: request.sample_rate,
                device: format.sample_rate,
            });
        }

        let sink = create_sink(path.as_ref(), &request, self.encoder.as_deref())?;
        let (writer, reader) = ring_buffer(ring_size);
        let p = &rt.card.ports[port];
        p.recording.store(false, Ordering::Release);
        p.record_channels
            .store(request.channels as u8, Ordering::Release);
        p.vox_triggered.store(true, Ordering::Release);
        p.record_ring.install(writer);
        p.ready.store(true, Ordering::Release);

        rt.records[port] = Some(LoadedRecord {
            session: RecordSession::new(sink, reader, request.channels as usize),
            phase: RecordPhase::Armed,
            length_ms: 0,
        });
        info!(
            card,
            port,
            coding = ?request.coding,
            channels = request.channels,
            path = %path.as_ref().display(),
            "record loaded"
        );
        Ok(())
    }

    /// Start an armed recording. A `threshold` above the mute floor holds
    /// the recording until the input reaches that level.
    pub fn record(
        &mut self,
        card: usize,
        port: usize,
        length_ms: u32,
        threshold: i32,
    ) -> DriverResult<()> {
        let rt = runtime_mut(&mut self.cards, card)?;
        rt.check_input(port)?;
        let armed = rt.card.ports[port].is_ready();
        let Some(loaded) = rt.records[port].as_mut().filter(|_| armed) else {
            return Err(DriverError::NotArmed { card, port });
        };
        if loaded.phase != RecordPhase::Armed {
            return Err(DriverError::RecordBusy { card, port });
        }

        let vox = threshold > MUTE_LEVEL;
        let p = &rt.card.ports[port];
        p.vox_threshold.set_level(threshold);
        p.vox_triggered.store(!vox, Ordering::Release);
        p.recording.store(true, Ordering::Release);
        loaded.length_ms = length_ms;
        loaded.phase = RecordPhase::WaitingForVox;

        if vox {
            debug!(card, port, threshold, "waiting for vox trigger");
        } else {
            self.begin_recording(card, port, Instant::now());
        }
        Ok(())
    }

    fn begin_recording(&mut self, card: usize, port: usize, now: Instant) {
        let Some(loaded) = self
            .cards
            .get_mut(card)
            .and_then(|rt| rt.records.get_mut(port))
            .and_then(Option::as_mut)
        else {
            return;
        };
        loaded.phase = RecordPhase::Recording;
        let length_ms = loaded.length_ms;
        if length_ms > 0 {
            self.timers
                .schedule(TimerKey::StopRecord { card, port }, now + millis(length_ms));
        }
        emit(
            &self.events_tx,
            DriverEvent::Record {
                card,
                port,
                state: RecordState::Recording,
            },
        );
        info!(card, port, length_ms, "recording started");
    }

    /// Stop recording on `port`, close the target and return the number of
    /// frames written.
    pub fn stop_record(&mut self, card: usize, port: usize) -> DriverResult<u64> {
        self.finish_record(card, port)
    }

    /// Release an armed port. Equivalent to [`stop_record`](Self::stop_record)
    /// when the port is recording.
    pub fn unload_record(&mut self, card: usize, port: usize) -> DriverResult<u64> {
        self.finish_record(card, port)
    }

    fn finish_record(&mut self, card: usize, port: usize) -> DriverResult<u64> {
        let rt = runtime_mut(&mut self.cards, card)?;
        rt.check_input(port)?;
        let Some(loaded) = rt.records[port].take() else {
            return Err(DriverError::NotArmed { card, port });
        };
        let p = &rt.card.ports[port];
        p.recording.store(false, Ordering::Release);
        p.ready.store(false, Ordering::Release);
        p.record_ring.take();

        self.timers.cancel(TimerKey::StopRecord { card, port });
        if loaded.phase != RecordPhase::Armed {
            emit(
                &self.events_tx,
                DriverEvent::Record {
                    card,
                    port,
                    state: RecordState::Stopped,
                },
            );
        }
        let frames = loaded.session.finish()?;
        info!(card, port, frames, "recording closed");
        Ok(frames)
    }

    // ---- gain -----------------------------------------------------------

    pub fn set_input_volume(&mut self, card: usize, port: usize, level: i32) -> DriverResult<()> {
        let rt = runtime(&self.cards, card)?;
        rt.check_input(port)?;
        if rt.card.ports[port].input_gain.set_level(level) {
            debug!(card, port, level, "input volume");
        }
        Ok(())
    }

    /// Set the gain from `stream` to output `port` immediately, cancelling a
    /// fade on the same route.
    pub fn set_output_volume(
        &mut self,
        card: usize,
        stream: usize,
        port: usize,
        level: i32,
    ) -> DriverResult<()> {
        let rt = runtime_mut(&mut self.cards, card)?;
        rt.check_stream(stream)?;
        rt.check_output(port)?;
        if rt.fades[stream].is_some_and(|fade| fade.port == port) {
            rt.fades[stream] = None;
            self.timers.cancel(TimerKey::FadeTick { card, stream });
        }
        let rt = &self.cards[card];
        if rt.card.streams[stream].gains[port].set_level(level) {
            debug!(card, stream, port, level, "output volume");
        }
        Ok(())
    }

    /// Move the gain from `stream` to `port` linearly to `level` over
    /// `length_ms`, replacing any fade already running on the stream.
    pub fn fade_output_volume(
        &mut self,
        card: usize,
        stream: usize,
        port: usize,
        level: i32,
        length_ms: u32,
    ) -> DriverResult<()> {
        let interval = self.config.fade_interval_ms;
        let rt = runtime_mut(&mut self.cards, card)?;
        rt.check_stream(stream)?;
        rt.check_output(port)?;

        let gain = &rt.card.streams[stream].gains[port];
        let target = clamp_level(level);
        let fade = Fade::new(gain.level(), target, length_ms, interval, port);
        rt.fades[stream] = fade;
        match fade {
            None => {
                gain.set_level(target);
                self.timers.cancel(TimerKey::FadeTick { card, stream });
            }
            Some(fade) => {
                debug!(card, stream, port, target, increment = fade.increment, "fade started");
                self.timers.schedule(
                    TimerKey::FadeTick { card, stream },
                    Instant::now() + millis(interval),
                );
            }
        }
        Ok(())
    }

    fn fade_tick(&mut self, card: usize, stream: usize, deadline: Instant) {
        let Some(rt) = self.cards.get_mut(card) else {
            return;
        };
        let Some(fade) = rt.fades.get(stream).copied().flatten() else {
            return;
        };
        let gain = &rt.card.streams[stream].gains[fade.port];
        let (next, done) = fade.step(gain.level());
        gain.set_level(next);
        if done {
            rt.fades[stream] = None;
            debug!(card, stream, level = next, "fade complete");
        } else {
            self.timers.schedule(
                TimerKey::FadeTick { card, stream },
                deadline + millis(self.config.fade_interval_ms),
            );
        }
    }

    pub fn set_passthrough_level(
        &mut self,
        card: usize,
        input: usize,
        output: usize,
        level: i32,
    ) -> DriverResult<()> {
        let rt = runtime(&self.cards, card)?;
        rt.check_input(input)?;
        rt.check_output(output)?;
        let route = rt
            .card
            .passthrough
            .route(input, output)
            .ok_or(DriverError::InvalidPort { card, port: output })?;
        if route.set_level(level) {
            debug!(card, input, output, level, "passthrough level");
        }
        Ok(())
    }

    pub fn input_volume(&self, card: usize, port: usize) -> DriverResult<i32> {
        let rt = runtime(&self.cards, card)?;
        rt.check_input(port)?;
        Ok(rt.card.ports[port].input_gain.level())
    }

    pub fn output_volume(&self, card: usize, stream: usize, port: usize) -> DriverResult<i32> {
        let rt = runtime(&self.cards, card)?;
        rt.check_stream(stream)?;
        rt.check_output(port)?;
        Ok(rt.card.streams[stream].gains[port].level())
    }

    pub fn is_fading(&self, card: usize, stream: usize) -> bool {
        self.timers.is_pending(TimerKey::FadeTick { card, stream })
    }

    // ---- meters and positions -------------------------------------------

    pub fn input_meters(&self, card: usize, port: usize) -> DriverResult<[i32; 2]> {
        let rt = runtime(&self.cards, card)?;
        rt.check_input(port)?;
        let meters = &rt.card.ports[port].input_meters;
        Ok([meters[0].level(), meters[1].level()])
    }

    pub fn output_meters(&self, card: usize, port: usize) -> DriverResult<[i32; 2]> {
        let rt = runtime(&self.cards, card)?;
        rt.check_output(port)?;
        let meters = &rt.card.ports[port].output_meters;
        Ok([meters[0].level(), meters[1].level()])
    }

    pub fn stream_output_meters(&self, card: usize, stream: usize) -> DriverResult<[i32; 2]> {
        let rt = runtime(&self.cards, card)?;
        rt.check_stream(stream)?;
        let meters = &rt.card.streams[stream].meters;
        Ok([meters[0].level(), meters[1].level()])
    }

    /// Play position of every stream in milliseconds, `0` for free slots.
    pub fn output_positions(&self, card: usize) -> DriverResult<Vec<u32>> {
        let rt = runtime(&self.cards, card)?;
        Ok(rt
            .playback
            .iter()
            .zip(rt.card.streams.iter())
            .map(|(loaded, stream)| match loaded {
                Some(loaded) => {
                    let rate = loaded.session.device_rate().max(1) as u64;
                    let played = stream.output_pos.load(Ordering::Acquire) * 1000 / rate;
                    (loaded.session.offset_ms() + played).min(u32::MAX as u64) as u32
                }
                None => 0,
            })
            .collect())
    }

    // ---- bookkeeping ----------------------------------------------------

    /// Periodic non-real-time work; call at a fixed interval.
    pub fn process_buffers(&mut self) {
        self.process_buffers_at(Instant::now());
    }

    /// [`process_buffers`](Self::process_buffers) against an explicit clock.
    pub fn process_buffers_at(&mut self, now: Instant) {
        for card in 0..self.cards.len() {
            self.reap_streams(card);
            self.fill_streams(card);
            self.service_records(card, now);
            self.report_faults(card);
        }
        self.run_timers(now);
    }

    fn reap_streams(&mut self, card: usize) {
        let stopping: Vec<usize> = self.cards[card]
            .card
            .streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.stopping.load(Ordering::Acquire))
            .map(|(index, _)| index)
            .collect();
        for stream in stopping {
            self.release_stream(card, stream);
            emit(
                &self.events_tx,
                DriverEvent::Play {
                    card,
                    stream,
                    state: PlayState::Stopped,
                },
            );
            info!(card, stream, "playback finished");
        }
    }

    fn fill_streams(&mut self, card: usize) {
        let rt = &mut self.cards[card];
        for (index, loaded) in rt.playback.iter_mut().enumerate() {
            let Some(loaded) = loaded else {
                continue;
            };
            let stream = &rt.card.streams[index];
            if stream.eof.load(Ordering::Acquire) {
                continue;
            }
            match loaded.session.fill() {
                Ok(done) => stream.eof.store(done, Ordering::Release),
                Err(err) => {
                    warn!(card, stream = index, %err, "playback read failed, ending stream");
                    stream.eof.store(true, Ordering::Release);
                }
            }
        }
    }

    fn service_records(&mut self, card: usize, now: Instant) {
        let mut triggered = Vec::new();
        let rt = &mut self.cards[card];
        for (port, loaded) in rt.records.iter_mut().enumerate() {
            let Some(loaded) = loaded else {
                continue;
            };
            if loaded.phase == RecordPhase::WaitingForVox
                && rt.card.ports[port].vox_triggered.load(Ordering::Acquire)
            {
                triggered.push(port);
            }
            if let Err(err) = loaded.session.drain() {
                warn!(card, port, %err, "record write failed");
            }
        }
        for port in triggered {
            self.begin_recording(card, port, now);
        }
    }

    fn report_faults(&self, card: usize) {
        let audio = &self.cards[card].card;
        for (index, port) in audio.ports.iter().enumerate() {
            let overruns = port.record_overruns.swap(0, Ordering::AcqRel);
            if overruns > 0 {
                warn!(card, port = index, periods = overruns, "record ring overrun");
            }
            let overruns = port.passthrough_overruns.swap(0, Ordering::AcqRel);
            if overruns > 0 {
                warn!(card, port = index, periods = overruns, "passthrough ring overrun");
            }
        }
        let xruns = audio.capture_xruns.swap(0, Ordering::AcqRel);
        if xruns > 0 {
            debug!(card, xruns, "capture xruns recovered");
        }
        let xruns = audio.playback_xruns.swap(0, Ordering::AcqRel);
        if xruns > 0 {
            debug!(card, xruns, "playback xruns recovered");
        }
    }

    fn run_timers(&mut self, now: Instant) {
        while let Some((key, deadline)) = self.timers.pop_due(now) {
            match key {
                TimerKey::StopPlayback { card, stream } => {
                    if let Err(err) = self.stop_playback(card, stream) {
                        debug!(card, stream, %err, "stop deadline on idle stream");
                    }
                }
                TimerKey::StopRecord { card, port } => {
                    if let Err(err) = self.stop_record(card, port) {
                        warn!(card, port, %err, "record length deadline failed");
                    }
                }
                TimerKey::FadeTick { card, stream } => self.fade_tick(card, stream, deadline),
            }
        }
    }

    // ---- engines --------------------------------------------------------

    /// Run `periods` capture and playback periods synchronously. Only valid
    /// in [`EngineMode::Freewheel`].
    pub fn run_periods(&mut self, card: usize, periods: usize) -> DriverResult<()> {
        let rt = runtime_mut(&mut self.cards, card)?;
        let Engines::Freewheel { capture, playback } = &mut rt.engines else {
            return Err(DriverError::NotFreewheel(card));
        };
        for _ in 0..periods {
            if let Some(engine) = capture.as_mut() {
                engine.run_period();
            }
            if let Some(engine) = playback.as_mut() {
                engine.run_period();
            }
        }
        Ok(())
    }

    /// Stop every engine thread and close open recordings.
    pub fn shutdown(&mut self) {
        for rt in &mut self.cards {
            rt.card.exiting.store(true, Ordering::Release);
            if let Engines::Threaded(threads) = &mut rt.engines {
                for handle in threads.drain(..) {
                    if handle.join().is_err() {
                        warn!(card = rt.info.index, "engine thread panicked");
                    }
                }
            }
        }
        for card in 0..self.cards.len() {
            for port in 0..self.cards[card].records.len() {
                if self.cards[card].records[port].is_none() {
                    continue;
                }
                if let Err(err) = self.finish_record(card, port) {
                    warn!(card, port, %err, "closing recording at shutdown");
                }
            }
            for stream in 0..self.cards[card].playback.len() {
                self.release_stream(card, stream);
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::format::SampleFormat;

    fn freewheel() -> DriverConfig {
        DriverConfig {
            engine_mode: EngineMode::Freewheel,
            ..Default::default()
        }
    }

    #[test]
    fn test_cards_are_numbered_over_usable_devices() {
        let mut backend = MemoryBackend::new();
        backend.add_card(MemoryCardSpec {
            name: "first".into(),
            ..Default::default()
        });
        backend.add_card(MemoryCardSpec {
            name: "broken".into(),
            formats: vec![],
            ..Default::default()
        });
        backend.add_card(MemoryCardSpec {
            name: "playback only".into(),
            capture: false,
            formats: vec![SampleFormat::S16Le],
            max_channels: 4,
            ..Default::default()
        });

        let driver = Driver::builder(freewheel()).backend(backend).build().unwrap();
        let cards: Vec<_> = driver.cards().cloned().collect();
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].name, "first");
        assert_eq!((cards[0].inputs, cards[0].outputs), (8, 8));
        assert_eq!(cards[1].index, 1);
        assert_eq!(cards[1].name, "playback only");
        assert_eq!((cards[1].inputs, cards[1].outputs), (0, 2));
        assert_eq!(cards[1].driver, "memory");
    }

    #[test]
    fn test_capture_follows_playback_rate() {
        let (backend, _) = MemoryBackend::with_card(MemoryCardSpec {
            rates: vec![48000],
            ..Default::default()
        });
        let config = DriverConfig {
            sample_rate: 48050,
            ..freewheel()
        };
        let driver = Driver::builder(config).backend(backend).build().unwrap();
        let rt = &driver.cards[0];
        assert_eq!(rt.card.capture.unwrap().sample_rate, 48000);
        assert_eq!(rt.card.playback.unwrap().sample_rate, 48000);
    }

    #[test]
    fn test_load_record_readies_port() {
        let (backend, _) = MemoryBackend::with_card(MemoryCardSpec::default());
        let mut driver = Driver::builder(freewheel()).backend(backend).build().unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let rate = driver.cards[0].card.capture.unwrap().sample_rate;

        assert!(!driver.cards[0].card.ports[1].is_ready());
        driver
            .load_record(0, 1, RecordRequest::pcm16(2, rate), dir.path().join("a.wav"))
            .unwrap();
        assert!(driver.cards[0].card.ports[1].is_ready());

        driver.unload_record(0, 1).unwrap();
        assert!(!driver.cards[0].card.ports[1].is_ready());
        assert!(matches!(
            driver.record(0, 1, 0, MUTE_LEVEL),
            Err(DriverError::NotArmed { card: 0, port: 1 })
        ));
    }

    #[test]
    fn test_fade_ticks_to_target() {
        let (backend, _) = MemoryBackend::with_card(MemoryCardSpec::default());
        let mut driver = Driver::builder(freewheel()).backend(backend).build().unwrap();

        let start = Instant::now();
        driver.fade_output_volume(0, 3, 1, -1000, 100).unwrap();
        assert!(driver.is_fading(0, 3));

        driver.process_buffers_at(start + Duration::from_secs(5));
        assert_eq!(driver.output_volume(0, 3, 1).unwrap(), -1000);
        assert!(!driver.is_fading(0, 3));
    }

    #[test]
    fn test_new_fade_supersedes_old() {
        let (backend, _) = MemoryBackend::with_card(MemoryCardSpec::default());
        let mut driver = Driver::builder(freewheel()).backend(backend).build().unwrap();

        driver.fade_output_volume(0, 0, 0, -4000, 1000).unwrap();
        driver.fade_output_volume(0, 0, 1, -2000, 1000).unwrap();
        driver.process_buffers_at(Instant::now() + Duration::from_secs(5));

        assert_eq!(driver.output_volume(0, 0, 0).unwrap(), 0);
        assert_eq!(driver.output_volume(0, 0, 1).unwrap(), -2000);
    }

    #[test]
    fn test_zero_length_fade_is_immediate() {
        let (backend, _) = MemoryBackend::with_card(MemoryCardSpec::default());
        let mut driver = Driver::builder(freewheel()).backend(backend).build().unwrap();
        driver.fade_output_volume(0, 0, 0, -600, 0).unwrap();
        assert_eq!(driver.output_volume(0, 0, 0).unwrap(), -600);
        assert!(!driver.is_fading(0, 0));
    }

    #[test]
    fn test_set_volume_cancels_fade_on_same_port() {
        let (backend, _) = MemoryBackend::with_card(MemoryCardSpec::default());
        let mut driver = Driver::builder(freewheel()).backend(backend).build().unwrap();
        driver.fade_output_volume(0, 0, 0, -4000, 1000).unwrap();
        driver.set_output_volume(0, 0, 0, -300).unwrap();
        assert!(!driver.is_fading(0, 0));
        driver.process_buffers_at(Instant::now() + Duration::from_secs(5));
        assert_eq!(driver.output_volume(0, 0, 0).unwrap(), -300);
    }

    #[test]
    fn test_invalid_indices() {
        let (backend, _) = MemoryBackend::with_card(MemoryCardSpec::default());
        let mut driver = Driver::builder(freewheel()).backend(backend).build().unwrap();
        assert!(matches!(
            driver.set_input_volume(1, 0, 0),
            Err(DriverError::NoSuchCard(1))
        ));
        assert!(matches!(
            driver.set_input_volume(0, 8, 0),
            Err(DriverError::InvalidPort { card: 0, port: 8 })
        ));
        assert!(matches!(
            driver.stream_output_meters(0, 32),
            Err(DriverError::InvalidStream { card: 0, stream: 32 })
        ));
        assert!(matches!(
            driver.play(0, 0, 0, NORMAL_SPEED, false),
            Err(DriverError::NotLoaded { card: 0, stream: 0 })
        ));
        assert!(matches!(
            driver.play(0, 0, 0, 50_000, false),
            Err(DriverError::UnsupportedSpeed(50_000))
        ));
    }

    #[test]
    fn test_run_periods_requires_freewheel() {
        let (backend, _) = MemoryBackend::with_card(MemoryCardSpec {
            paced: true,
            ..Default::default()
        });
        let mut driver = Driver::builder(DriverConfig::default())
            .backend(backend)
            .build()
            .unwrap();
        assert!(matches!(
            driver.run_periods(0, 1),
            Err(DriverError::NotFreewheel(0))
        ));
        driver.shutdown();
    }
}
