//! Concurrent audio analysis pipeline.
//!
//! One input thread reads buffers from the [`AudioSource`], appends them to
//! the rolling [`RecentSignal`] and fans them out over bounded queues. The
//! loudness, tempo, beat-phase and spectral threads each own a disjoint part
//! of the shared [`AudioState`].

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use tracing::{debug, info, trace, warn};

use crate::{
    analysis::{
        publish_bpm, AudioState, BeatConfirmer, BeatTracker, LoudnessEstimator,
        SpectralDecomposer, TempoEstimator,
    },
    audio::AudioSource,
    config::AppConfig,
    timeline::{Latch, PlaybackClock, Shutdown, ShutdownTrigger},
    Result, StageError,
};

/// Receives every beat pulse from the beat-phase thread.
///
/// Called synchronously right after `beat_on_off` goes high, so
/// implementations must return quickly.
pub trait BeatListener: Send + Sync {
    fn on_beat(&self, beat_time: f64, confirmed: bool);
}

/// Rolling window of the most recent mono samples.
#[derive(Debug, Clone)]
pub struct RecentSignal {
    samples: VecDeque<i16>,
    capacity: usize,
}

impl RecentSignal {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends samples, evicting the oldest once the capacity is reached.
    pub fn push(&mut self, block: &[i16]) {
        let keep = block.len().min(self.capacity);
        self.samples.extend(&block[block.len() - keep..]);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// Copies out the newest `count` samples, or everything if fewer are held.
    pub fn tail(&self, count: usize) -> Vec<i16> {
        let skip = self.samples.len().saturating_sub(count);
        self.samples.iter().skip(skip).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

type Worker = (&'static str, JoinHandle<Result<()>>);

/// Owns the analysis threads and the state they publish.
pub struct AudioPipeline {
    config: AppConfig,
    sample_rate: u32,
    source: Arc<Mutex<Option<Box<dyn AudioSource>>>>,
    state: Arc<Mutex<AudioState>>,
    recent: Arc<Mutex<RecentSignal>>,
    listener: Option<Arc<dyn BeatListener>>,
    shutdown: ShutdownTrigger,
    tempo_ready: Arc<Latch>,
    finished: Arc<AtomicBool>,
    clock: Option<PlaybackClock>,
    workers: Vec<Worker>,
}

impl AudioPipeline {
    pub fn new(source: Box<dyn AudioSource>, config: AppConfig) -> Self {
        let sample_rate = source.sample_rate();
        let capacity =
            (config.audio.history_secs.max(0.0) * sample_rate as f32).round() as usize;

        Self {
            config,
            sample_rate,
            source: Arc::new(Mutex::new(Some(source))),
            state: Arc::new(Mutex::new(AudioState::default())),
            recent: Arc::new(Mutex::new(RecentSignal::new(capacity))),
            listener: None,
            shutdown: ShutdownTrigger::new(),
            tempo_ready: Arc::new(Latch::new()),
            finished: Arc::new(AtomicBool::new(false)),
            clock: None,
            workers: Vec::new(),
        }
    }

    /// Registers a callback for beat pulses. Must be called before [`start`].
    ///
    /// [`start`]: AudioPipeline::start
    pub fn with_beat_listener(mut self, listener: Arc<dyn BeatListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Spawns every analysis thread. A pipeline runs at most once.
    pub fn start(&mut self) -> Result<()> {
        if self.clock.is_some() {
            return Err(StageError::InvalidInput("pipeline already started"));
        }

        // Build the analysers first so bad settings fail before any thread runs.
        let loudness = LoudnessEstimator::new(self.sample_rate);
        let tempo = TempoEstimator::new(self.config.tempo.clone(), self.sample_rate)?;
        let confirmer = BeatConfirmer::new(self.config.beat.clone(), self.sample_rate)?;
        let spectral = SpectralDecomposer::new(self.config.spectral.clone(), self.sample_rate)?;

        let history = lock(&self.recent, "recent signal")?.capacity();
        if tempo.window_len() > history {
            return Err(StageError::InvalidInput(
                "tempo window is longer than the signal history",
            ));
        }
        if spectral.window_len() > history {
            return Err(StageError::InvalidInput(
                "spectral period is longer than the signal history",
            ));
        }

        let clock = PlaybackClock::start();
        self.clock = Some(clock);

        let queue = self.config.audio.queue_capacity.max(1);
        let (loudness_tx, loudness_rx) = bounded(queue);
        let (beat_tx, beat_rx) = bounded(queue);

        let input = InputTask {
            source: self.source.clone(),
            recent: self.recent.clone(),
            finished: self.finished.clone(),
            consumers: vec![("loudness", loudness_tx), ("beat", beat_tx)],
            shutdown: self.shutdown.token(),
        };
        self.spawn("input", move || input.run())?;

        let task = LoudnessTask {
            estimator: loudness,
            queue: loudness_rx,
            state: self.state.clone(),
            shutdown: self.shutdown.token(),
        };
        self.spawn("loudness", move || task.run())?;

        let task = TempoTask {
            estimator: tempo,
            sample_rate: self.sample_rate,
            recent: self.recent.clone(),
            state: self.state.clone(),
            ready: self.tempo_ready.clone(),
            shutdown: self.shutdown.token(),
        };
        self.spawn("tempo", move || task.run())?;

        let task = BeatPhaseTask {
            confirmer,
            tolerance: self.config.beat.tolerance_secs,
            queue: beat_rx,
            clock,
            state: self.state.clone(),
            listener: self.listener.clone(),
            ready: self.tempo_ready.clone(),
            pulse: self.config.beat.pulse(),
            idle_poll: self.config.beat.idle_poll(),
            shutdown: self.shutdown.token(),
        };
        self.spawn("beat-phase", move || task.run())?;

        let task = SpectralTask {
            decomposer: spectral,
            period: Duration::from_secs_f32(
                self.config.spectral.period_secs.max(0.01),
            ),
            recent: self.recent.clone(),
            state: self.state.clone(),
            shutdown: self.shutdown.token(),
        };
        self.spawn("spectral", move || task.run())?;

        info!(sample_rate = self.sample_rate, "audio pipeline started");
        Ok(())
    }

    fn spawn<F>(&mut self, name: &'static str, body: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.into()).spawn(body)?;
        self.workers.push((name, handle));
        Ok(())
    }

    /// Cancels every thread, joins them, then releases the source. Returns
    /// the first error any thread ended with.
    pub fn stop(&mut self) -> Result<()> {
        if self.workers.is_empty() {
            return Ok(());
        }

        self.shutdown.trigger();
        let mut first_error = None;
        for (name, handle) in self.workers.drain(..) {
            let outcome = match handle.join() {
                Ok(outcome) => outcome,
                Err(_) => Err(StageError::TaskPanicked(name)),
            };
            if let Err(err) = outcome {
                warn!(task = name, error = %err, "analysis task failed");
                first_error.get_or_insert(err);
            }
        }

        lock(&self.source, "audio source")?.take();
        info!("audio pipeline stopped");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Snapshot of the latest published analysis values.
    pub fn state(&self) -> Result<AudioState> {
        Ok(*lock(&self.state, "audio state")?)
    }

    /// Newest `count` samples of the rolling signal.
    pub fn recent_signal(&self, count: usize) -> Result<Vec<i16>> {
        Ok(lock(&self.recent, "recent signal")?.tail(count))
    }

    /// True once a file source has delivered its last buffer.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn is_tempo_ready(&self) -> bool {
        self.tempo_ready.is_fired()
    }

    pub fn clock(&self) -> Option<PlaybackClock> {
        self.clock
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "pipeline stopped with an error");
        }
    }
}

impl std::fmt::Debug for AudioPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPipeline")
            .field("sample_rate", &self.sample_rate)
            .field("workers", &self.workers.len())
            .field("finished", &self.is_finished())
            .finish()
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| StageError::Poisoned(what))
}

fn to_unit(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32_768.0).collect()
}

struct InputTask {
    source: Arc<Mutex<Option<Box<dyn AudioSource>>>>,
    recent: Arc<Mutex<RecentSignal>>,
    finished: Arc<AtomicBool>,
    consumers: Vec<(&'static str, Sender<Vec<i16>>)>,
    shutdown: Shutdown,
}

impl InputTask {
    fn run(self) -> Result<()> {
        while !self.shutdown.is_cancelled() {
            let buffer = {
                let mut source = lock(&self.source, "audio source")?;
                match source.as_mut().map(|source| source.read_buffer()) {
                    Some(Ok(buffer)) => buffer,
                    Some(Err(err)) => {
                        self.finished.store(true, Ordering::SeqCst);
                        return Err(err);
                    }
                    None => None,
                }
            };

            let Some(buffer) = buffer else {
                info!("audio source exhausted");
                self.finished.store(true, Ordering::SeqCst);
                break;
            };

            lock(&self.recent, "recent signal")?.push(&buffer);
            for (name, queue) in &self.consumers {
                match queue.try_send(buffer.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        trace!(consumer = *name, "queue full, dropping buffer")
                    }
                    Err(TrySendError::Disconnected(_)) => {}
                }
            }
        }
        Ok(())
    }
}

struct LoudnessTask {
    estimator: LoudnessEstimator,
    queue: Receiver<Vec<i16>>,
    state: Arc<Mutex<AudioState>>,
    shutdown: Shutdown,
}

impl LoudnessTask {
    fn run(mut self) -> Result<()> {
        loop {
            select! {
                recv(self.queue) -> buffer => {
                    let Ok(buffer) = buffer else { break };
                    if let Some(reading) = self.estimator.push(&buffer) {
                        let mut state = lock(&self.state, "audio state")?;
                        state.rms = reading.rms;
                        state.db = reading.db;
                    }
                }
                recv(self.shutdown.receiver()) -> _ => break,
            }
        }
        Ok(())
    }
}

struct TempoTask {
    estimator: TempoEstimator,
    sample_rate: u32,
    recent: Arc<Mutex<RecentSignal>>,
    state: Arc<Mutex<AudioState>>,
    ready: Arc<Latch>,
    shutdown: Shutdown,
}

impl TempoTask {
    fn run(mut self) -> Result<()> {
        let config = self.estimator.config().clone();
        let period = Duration::from_secs_f32(config.period_secs.max(0.01));
        let window = self.estimator.window_len();
        let mut published = 0u32;

        while self.shutdown.sleep(period) {
            let samples = lock(&self.recent, "recent signal")?.tail(window);
            if samples.len() < window {
                trace!(have = samples.len(), need = window, "tempo window not full yet");
                continue;
            }

            let raw = match self.estimator.estimate(&to_unit(&samples)) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => {
                    warn!(error = %err, "tempo estimation failed");
                    continue;
                }
            };

            let bpm = publish_bpm(raw, config.halve_above_bpm);
            lock(&self.state, "audio state")?.bpm = bpm;
            if bpm != published {
                debug!(raw, bpm, rate = self.sample_rate, "tempo updated");
                published = bpm;
            }
            if bpm > 0 && self.ready.fire() {
                info!(bpm, "tempo ready");
            }
        }
        Ok(())
    }
}

struct BeatPhaseTask {
    confirmer: BeatConfirmer,
    tolerance: f64,
    queue: Receiver<Vec<i16>>,
    clock: PlaybackClock,
    state: Arc<Mutex<AudioState>>,
    listener: Option<Arc<dyn BeatListener>>,
    ready: Arc<Latch>,
    pulse: Duration,
    idle_poll: Duration,
    shutdown: Shutdown,
}

impl BeatPhaseTask {
    fn run(mut self) -> Result<()> {
        if !self.ready.wait(&self.shutdown) {
            return Ok(());
        }
        let mut tracker = BeatTracker::new(self.clock.now(), self.tolerance);

        loop {
            let bpm = lock(&self.state, "audio state")?.bpm;
            tracker.set_bpm(bpm);

            let Some(predicted) = tracker.next_beat_time() else {
                if !self.shutdown.sleep(self.idle_poll) {
                    break;
                }
                continue;
            };

            let mut latest = None;
            if !self.wait_for(self.clock.instant_at(predicted), &mut latest) {
                break;
            }
            let actual = self.clock.now();

            let confirmed = match latest {
                Some(buffer) => self.confirmer.confirm(&buffer).unwrap_or_else(|err| {
                    warn!(error = %err, "beat confirmation failed");
                    false
                }),
                None => false,
            };

            let outcome = tracker.advance(predicted, actual, confirmed);
            trace!(
                predicted,
                actual,
                beat = outcome.beat_time,
                relocked = outcome.relocked,
                skipped = outcome.skipped,
                "beat"
            );

            lock(&self.state, "audio state")?.beat_on_off = true;
            if let Some(listener) = &self.listener {
                listener.on_beat(outcome.beat_time, confirmed);
            }
            let keep_running = self.shutdown.sleep(self.pulse);
            lock(&self.state, "audio state")?.beat_on_off = false;
            if !keep_running {
                break;
            }
        }
        Ok(())
    }
}

impl BeatPhaseTask {
    /// Sleeps until `deadline` in `idle_poll` steps. The queue is drained on
    /// every step so `latest` holds the newest buffer and the input never
    /// drops fresh blocks behind stale ones. Returns `false` on shutdown.
    fn wait_for(&self, deadline: Instant, latest: &mut Option<Vec<i16>>) -> bool {
        loop {
            if let Some(buffer) = self.queue.try_iter().last() {
                *latest = Some(buffer);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return !self.shutdown.is_cancelled();
            }
            if !self.shutdown.sleep(remaining.min(self.idle_poll)) {
                return false;
            }
        }
    }
}

struct SpectralTask {
    decomposer: SpectralDecomposer,
    period: Duration,
    recent: Arc<Mutex<RecentSignal>>,
    state: Arc<Mutex<AudioState>>,
    shutdown: Shutdown,
}

impl SpectralTask {
    fn run(mut self) -> Result<()> {
        let window = self.decomposer.window_len();
        while self.shutdown.sleep(self.period) {
            let samples = lock(&self.recent, "recent signal")?.tail(window);
            if samples.len() < window {
                continue;
            }

            match self.decomposer.analyze(&samples) {
                Ok(Some(analysis)) => {
                    let mut state = lock(&self.state, "audio state")?;
                    state.freqs = analysis.freqs;
                    state.chord = analysis.chord;
                }
                // Silence keeps the last chord.
                Ok(None) => {}
                Err(err) => warn!(error = %err, "spectral analysis failed"),
            }
        }
        Ok(())
    }
}
