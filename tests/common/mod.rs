//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use keyvox::audio::{
    AudioHandle, AudioOutput, PcmSink, RingWriter, SinkError, chunk_samples, sample_ring,
};
use keyvox::client::Client;
use keyvox::hardware::{Backends, OutputFactory, Session};
use keyvox::keypad::{KeyAction, KeySource, RawKeySignal};
use keyvox::speech::{SpeakOutcome, SpeechEngine};
use keyvox::{Config, PhraseCache, transport};

/// Samples produced per character of fake speech
pub const SAMPLES_PER_CHAR: usize = 1600;

/// Sample value the fake engine uses for `text`
#[must_use]
pub fn marker(text: &str) -> i16 {
    let sum: u32 = text.bytes().map(u32::from).sum();
    i16::try_from(sum % 30_000 + 1).unwrap()
}

/// What reached the fake device
#[derive(Debug, Default)]
pub struct Played {
    pub samples: Vec<i16>,
    pub drops: usize,
}

/// Shared view of a [`RecordingSink`]
#[derive(Debug, Clone, Default)]
pub struct PlaybackLog(Arc<Mutex<Played>>);

impl PlaybackLog {
    pub fn samples(&self) -> Vec<i16> {
        self.0.lock().unwrap().samples.clone()
    }

    pub fn drops(&self) -> usize {
        self.0.lock().unwrap().drops
    }

    /// Samples of `text` that reached the device
    pub fn count_of(&self, text: &str) -> usize {
        let m = marker(text);
        let log = self.0.lock().unwrap();
        log.samples.iter().filter(|&&s| s == m).count()
    }

    /// Poll until `pred` holds or `timeout` passes
    pub fn wait_for(&self, timeout: Duration, pred: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred(self) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        pred(self)
    }
}

/// Sink that records samples and takes `pace` per chunk like a real device
pub struct RecordingSink {
    log: PlaybackLog,
    pace: Duration,
}

impl RecordingSink {
    pub const fn new(log: PlaybackLog, pace: Duration) -> Self {
        Self { log, pace }
    }
}

impl PcmSink for RecordingSink {
    fn write(&mut self, samples: &[i16], cancelled: &dyn Fn() -> bool) -> Result<(), SinkError> {
        if cancelled() {
            return Ok(());
        }
        thread::sleep(self.pace);
        let mut log = self.log.0.lock().unwrap();
        log.samples.extend_from_slice(samples);
        Ok(())
    }

    fn drop_buffered(&mut self) {
        self.log.0.lock().unwrap().drops += 1;
    }

    fn recover(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn buffered(&self) -> usize {
        0
    }

    fn describe(&self) -> String {
        "recording".into()
    }
}

/// Sink modelled on the cpal device: a sample ring drained by a callback
/// thread that takes one period of samples per `period`
pub struct RingDevice {
    ring: RingWriter,
    handle: AudioHandle,
    log: PlaybackLog,
    running: Arc<AtomicBool>,
    callback: Option<JoinHandle<()>>,
}

impl RingDevice {
    pub fn start(log: PlaybackLog, handle: AudioHandle, capacity: usize, period: Duration) -> Self {
        let (ring, mut reader) = sample_ring(capacity, handle.clone());
        let running = Arc::new(AtomicBool::new(true));

        let callback = {
            let log = log.clone();
            let running = Arc::clone(&running);
            thread::spawn(move || {
                let mut buf = vec![0i16; chunk_samples(period)];
                while running.load(Ordering::Acquire) {
                    // Popped samples count as played only once logged
                    let mut played = log.0.lock().unwrap();
                    let n = reader.fill(&mut buf);
                    played.samples.extend_from_slice(&buf[..n]);
                    drop(played);
                    thread::sleep(period);
                }
            })
        };

        Self {
            ring,
            handle,
            log,
            running,
            callback: Some(callback),
        }
    }
}

impl PcmSink for RingDevice {
    fn write(&mut self, samples: &[i16], cancelled: &dyn Fn() -> bool) -> Result<(), SinkError> {
        self.ring.write(samples, cancelled)
    }

    fn drop_buffered(&mut self) {
        self.log.0.lock().unwrap().drops += 1;
        let _ = self.handle.request_flush();
    }

    fn recover(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn buffered(&self) -> usize {
        self.ring.buffered()
    }

    fn describe(&self) -> String {
        "ring device".into()
    }
}

impl Drop for RingDevice {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(callback) = self.callback.take() {
            let _ = callback.join();
        }
    }
}

/// Speech engine producing `marker(text)` samples, `SAMPLES_PER_CHAR` per char
pub struct FakeEngine {
    pub calls: Arc<AtomicUsize>,
    pub speeds: Arc<Mutex<Vec<u8>>>,
    chunk: usize,
}

impl FakeEngine {
    pub fn new(calls: Arc<AtomicUsize>) -> Self {
        Self {
            calls,
            speeds: Arc::default(),
            chunk: 800,
        }
    }
}

impl SpeechEngine for FakeEngine {
    fn speak(
        &mut self,
        text: &str,
        on_chunk: &mut dyn FnMut(&[i16]) -> bool,
    ) -> keyvox::Result<SpeakOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let pcm = vec![marker(text); text.len() * SAMPLES_PER_CHAR];
        for chunk in pcm.chunks(self.chunk) {
            if !on_chunk(chunk) {
                return Ok(SpeakOutcome::Interrupted);
            }
        }
        Ok(SpeakOutcome::Completed(pcm))
    }

    fn set_speed(&mut self, percent: u8) -> keyvox::Result<()> {
        self.speeds.lock().unwrap().push(percent);
        Ok(())
    }

    fn describe(&self) -> String {
        "fake".into()
    }
}

/// Key source fed from the test through a [`KeyScript`]
pub struct ScriptedKeySource {
    pending: Arc<Mutex<VecDeque<RawKeySignal>>>,
}

/// Test-side handle for pushing raw key signals
#[derive(Clone, Default)]
pub struct KeyScript(Arc<Mutex<VecDeque<RawKeySignal>>>);

impl KeyScript {
    pub fn source(&self) -> ScriptedKeySource {
        ScriptedKeySource {
            pending: Arc::clone(&self.0),
        }
    }

    pub fn push(&self, code: u16, action: KeyAction) {
        self.0
            .lock()
            .unwrap()
            .push_back(RawKeySignal::new(code, action, Instant::now()));
    }

    pub fn tap(&self, code: u16) {
        self.push(code, KeyAction::Down);
        self.push(code, KeyAction::Up);
    }
}

impl KeySource for ScriptedKeySource {
    fn read_signals(&mut self, out: &mut Vec<RawKeySignal>) -> keyvox::Result<()> {
        out.extend(self.pending.lock().unwrap().drain(..));
        Ok(())
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}

/// Configuration rooted in a temporary directory, with short timeouts
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.transport.socket_dir = dir.join("sock");
    config.cache.dir = dir.join("cache");
    config.audio.pregen_dir = dir.join("pregen");
    config.timeouts.keypad = Duration::from_secs(2);
    config.timeouts.audio = Duration::from_secs(5);
    config.timeouts.config = Duration::from_secs(2);
    config
}

/// Fakes wired into one hardware session
pub struct Fakes {
    pub playback: PlaybackLog,
    pub synth_calls: Arc<AtomicUsize>,
    pub speeds: Arc<Mutex<Vec<u8>>>,
    pub keys: KeyScript,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            playback: PlaybackLog::default(),
            synth_calls: Arc::default(),
            speeds: Arc::default(),
            keys: KeyScript::default(),
        }
    }

    /// Backends over the fakes; each sink write takes `pace`
    pub fn backends(&self, config: &Config, pace: Duration, with_output: bool) -> Backends {
        let log = self.playback.clone();
        let chunk = config.audio.chunk;
        self.with_output(
            config,
            Box::new(move |handle: AudioHandle| {
                with_output.then(|| {
                    AudioOutput::new(Box::new(RecordingSink::new(log, pace)), handle, chunk)
                })
            }),
        )
    }

    /// Backends playing through a [`RingDevice`] four chunks deep
    pub fn device_backends(&self, config: &Config, period: Duration) -> Backends {
        let log = self.playback.clone();
        let chunk = config.audio.chunk;
        self.with_output(
            config,
            Box::new(move |handle: AudioHandle| {
                let capacity = 4 * chunk_samples(chunk);
                let device = RingDevice::start(log, handle.clone(), capacity, period);
                Some(AudioOutput::new(Box::new(device), handle, chunk))
            }),
        )
    }

    fn with_output(&self, config: &Config, output: OutputFactory) -> Backends {
        let calls = Arc::clone(&self.synth_calls);
        let speeds = Arc::clone(&self.speeds);
        let keys = self.keys.clone();
        let cache = PhraseCache::open(&config.cache.dir, config.cache.max_bytes).unwrap();

        Backends {
            output,
            engine: Box::new(move || {
                let mut engine = FakeEngine::new(calls);
                engine.speeds = speeds;
                Some(Box::new(engine) as Box<dyn SpeechEngine>)
            }),
            keypad: Box::new(move || Ok(Box::new(keys.source()) as Box<dyn KeySource>)),
            cache: Some(cache),
        }
    }
}

/// A hardware session and a client connected to it in-process
pub fn connected(config: &Config, backends: Backends) -> (Client, Session) {
    let (app, hw) = transport::pair().unwrap();
    let session = Session::start(hw, backends, config).unwrap();
    let client = Client::from_channels(
        app,
        config.timeouts.clone(),
        config.transport.queue_capacity,
    )
    .unwrap();
    (client, session)
}
