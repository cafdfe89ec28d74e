//! Hardware side: owns the keypad, the audio device and the speech engine
//!
//! ```text
//!   keypad.sock ──► reader ──► keypad lane ──► Keypad (evdev)
//!   audio.sock  ──► reader ──┬─► audio lane ──► cache / engine ──► AudioOutput
//!                            └─► interrupt, beep (handled on the reader)
//!   control.sock ─► reader ──► volume (immediate), layout, speed (lanes)
//! ```
//!
//! A [`Session`] lives for one application connection. [`run`] accepts
//! connections forever, starting a fresh session for each.

pub mod dispatch;
pub mod worker;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::{self, JoinHandle};

use self::dispatch::{Dispatcher, pump};
use self::worker::{AudioWorker, KeySourceFactory, KeypadWorker};
use crate::audio::{self, AudioHandle, AudioOutput, BeepSet};
use crate::cache::PhraseCache;
use crate::config::Config;
use crate::keypad::{EvdevSource, KeySource};
use crate::protocol::request::READY;
use crate::protocol::{Packet, PacketKind};
use crate::queue::BoundedQueue;
use crate::speech::{EngineCommand, SpeechEngine, SynthesisProcess};
use crate::transport::{Channel, ChannelSet, Listener};
use crate::Result;

/// Opens the audio output on the audio lane's own thread
pub type OutputFactory = Box<dyn FnOnce(AudioHandle) -> Option<AudioOutput> + Send>;

/// Starts the speech engine
pub type EngineFactory = Box<dyn FnOnce() -> Option<Box<dyn SpeechEngine>> + Send>;

/// Device and engine constructors for one session
///
/// Each backend is optional at runtime: a missing device or engine turns the
/// requests that need it into failures instead of stopping the process.
pub struct Backends {
    pub output: OutputFactory,
    pub engine: EngineFactory,
    pub keypad: KeySourceFactory,
    pub cache: Option<PhraseCache>,
}

impl Backends {
    /// Production backends: cpal output, piper engine, evdev keypad
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let device = config.audio.device.clone();
        let chunk = config.audio.chunk;
        let output: OutputFactory = Box::new(move |handle| {
            match audio::open_output(device.as_deref(), handle, chunk) {
                Ok(output) => Some(output),
                Err(e) => {
                    tracing::error!(error = %e, "audio output unavailable");
                    None
                }
            }
        });

        let speech = config.speech.clone();
        let boundary = config.utterance_boundary();
        let engine: EngineFactory = Box::new(move || {
            let Some(model) = speech.model.as_deref() else {
                tracing::warn!("no speech model configured, speech disabled");
                return None;
            };
            let started = EngineCommand::piper(&speech.program, model, speech.speed)
                .and_then(|command| SynthesisProcess::spawn(command, Box::new(boundary)));
            match started {
                Ok(process) => Some(Box::new(process) as Box<dyn SpeechEngine>),
                Err(e) => {
                    tracing::error!(error = %e, "speech engine unavailable");
                    None
                }
            }
        });

        let keypad_device = config.keypad.device.clone();
        let keypad: KeySourceFactory = Box::new(move || {
            EvdevSource::open(keypad_device.as_deref()).map(|s| Box::new(s) as Box<dyn KeySource>)
        });

        let cache = match PhraseCache::open(&config.cache.dir, config.cache.max_bytes) {
            Ok(cache) => Some(cache),
            Err(e) => {
                tracing::warn!(error = %e, "phrase cache disabled");
                None
            }
        };

        Self {
            output,
            engine,
            keypad,
            cache,
        }
    }
}

/// Threads serving one connected application
pub struct Session {
    dispatcher: Arc<Dispatcher>,
    channels: Arc<ChannelSet>,
    readers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl Session {
    /// Start the lanes and readers, then announce readiness on the control
    /// channel
    ///
    /// # Errors
    ///
    /// Returns error if a thread or channel reader cannot be created
    pub fn start(channels: ChannelSet, backends: Backends, config: &Config) -> Result<Self> {
        let handle = AudioHandle::new(config.audio.volume);
        let dispatcher = Arc::new(Dispatcher {
            audio_jobs: Arc::new(BoundedQueue::new("audio-jobs", config.transport.job_capacity)),
            keypad_jobs: Arc::new(BoundedQueue::new("keypad-jobs", config.transport.job_capacity)),
            handle: handle.clone(),
            beeps: BeepSet::load(config.audio.beep_dir.as_deref()),
            audio_ready: Arc::new(AtomicBool::new(false)),
        });
        let channels = Arc::new(channels);

        let Backends {
            output,
            engine,
            keypad,
            cache,
        } = backends;

        let mut workers = Vec::with_capacity(2);

        let jobs = Arc::clone(&dispatcher.audio_jobs);
        let ready = Arc::clone(&dispatcher.audio_ready);
        let pregen_dir = config.audio.pregen_dir.clone();
        workers.push(thread::Builder::new().name("audio-lane".into()).spawn(move || {
            let worker = AudioWorker {
                output: output(handle.clone()),
                engine: engine(),
                cache,
                handle,
                pregen_dir,
            };
            worker.run(&jobs, &ready);
        })?);

        let jobs = Arc::clone(&dispatcher.keypad_jobs);
        let settings = config.debounce_settings();
        workers.push(
            thread::Builder::new()
                .name("keypad-lane".into())
                .spawn(move || KeypadWorker::new(keypad, settings).run(&jobs))?,
        );

        let mut readers = Vec::with_capacity(Channel::ALL.len());
        for channel in Channel::ALL {
            let link = channels.link(channel);
            let reader = link.reader(None)?;
            let reply = link.writer();
            let dispatcher = Arc::clone(&dispatcher);
            let all = Arc::clone(&channels);
            readers.push(
                thread::Builder::new()
                    .name(format!("{channel}-reader"))
                    .spawn(move || {
                        pump(channel, reader, &reply, &dispatcher);
                        // One channel gone means the application is gone
                        all.shutdown();
                        dispatcher.close();
                    })?,
            );
        }

        let ready = Packet::new(PacketKind::Config, 0, vec![READY])?;
        channels.control.writer().send(&ready)?;
        tracing::info!("hardware ready");

        Ok(Self {
            dispatcher,
            channels,
            readers,
            workers,
        })
    }

    /// Block until the application disconnects and every thread has exited
    pub fn wait(self) {
        for reader in self.readers {
            let _ = reader.join();
        }
        self.dispatcher.close();
        for worker in self.workers {
            let _ = worker.join();
        }
        tracing::debug!("session ended");
    }

    /// Close the channels and wait for the session to wind down
    pub fn shutdown(self) {
        self.channels.shutdown();
        self.dispatcher.close();
        self.wait();
    }
}

/// Serve applications on the configured socket directory
///
/// Returns only on a listener failure.
///
/// # Errors
///
/// Returns error if the sockets cannot be bound or accepting fails
pub fn run(config: &Config) -> Result<()> {
    let listener = Listener::bind(&config.transport.socket_dir)?;
    tracing::info!(dir = %config.transport.socket_dir.display(), "waiting for application");

    loop {
        let channels = listener.accept()?;
        tracing::info!("application connected");
        let session = Session::start(channels, Backends::from_config(config), config)?;
        session.wait();
        tracing::info!("application disconnected, waiting for reconnect");
    }
}
