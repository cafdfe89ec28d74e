use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use keyvox::audio::{self, AudioHandle, PlayOutcome, SAMPLE_RATE};
use keyvox::speech::{EngineCommand, SpeakOutcome, SpeechEngine, SynthesisProcess};
use keyvox::{BeepKind, Client, Config, KeyReport, KeypadPoller, Layout, PhraseCache, Status};

/// Keyvox - keypad and spoken-audio controller for a display-less transceiver
#[derive(Parser)]
#[command(name = "keyvox", version, about)]
struct Cli {
    /// Configuration file (defaults to ~/.config/keyvox/config.toml)
    #[arg(short, long, env = "KEYVOX_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the channel sockets
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hardware process (keypad, audio, speech)
    Hardware {
        /// Keypad layout
        #[arg(long)]
        layout: Option<Layout>,
        /// evdev device of the keypad
        #[arg(long)]
        keypad: Option<PathBuf>,
        /// Voice model for the speech engine
        #[arg(long)]
        model: Option<PathBuf>,
    },
    /// Speak text through the hardware process
    Say {
        text: String,
    },
    /// Synthesise text into the pre-generated speech directory
    Save {
        text: String,
    },
    /// Play a pre-rendered WAV file
    Play {
        path: PathBuf,
    },
    /// Play a beep (keypress, hold, error)
    Beep {
        #[arg(default_value = "keypress")]
        kind: BeepKind,
    },
    /// Silence playback and cancel queued audio
    Interrupt,
    /// Set output volume in percent
    Volume {
        percent: u8,
    },
    /// Set speech speed in percent of normal
    Speed {
        percent: u8,
    },
    /// Speak every key pressed on the keypad until the hardware goes away
    Keys {
        /// Keypad layout to switch to first
        #[arg(long)]
        layout: Option<Layout>,
    },
    /// Test speaker output locally
    TestSpeaker,
    /// Test speech synthesis locally, without the hardware process
    TestTts {
        /// Text to speak
        #[arg(default_value = "fourteen point two five zero")]
        text: String,
    },
    /// Inspect or empty the phrase cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Show entry count and size
    Stats,
    /// Remove every entry
    Clear,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,keyvox=info",
        1 => "info,keyvox=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.socket_dir {
        config.transport.socket_dir = dir;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Command::Hardware {
            layout,
            keypad,
            model,
        } => {
            if let Some(layout) = layout {
                config.keypad.layout = layout;
            }
            if keypad.is_some() {
                config.keypad.device = keypad;
            }
            if model.is_some() {
                config.speech.model = model;
            }
            tracing::info!(layout = ?config.keypad.layout, "starting hardware process");
            keyvox::hardware::run(&config)?;
            Ok(())
        }
        Command::Say { text } => report(Client::connect(&config)?.speak(&text)?),
        Command::Save { text } => report(Client::connect(&config)?.save_speech(&text)?),
        Command::Play { path } => report(Client::connect(&config)?.play_file(&path)?),
        Command::Beep { kind } => report(Client::connect(&config)?.beep(kind)?),
        Command::Interrupt => report(Client::connect(&config)?.interrupt()?),
        Command::Volume { percent } => report(Client::connect(&config)?.set_volume(percent)?),
        Command::Speed { percent } => report(Client::connect(&config)?.set_speech_speed(percent)?),
        Command::Keys { layout } => echo_keys(&config, layout),
        Command::TestSpeaker => test_speaker(&config),
        Command::TestTts { text } => test_tts(&config, &text),
        Command::Cache { action } => cache_command(&config, &action),
    }
}

fn report(status: Status) -> anyhow::Result<()> {
    match status {
        Status::Ok => Ok(()),
        Status::Interrupted => {
            println!("interrupted");
            Ok(())
        }
        Status::Failed => anyhow::bail!("hardware reported failure"),
    }
}

/// Speak each key as it is pressed
fn echo_keys(config: &Config, layout: Option<Layout>) -> anyhow::Result<()> {
    let client = Arc::new(Client::connect(config)?);
    if let Some(layout) = layout {
        report(client.set_layout(layout)?)?;
    }

    let (tx, rx) = mpsc::channel::<KeyReport>();
    let poller = KeypadPoller::start(
        Arc::clone(&client),
        config.keypad.poll_interval,
        config.keypad.key_beep,
        move |report| {
            let _ = tx.send(report);
        },
    )?;

    println!("Press keys; each one is spoken. Stop the hardware process to exit.");
    for report in rx {
        let Some(symbol) = report.symbol else {
            continue;
        };
        let text = if report.is_hold {
            format!("hold {symbol}")
        } else {
            symbol.to_string()
        };
        println!("{text}");

        // Newest key wins over whatever is still being spoken
        client.interrupt()?;
        let tag = client.send_audio(&keyvox::AudioRequest::Speak(text))?;
        if let Err(e) = client.await_audio(tag) {
            tracing::warn!(error = %e, "key echo not acknowledged");
        }
    }

    poller.join();
    Ok(())
}

/// Play a 440 Hz tone on the configured device
fn test_speaker(config: &Config) -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let handle = AudioHandle::new(config.audio.volume);
    let mut output =
        audio::open_output(config.audio.device.as_deref(), handle, config.audio.chunk)?;

    let frequency = 440.0_f32;
    let num_samples = SAMPLE_RATE * 2;
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    let samples: Vec<i16> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            ((2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 * f32::from(i16::MAX)) as i16
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), SAMPLE_RATE);
    output.play_pcm(&samples)?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: aplay -l (to list devices)");
    println!("  2. Set audio.device in the config file");
    println!("  3. Try: alsamixer (to check output levels)");

    Ok(())
}

/// Speak through a local synthesis process and output device
fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let model = config
        .speech
        .model
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("no speech model configured (speech.model)"))?;
    let command = EngineCommand::piper(&config.speech.program, model, config.speech.speed)?;
    let mut engine = SynthesisProcess::spawn(command, Box::new(config.utterance_boundary()))?;

    let handle = AudioHandle::new(config.audio.volume);
    let mut output =
        audio::open_output(config.audio.device.as_deref(), handle, config.audio.chunk)?;

    println!("Synthesizing speech with {}...", engine.describe());
    let started = std::time::Instant::now();
    let mut first_chunk: Option<Duration> = None;
    let outcome = engine.speak(text, &mut |chunk| {
        if first_chunk.is_none() {
            first_chunk = Some(started.elapsed());
        }
        matches!(output.write(chunk), Ok(PlayOutcome::Completed))
    })?;
    let _ = output.finish();

    match outcome {
        SpeakOutcome::Completed(pcm) => {
            println!("Got {} samples", pcm.len());
            if let Some(latency) = first_chunk {
                println!("First audio after {} ms", latency.as_millis());
            }
        }
        SpeakOutcome::Interrupted => println!("Playback stopped early"),
    }

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

fn cache_command(config: &Config, action: &CacheCommand) -> anyhow::Result<()> {
    let mut cache = PhraseCache::open(&config.cache.dir, config.cache.max_bytes)?;
    match action {
        CacheCommand::Stats => {
            println!("{}: {}", cache.dir().display(), cache.stats());
        }
        CacheCommand::Clear => {
            let before = cache.stats();
            cache.clear()?;
            println!("Removed {} entries", before.entries);
        }
    }
    Ok(())
}
