use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use parley::asr::{AsrEvent, RecognitionEngine, TaskOptions, WebSocketConnector};
use parley::conversation::{
    Collaborators, ConversationState, MessageStore, Orchestrator, OrchestratorConfig,
    OrchestratorHandle, Synthesizer,
};
use parley::db::{self, EphemeralStore, SessionRepo};
use parley::llm::ChatClient;
use parley::tts::SpeechSynthesizer;
use parley::voice::{AudioFrame, AudioPlayback, AudioSource, MicrophoneCapture, WavFileSource};
use parley::Config;

/// parley - hands-free voice conversations with an AI assistant
#[derive(Parser)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/parley/config.toml)
    #[arg(short, long, env = "PARLEY_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Keep conversations in memory only
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Hold a continuous voice conversation (default)
    Run {
        /// Continue an existing session
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Recognize a WAV file and print fragments as they arrive
    Transcribe {
        /// 16-bit or float WAV, at most 60 seconds
        path: PathBuf,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speech synthesis and playback
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// List stored conversation sessions
    Sessions,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn,parley=info",
        1 => "info,parley=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(data_dir = %config.data_dir.display(), "loaded configuration");

    match cli.command.unwrap_or(Command::Run { session: None }) {
        Command::Run { session } => converse(config, cli.ephemeral, session).await,
        Command::Transcribe { path } => transcribe(&config, &path).await,
        Command::TestMic { duration } => test_mic(&config, duration).await,
        Command::TestTts { text } => test_tts(&config, &text).await,
        Command::Sessions => list_sessions(&config, cli.ephemeral),
    }
}

fn open_store(config: &Config, ephemeral: bool) -> anyhow::Result<Arc<dyn MessageStore>> {
    if ephemeral {
        tracing::info!("conversations will not be saved");
        return Ok(Arc::new(EphemeralStore::new()));
    }
    let pool = db::init(config.database_path())?;
    Ok(Arc::new(SessionRepo::new(pool)))
}

fn recognition_engine(config: &Config) -> (RecognitionEngine, mpsc::UnboundedReceiver<AsrEvent>) {
    RecognitionEngine::new(
        config.asr.clone(),
        config.api_key.clone(),
        Arc::new(WebSocketConnector),
    )
}

/// Interactive conversation driven from the terminal
async fn converse(config: Config, ephemeral: bool, session: Option<String>) -> anyhow::Result<()> {
    if config.api_key.is_none() {
        anyhow::bail!("set DASHSCOPE_API_KEY or api_key in the config file");
    }

    let store = open_store(&config, ephemeral)?;
    let generator = Arc::new(ChatClient::new(&config.llm, config.api_key.clone())?);
    let synthesizer = Arc::new(SpeechSynthesizer::new(
        &config.tts,
        config.api_key.clone(),
        AudioPlayback::default(),
    )?);

    let (engine, events) = recognition_engine(&config);
    let capture = Box::new(MicrophoneCapture::new(&config.audio));

    let orchestrator_config = OrchestratorConfig {
        session_id: session,
        ..OrchestratorConfig::from_config(&config)
    };
    let (orchestrator, handle) = Orchestrator::new(
        orchestrator_config,
        engine,
        events,
        capture,
        Collaborators {
            generator,
            synthesizer,
            store,
        },
    );
    let running = tokio::spawn(orchestrator.run());

    println!("Enter: talk / cancel   p: pause   r: resume   s: stop speech   n: new session   q: quit");
    handle.start_listening()?;

    let display = tokio::spawn(show_progress(handle.clone()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    if !handle_key(&handle, line.trim()).await? {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown()?;
    if let Err(e) = running.await {
        tracing::warn!(error = %e, "conversation loop ended abnormally");
    }
    display.abort();
    Ok(())
}

/// Act on one line of terminal input; `false` means quit
async fn handle_key(handle: &OrchestratorHandle, key: &str) -> anyhow::Result<bool> {
    match key {
        "" => {
            if handle.state() == ConversationState::Idle {
                handle.start_listening()?;
            } else {
                handle.cancel()?;
            }
        }
        "p" => handle.pause_speech()?,
        "r" => handle.resume_speech()?,
        "s" => handle.stop_speech()?,
        "n" => match handle.new_session().await {
            Ok(session) => println!("[new session {}]", session.id),
            Err(e) => println!("[{e}]"),
        },
        "q" => return Ok(false),
        other => println!("[unknown key {other:?}]"),
    }
    Ok(true)
}

/// Print state changes, live transcript and status messages
async fn show_progress(handle: OrchestratorHandle) {
    let mut state = handle.subscribe();
    let mut status = handle.status();
    let mut transcript = handle.transcript();

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                println!("[{}]", current.label());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(message) = status.borrow_and_update().clone() {
                    println!("  {message}");
                }
            }
            changed = transcript.changed() => {
                if changed.is_err() {
                    break;
                }
                let live = transcript.borrow_and_update().clone();
                if live.text.is_empty() {
                    continue;
                }
                let marker = if live.is_final { ">" } else { "~" };
                println!("{marker} {}", live.text);
                if let Some(translation) = live.translation.filter(|t| !t.is_empty()) {
                    println!("  ({translation})");
                }
            }
        }
    }
}

/// Run one recognition task over a WAV file
async fn transcribe(config: &Config, path: &Path) -> anyhow::Result<()> {
    let mut source = WavFileSource::open(path, config.audio.frame_bytes)?;
    println!("Streaming {} ({:.1}s)...", path.display(), source.duration().as_secs_f64());

    let (mut engine, mut events) = recognition_engine(config);
    engine.connect().await?;

    let options = TaskOptions {
        target_lang: config.asr.target_lang.clone(),
        max_end_silence_ms: config.asr.max_end_silence_ms,
    };
    let task_id = engine.start_task(&options).await?;
    source.start(Arc::new(engine.audio_sink()?))?;

    let mut poll = tokio::time::interval(Duration::from_millis(100));
    let mut finished = false;
    while !finished {
        tokio::select! {
            Some(event) = events.recv() => finished = print_event(&event),
            _ = poll.tick() => {
                if !source.is_capturing() {
                    engine.finish_task().await?;
                    while let Ok(event) = events.try_recv() {
                        print_event(&event);
                    }
                    finished = true;
                }
            }
        }
    }

    source.stop();
    engine.disconnect().await;
    tracing::debug!(task_id = %task_id, "transcription finished");
    Ok(())
}

/// Print a recognition event; `true` once the task has ended
fn print_event(event: &AsrEvent) -> bool {
    match event {
        AsrEvent::TaskStarted { .. } => false,
        AsrEvent::Transcript { fragment, .. } => {
            if fragment.is_final {
                println!("> {}", fragment.text);
            } else {
                println!("~ {}", fragment.text);
            }
            false
        }
        AsrEvent::Translation { fragment, .. } => {
            if fragment.is_final {
                println!("  [{}] {}", fragment.lang, fragment.text);
            }
            false
        }
        AsrEvent::TaskFinished { .. } => true,
        AsrEvent::TaskFailed { code, message, .. } => {
            println!("recognition failed ({code}): {message}");
            true
        }
        AsrEvent::ConnectionLost { reason, .. } => {
            println!("connection lost: {reason}");
            true
        }
    }
}

/// Show a level meter of microphone input
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    match MicrophoneCapture::list_devices() {
        Ok(devices) => {
            println!("Input devices:");
            for name in devices {
                println!("  {name}");
            }
        }
        Err(e) => println!("Could not list input devices: {e}"),
    }

    println!("\nTesting microphone for {duration} seconds. Speak into your microphone!\n");

    let (tx, mut rx) = mpsc::unbounded_channel::<AudioFrame>();
    let mut capture = MicrophoneCapture::new(&config.audio);
    capture.start(Arc::new(tx))?;

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.tick().await;

    for second in 1..=duration {
        tick.tick().await;

        let mut samples = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            samples.extend(
                frame
                    .as_bytes()
                    .chunks_exact(2)
                    .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0),
            );
        }

        let energy = rms(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{second:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}]");
    }

    capture.stop();

    println!("\nIf the meter moved, your microphone is working.");
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}

/// Synthesize and play one utterance
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Synthesizing: \"{text}\"");

    let synthesizer = SpeechSynthesizer::new(
        &config.tts,
        config.api_key.clone(),
        AudioPlayback::default(),
    )?;
    synthesizer.speak(text).await?;

    println!("If you heard the speech, synthesis and playback are working.");
    Ok(())
}

fn list_sessions(config: &Config, ephemeral: bool) -> anyhow::Result<()> {
    let store = open_store(config, ephemeral)?;
    let sessions = store.list_sessions()?;

    if sessions.is_empty() {
        println!("No sessions yet.");
        return Ok(());
    }

    for session in sessions {
        println!(
            "{}  {}  {}",
            session.id,
            session.updated_at.format("%Y-%m-%d %H:%M"),
            session.title
        );
    }
    Ok(())
}
