use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::sleep;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agrivani::config::{default_config_path, Config};
use agrivani::{
    AgrivaniError, ConversationOrchestrator, Message, Notifier, Role, SubmitOutcome,
    VoiceCaptureState,
};

#[derive(Parser)]
#[command(name = "agrivani")]
#[command(about = "Farming advice assistant with voice input and spoken replies")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive conversation (default)
    Chat,
    /// Ask a single question and print the reply
    Ask {
        /// The question to ask
        #[arg(required = true)]
        question: Vec<String>,
        /// Speak the reply aloud and wait for it to finish
        #[arg(long)]
        speak: bool,
    },
    /// Print the effective configuration with the API key redacted
    Config,
}

const HELP: &str = "\
Type a question and press Enter to ask it.
  /voice      start or stop listening (the transcript is placed in the input)
  /send       send the current input
  /input      show the current input
  /quick [n]  list quick questions, or put question n into the input
  /history    show the conversation so far
  /stop       stop speaking
  /quit       leave";

/// Used when `RUST_LOG` is unset; stdout belongs to the conversation.
const DEFAULT_LOG_FILTER: &str = "warn";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(default_config_path)
        .ok_or_else(|| anyhow::anyhow!("Could not determine config path"))?;

    let command = cli.command.unwrap_or(Commands::Chat);
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(command, config_path))
}

async fn run(command: Commands, config_path: PathBuf) -> Result<()> {
    let mut config = Config::load(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    config.apply_env();

    match command {
        Commands::Chat => run_chat(config).await,
        Commands::Ask { question, speak } => ask(config, &question.join(" "), speak).await,
        Commands::Config => {
            println!("# {}", config_path.display());
            print!("{}", toml::to_string_pretty(&config.redacted())?);
            Ok(())
        }
    }
}

fn warn_if_no_key(config: &Config) {
    if config.assistant.api_key.is_empty() {
        warn!("No API key configured; set AGRIVANI_API_KEY or assistant.api_key");
    }
}

async fn ask(mut config: Config, question: &str, speak: bool) -> Result<()> {
    warn_if_no_key(&config);
    if !speak {
        config.speech.synthesizers.clear();
    }

    let orchestrator = ConversationOrchestrator::from_config(&config)?;
    match orchestrator.submit_text(question).await {
        SubmitOutcome::Replied(reply) => println!("{}", reply),
        SubmitOutcome::Failed => println!("{}", agrivani::FALLBACK_MESSAGE),
        SubmitOutcome::Ignored(reason) => anyhow::bail!("Nothing to ask: {}", reason),
    }

    while orchestrator.is_speaking() {
        sleep(Duration::from_millis(100)).await;
    }
    Ok(())
}

async fn run_chat(config: Config) -> Result<()> {
    warn_if_no_key(&config);
    let notifier = Notifier::with_config(&config.ui);
    let orchestrator = Arc::new(ConversationOrchestrator::from_config(&config)?);
    info!("Conversation {} started", orchestrator.session_id());

    for message in orchestrator.history() {
        print_message(&message);
    }
    println!("{}\n", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) if is_recoverable_read_error(&e) => {
                        warn!("Skipping unreadable input line: {}", e);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                if !handle_line(&orchestrator, &notifier, line.trim()).await? {
                    break;
                }
            }
            Some(event) = orchestrator.next_capture_event() => {
                if let Some(transcript) = orchestrator.handle_capture_event(event) {
                    println!("heard: {}", transcript);
                    println!("(/send to ask it, or type your own question)");
                }
            }
        }
    }

    orchestrator.stop_speaking();
    Ok(())
}

/// A line that is not valid UTF-8 is lost, but the prompt can keep going.
fn is_recoverable_read_error(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::InvalidData
}

/// Returns `false` when the user asked to leave.
async fn handle_line(
    orchestrator: &Arc<ConversationOrchestrator>,
    notifier: &Notifier,
    line: &str,
) -> Result<bool> {
    let (command, argument) = match line.split_once(' ') {
        Some((command, argument)) => (command, argument.trim()),
        None => (line, ""),
    };

    match command {
        "" => {}
        "/quit" | "/exit" => return Ok(false),
        "/help" => println!("{}", HELP),
        "/voice" => toggle_voice(orchestrator, notifier).await?,
        "/send" => spawn_submission(orchestrator, None),
        "/input" => println!("input: {}", orchestrator.input()),
        "/quick" if argument.is_empty() => {
            for (i, question) in orchestrator.quick_questions().iter().enumerate() {
                println!("  {}. {}", i + 1, question);
            }
        }
        "/quick" => {
            let chosen = argument
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .ok_or_else(|| AgrivaniError::InvalidInput(format!("not a number: {}", argument)))
                .and_then(|index| orchestrator.choose_quick_question(index));
            match chosen {
                Ok(question) => println!("input: {}  (/send to ask it)", question),
                Err(e) => println!("{}", e),
            }
        }
        "/history" => {
            for message in orchestrator.history() {
                print_message(&message);
            }
        }
        "/stop" => orchestrator.stop_speaking(),
        other if other.starts_with('/') => println!("Unknown command {}, try /help", other),
        _ => spawn_submission(orchestrator, Some(line.to_string())),
    }

    Ok(true)
}

async fn toggle_voice(orchestrator: &ConversationOrchestrator, notifier: &Notifier) -> Result<()> {
    match orchestrator.toggle_voice() {
        Ok(VoiceCaptureState::Listening) => println!("Listening... (/voice again to stop)"),
        Ok(VoiceCaptureState::Idle) => println!("Stopped listening."),
        Err(e @ AgrivaniError::CapabilityUnavailable(_)) => {
            if !notifier.show_blocking("AgriVani", &e.to_string()).await? {
                println!("{}", e);
            }
        }
        Err(e) => println!("Voice input failed: {}", e),
    }
    Ok(())
}

/// Send `typed` as is, or the input buffer when `typed` is `None`.
///
/// Typed lines never pass through the buffer, so a voice transcript landing
/// there meanwhile is left for the user to review.
fn spawn_submission(orchestrator: &Arc<ConversationOrchestrator>, typed: Option<String>) {
    let has_text = match &typed {
        Some(text) => !text.trim().is_empty(),
        None => !orchestrator.input().trim().is_empty(),
    };
    if has_text && !orchestrator.is_pending() {
        println!("Thinking...");
    }

    let orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        let outcome = match typed {
            Some(text) => orchestrator.submit_text(&text).await,
            None => orchestrator.submit_input().await,
        };
        match outcome {
            SubmitOutcome::Replied(reply) => print_message(&Message::assistant(reply)),
            SubmitOutcome::Failed => print_message(&Message::assistant(agrivani::FALLBACK_MESSAGE)),
            SubmitOutcome::Ignored(reason) => println!("(not sent: {})", reason),
        }
    });
}

fn print_message(message: &Message) {
    let speaker = match message.role {
        Role::User => "you",
        Role::Assistant => "agrivani",
        Role::System => "system",
    };
    println!("{:>8}: {}", speaker, message.content);
}
