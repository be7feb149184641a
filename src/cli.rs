//! `screenai` command line: drives the capture, annotation and chat pipeline
//! from files instead of a live screen.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::chat::{ConversationAssembler, OutgoingMessage, TurnEvent, TurnStatus};
use crate::commands::{self, CaptureRequest};
use crate::config::{self, Settings};
use crate::models::{Conversation, DisplayRect, ProviderId, Role};
use crate::state::AppState;
use crate::storage::SqliteStore;

const DB_FILE_NAME: &str = "screenai.sqlite";

#[derive(Parser, Debug)]
#[command(name = "screenai", version, about = "Ask vision models about annotated screenshots")]
pub struct Cli {
    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    /// Conversation database (defaults to the platform data directory)
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start an empty conversation and print its id
    New {
        #[arg(long)]
        provider: Option<ProviderId>,
        #[arg(long)]
        project: Option<Uuid>,
    },
    /// Send a message, optionally with a screenshot, and stream the reply
    Send {
        /// Existing conversation; a new one is started when omitted
        #[arg(long)]
        conversation: Option<Uuid>,
        /// Provider for a new conversation
        #[arg(long)]
        provider: Option<ProviderId>,
        /// Captured image to attach
        #[arg(long)]
        image: Option<PathBuf>,
        /// Region to crop, as x,y,width,height in display pixels
        #[arg(long, value_parser = parse_region, requires = "image")]
        region: Option<DisplayRect>,
        /// Display size the image was shown at, as WIDTHxHEIGHT
        #[arg(long, value_parser = parse_display_size, requires = "image")]
        display: Option<DisplaySize>,
        /// JSON file with the shapes to draw, in display pixels
        #[arg(long, requires = "image")]
        annotations: Option<PathBuf>,
        /// Message text
        text: Vec<String>,
    },
    /// List conversations, most recently updated first
    List,
    /// Print a conversation's messages
    Show { id: Uuid },
    /// Delete a conversation and its messages
    Delete { id: Uuid },
    /// Manage provider API keys
    Key {
        #[command(subcommand)]
        action: KeyCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum KeyCommand {
    /// Store a provider's API key in the OS keyring and enable the provider
    Set {
        provider: ProviderId,
        /// The key; read from standard input when omitted
        key: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DisplaySize {
    pub width: f64,
    pub height: f64,
}

fn parse_positive(value: &str, what: &str) -> Result<f64, String> {
    let parsed: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid {}: '{}'", what, value))?;
    if parsed.is_finite() && parsed >= 0.0 {
        Ok(parsed)
    } else {
        Err(format!("{} must be a non-negative number", what))
    }
}

fn parse_region(value: &str) -> Result<DisplayRect, String> {
    let parts: Vec<&str> = value.split(',').collect();
    let [x, y, w, h] = parts.as_slice() else {
        return Err("expected x,y,width,height".to_string());
    };
    Ok(DisplayRect::new(
        parse_positive(x, "x")?,
        parse_positive(y, "y")?,
        parse_positive(w, "width")?,
        parse_positive(h, "height")?,
    ))
}

fn parse_display_size(value: &str) -> Result<DisplaySize, String> {
    let (w, h) = value
        .split_once(['x', 'X'])
        .ok_or_else(|| "expected WIDTHxHEIGHT".to_string())?;
    let size = DisplaySize {
        width: parse_positive(w, "width")?,
        height: parse_positive(h, "height")?,
    };
    if size.width == 0.0 || size.height == 0.0 {
        return Err("display size must be non-zero".to_string());
    }
    Ok(size)
}

fn settings_path(cli: &Cli) -> Result<PathBuf> {
    match &cli.settings {
        Some(path) => Ok(path.clone()),
        None => Settings::default_path(),
    }
}

async fn open_assembler(cli: &Cli, settings_path: &Path) -> Result<ConversationAssembler> {
    let settings = Settings::load(settings_path)?;

    let db_path = match &cli.database {
        Some(path) => path.clone(),
        None => dirs::data_local_dir()
            .context("Failed to resolve the platform data directory")?
            .join("screenai")
            .join(DB_FILE_NAME),
    };
    let store = SqliteStore::open(&db_path).await?;
    Ok(ConversationAssembler::new(AppState::new(Arc::new(store), settings)))
}

pub async fn run(cli: Cli) -> Result<()> {
    let settings_path = settings_path(&cli)?;
    let assembler = open_assembler(&cli, &settings_path).await?;

    match cli.command {
        Command::New { provider, project } => {
            let conversation = commands::create_conversation(&assembler, provider, project)
                .await
                .map_err(anyhow::Error::msg)?;
            println!("{}", conversation.id);
        }
        Command::List => {
            let conversations = commands::list_conversations(&assembler)
                .await
                .map_err(anyhow::Error::msg)?;
            for conversation in &conversations {
                println!("{}", summary_line(conversation));
            }
        }
        Command::Show { id } => {
            let conversation = commands::get_conversation(&assembler, id)
                .await
                .map_err(anyhow::Error::msg)?;
            print_conversation(&conversation);
        }
        Command::Delete { id } => {
            commands::delete_conversation(&assembler, id)
                .await
                .map_err(anyhow::Error::msg)?;
            println!("Deleted {}", id);
        }
        Command::Send {
            conversation,
            provider,
            image,
            region,
            display,
            annotations,
            text,
        } => {
            let screenshot = match image {
                Some(path) => {
                    let request = CaptureRequest {
                        region,
                        display_size: display.map(|d| (d.width, d.height)),
                        annotations: match annotations {
                            Some(path) => commands::load_annotations(&path)?,
                            None => Vec::new(),
                        },
                    };
                    Some(commands::capture_screenshot(commands::load_image_file(&path)?, &request)?)
                }
                None => None,
            };
            let outgoing = OutgoingMessage::new(text.join(" "), screenshot);
            send_and_stream(&assembler, conversation, provider, outgoing).await?;
        }
        Command::Key {
            action: KeyCommand::Set { provider, key },
        } => {
            let key = match key {
                Some(key) => key,
                None => read_key_from_stdin()?,
            };
            store_api_key(&settings_path, provider, &key)?;
            println!("Stored API key for {}", provider);
        }
    }
    Ok(())
}

fn read_key_from_stdin() -> Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read API key from standard input")?;
    Ok(line)
}

/// Saves `key` to the keyring and switches the provider's settings over to it.
fn store_api_key(settings_path: &Path, provider: ProviderId, key: &str) -> Result<()> {
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("API key for {} is empty", provider);
    }
    config::set_api_key_in_keyring(provider, key)?;
    let mut settings = Settings::load(settings_path)?;
    settings.use_keyring_key(provider);
    settings.save(settings_path)
}

async fn send_and_stream(
    assembler: &ConversationAssembler,
    conversation: Option<Uuid>,
    provider: Option<ProviderId>,
    outgoing: OutgoingMessage,
) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = rx.recv().await {
            match event {
                TurnEvent::UserMessageStored { conversation_id, .. } => {
                    log::info!("Message stored in conversation {}", conversation_id);
                }
                TurnEvent::Chunk { delta, .. } => {
                    let _ = write!(stdout, "{}", delta);
                    let _ = stdout.flush();
                }
                TurnEvent::Finished { .. } => {
                    let _ = writeln!(stdout);
                }
                TurnEvent::Failed { .. } => {}
            }
        }
    });

    let outcome = commands::send_message(assembler, conversation, provider, outgoing, Some(tx))
        .await
        .map_err(anyhow::Error::msg)?;
    printer.await.context("Output task failed")?;

    match outcome.status {
        TurnStatus::Completed => {
            eprintln!("conversation: {}", outcome.conversation.id);
            Ok(())
        }
        TurnStatus::NotConfigured | TurnStatus::Failed => {
            anyhow::bail!("{} (conversation {})", outcome.reply.text, outcome.conversation.id)
        }
    }
}

fn summary_line(conversation: &Conversation) -> String {
    format!(
        "{}  {}  {}/{}  {}",
        conversation.id,
        conversation.updated_at.format("%Y-%m-%d %H:%M"),
        conversation.provider,
        conversation.model,
        conversation.display_title()
    )
}

fn print_conversation(conversation: &Conversation) {
    println!("{}", summary_line(conversation));
    for message in &conversation.messages {
        let speaker = match message.role {
            Role::User => "you".to_string(),
            Role::Assistant => message
                .model_used
                .clone()
                .unwrap_or_else(|| "assistant".to_string()),
        };
        println!();
        println!("[{}] {}", speaker, message.timestamp.format("%H:%M:%S"));
        if let Some(shot) = &message.screenshot {
            println!("(screenshot, {} annotation(s))", shot.shapes.len());
        }
        if !message.text.is_empty() {
            println!("{}", message.text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_region_and_display_size() {
        assert_eq!(
            parse_region("10,20,300,150").unwrap(),
            DisplayRect::new(10.0, 20.0, 300.0, 150.0)
        );
        assert!(parse_region("10,20,300").is_err());
        assert!(parse_region("a,b,c,d").is_err());

        assert_eq!(
            parse_display_size("1440x900").unwrap(),
            DisplaySize {
                width: 1440.0,
                height: 900.0
            }
        );
        assert!(parse_display_size("0x900").is_err());
        assert!(parse_display_size("1440").is_err());
    }

    #[test]
    fn send_arguments_parse() {
        let cli = Cli::try_parse_from([
            "screenai",
            "send",
            "--provider",
            "openrouter",
            "--image",
            "shot.png",
            "--region",
            "0,0,200,150",
            "What",
            "is",
            "this?",
        ])
        .unwrap();
        match cli.command {
            Command::Send {
                provider, region, text, ..
            } => {
                assert_eq!(provider, Some(ProviderId::OpenRouter));
                assert_eq!(region, Some(DisplayRect::new(0.0, 0.0, 200.0, 150.0)));
                assert_eq!(text.join(" "), "What is this?");
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert!(Cli::try_parse_from(["screenai", "send", "--region", "0,0,200,150", "hi"]).is_err());
    }

    #[test]
    fn key_set_arguments_parse() {
        let cli = Cli::try_parse_from(["screenai", "key", "set", "gemini", "g-123"]).unwrap();
        match cli.command {
            Command::Key {
                action: KeyCommand::Set { provider, key },
            } => {
                assert_eq!(provider, ProviderId::Gemini);
                assert_eq!(key.as_deref(), Some("g-123"));
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["screenai", "key", "set", "nobody"]).is_err());
    }

    #[test]
    fn blank_key_is_rejected_before_touching_the_keyring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let err = store_api_key(&path, ProviderId::OpenAi, "   \n").unwrap_err();
        assert!(err.to_string().contains("empty"));
        assert!(!path.exists());
    }
}
