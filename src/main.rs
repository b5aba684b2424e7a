//! Adelie: command-line access to the client resilience layer
//!
//! Replays captured chat streams, talks to the live chat endpoint, edits the
//! session summary cache and sends telemetry events.

use adelie::clock::SystemClock;
use adelie::config::{Config, load_config};
use adelie::storage::{FileStore, KeyValueStore, MemoryStore};
use adelie::stream::client::{ChatClient, ChatRequest};
use adelie::stream::relay::StreamEnd;
use adelie::stream::{ChatEvent, LineBuffer, Utf8Decoder, decode_frame};
use adelie::summary::{CardFallbacks, SessionCardPatch, SessionSummaryStore, build_session_card_meta};
use adelie::telemetry::{HttpTransport, Identity, QueueLimits, Telemetry};
use clap::Parser;
use serde_json::{Map, Value};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "adelie", about = "Adelie client resilience toolkit")]
struct Cli {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Decode a captured chat stream into frames (reads stdin without a file)
    Decode {
        file: Option<PathBuf>,
        /// Feed the input in chunks of this many bytes
        #[arg(long, default_value_t = 4096)]
        chunk_size: usize,
        /// Print interpreted events instead of raw frames
        #[arg(long)]
        events: bool,
    },
    /// Ask the tutor and print the streamed answer
    Chat {
        message: String,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long, default_value = "beginner")]
        difficulty: String,
        /// Bearer token for authenticated sessions
        #[arg(long)]
        token: Option<String>,
    },
    /// Read or update cached session summaries
    Meta {
        #[command(subcommand)]
        action: MetaAction,
    },
    /// Send one telemetry event and flush it
    Track {
        event_type: String,
        /// Event data as a JSON object
        #[arg(long)]
        data: Option<String>,
        /// Route path to attribute the event to
        #[arg(long, default_value = "/")]
        page: String,
    },
    /// Print the effective configuration
    Config,
}

#[derive(clap::Subcommand)]
enum MetaAction {
    /// Print the stored summary for a session
    Get { session_id: String },
    /// Merge fields into a session's summary
    Set {
        session_id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        snippet: Option<String>,
        #[arg(long)]
        icon: Option<String>,
        /// Keyword to add (repeatable)
        #[arg(long = "keyword")]
        keywords: Vec<String>,
        /// Derive fields from a session's step content JSON first
        #[arg(long)]
        step_content: Option<String>,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_env("ADELIE_LOG").unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Command::Decode {
            file,
            chunk_size,
            events,
        } => decode(file.as_deref(), chunk_size, events),
        Command::Meta { action } => meta(action),
        Command::Config => print_json(&load_config()),
        Command::Chat {
            message,
            session_id,
            difficulty,
            token,
        } => block_on(chat(message, session_id, difficulty, token)),
        Command::Track {
            event_type,
            data,
            page,
        } => block_on(track(event_type, data, page)),
    };

    if let Err(e) = result {
        eprintln!("adelie: {e}");
        std::process::exit(1);
    }
}

fn block_on<F>(future: F) -> adelie::Result<()>
where
    F: std::future::Future<Output = adelie::Result<()>>,
{
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(future)
}

fn print_json<T: serde::Serialize>(value: &T) -> adelie::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_store() -> adelie::Result<FileStore> {
    FileStore::open_default()
        .ok_or_else(|| adelie::Error::Storage("no data directory on this platform".into()))
}

fn decode(file: Option<&Path>, chunk_size: usize, events: bool) -> adelie::Result<()> {
    let mut raw = Vec::new();
    match file {
        Some(path) => raw = std::fs::read(path)?,
        None => {
            std::io::stdin().read_to_end(&mut raw)?;
        }
    }

    let mut decoder = Utf8Decoder::new();
    let mut lines = LineBuffer::new();
    let mut stdout = std::io::stdout().lock();
    let mut frames = 0usize;
    let mut total_lines = 0usize;

    for chunk in raw.chunks(chunk_size.max(1)) {
        for line in lines.feed(&decoder.decode(chunk)) {
            total_lines += 1;
            let Some(frame) = decode_frame(&line) else {
                continue;
            };
            frames += 1;
            if events {
                writeln!(stdout, "{:?}", ChatEvent::from_frame(&frame))?;
            } else {
                writeln!(stdout, "{frame}")?;
            }
        }
    }

    // Whatever is left never saw a newline, matching a closed connection.
    let dropped_tail = lines.finish().is_some();
    info!(lines = total_lines, frames, dropped_tail, "decoded stream");
    Ok(())
}

async fn chat(
    message: String,
    session_id: Option<String>,
    difficulty: String,
    token: Option<String>,
) -> adelie::Result<()> {
    let config = load_config();
    let mut client = ChatClient::new(config.chat_url());
    if let Some(token) = token {
        client = client.with_bearer_token(token);
    }

    let mut request = ChatRequest::new(message);
    request.session_id = session_id;
    request.difficulty = difficulty;

    let mut stream = client.open(&request).await?;
    let mut stdout = std::io::stdout();
    while let Some((event, _)) = stream.next_event().await {
        match event {
            ChatEvent::Content { text } => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            ChatEvent::Error { message } => eprintln!("\nadelie: server error: {message}"),
            ChatEvent::Done { total_tokens, .. } => {
                debug!(?total_tokens, "chat done");
                break;
            }
            other => debug!(event = ?other, "chat event"),
        }
    }
    writeln!(stdout)?;
    if let Some(id) = stream.session_id() {
        eprintln!("adelie: session {id}");
    }

    if let Some(summary) = stream.finish().await {
        if let StreamEnd::Failed(reason) = &summary.end {
            eprintln!("adelie: stream ended early: {reason}");
        }
    }
    Ok(())
}

fn meta(action: MetaAction) -> adelie::Result<()> {
    let summaries = SessionSummaryStore::new(Arc::new(open_store()?), Arc::new(SystemClock));

    match action {
        MetaAction::Get { session_id } => match summaries.read(&session_id) {
            Some(meta) => print_json(&meta),
            None => {
                eprintln!("adelie: no summary for {session_id}");
                Ok(())
            }
        },
        MetaAction::Set {
            session_id,
            title,
            snippet,
            icon,
            keywords,
            step_content,
        } => {
            let mut patch = match step_content.as_deref() {
                Some(content) => build_session_card_meta(Some(content), &CardFallbacks::default()),
                None => SessionCardPatch::default(),
            };
            patch.title = title.or(patch.title);
            patch.snippet = snippet.or(patch.snippet);
            patch.icon_key = icon.or(patch.icon_key);
            if !keywords.is_empty() {
                let mut merged = patch.keywords.unwrap_or_default();
                merged.extend(keywords);
                patch.keywords = Some(merged);
            }

            match summaries.write(&session_id, patch) {
                Some(meta) => print_json(&meta),
                None => Err(adelie::Error::InvalidInput(
                    "session id must not be empty".into(),
                )),
            }
        }
    }
}

async fn track(event_type: String, data: Option<String>, page: String) -> adelie::Result<()> {
    let config: Config = load_config();
    let data = parse_event_data(data.as_deref())?;

    let durable: Arc<dyn KeyValueStore> = Arc::new(open_store()?);
    let identity = Identity::new(durable, Arc::new(MemoryStore::new()));
    let transport = HttpTransport::new(config.telemetry_url(), config.telemetry.request_timeout())?;
    let telemetry = Telemetry::new(
        QueueLimits::from(&config.telemetry),
        Arc::new(transport),
        Arc::new(SystemClock),
        identity,
    );

    telemetry.set_page(&page);
    telemetry.track(&event_type, data);
    let outcome = telemetry.flush().await;
    println!("{outcome:?}");
    Ok(())
}

/// Parse `--data` into the event's field map.
fn parse_event_data(raw: Option<&str>) -> adelie::Result<Map<String, Value>> {
    let Some(raw) = raw else {
        return Ok(Map::new());
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(adelie::Error::InvalidInput(
            "--data must be a JSON object".into(),
        )),
        Err(e) => Err(adelie::Error::InvalidInput(format!("--data is not JSON: {e}"))),
    }
}
