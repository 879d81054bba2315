use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use rainbow_agent::attachment::DirectoryStore;
use rainbow_agent::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};
use rainbow_agent::{
    AgentContext, Attachment, AttachmentKind, ModelGateway, Orchestrator, TurnRequest,
    TurnResponse,
};
use rainbow_core::config::AgentConfig;
use rainbow_core::RainbowConfig;
use rainbow_eventlog::{EventLog, JsonFileSink};
use rainbow_store::{KvStore, SqliteKvStore};

#[derive(Parser)]
#[command(name = "rainbow")]
#[command(about = "Rainbow City assistant: tool-calling chat with replayable session logs", long_about = None)]
struct Cli {
    /// Config file (defaults to $RAINBOW_CONFIG, then ~/.rainbow/rainbow.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message and print the reply
    Chat {
        text: String,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(long)]
        ai: Option<String>,
        /// Image URL, data URI, base64 text or local file
        #[arg(long)]
        image: Option<String>,
        /// Local file to attach (document, audio, video, image)
        #[arg(long, conflicts_with = "image")]
        file: Option<PathBuf>,
    },
    /// Interactive conversation on one session (/clear, /exit)
    Repl {
        #[arg(long)]
        session: Option<String>,
    },
    /// Print the newest persisted log of a session
    Logs { session_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rainbow=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // explicit flag > RAINBOW_CONFIG env > ~/.rainbow/rainbow.toml
    let config_path = cli.config.or_else(|| std::env::var("RAINBOW_CONFIG").ok());
    let config = RainbowConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        let mut config = RainbowConfig::default();
        config.apply_env_fallbacks(|name| std::env::var(name).ok());
        config
    });

    match cli.command {
        Commands::Chat {
            text,
            session,
            user,
            ai,
            image,
            file,
        } => {
            let orchestrator = build_orchestrator(&config);
            let mut req = TurnRequest {
                user_input: text,
                session_id: session,
                user_id: user,
                ai_id: ai,
                ..TurnRequest::default()
            };

            let attachment = match (image, file) {
                (Some(image), _) if Path::new(&image).is_file() => Some(
                    Attachment::builder()
                        .path(&image)
                        .kind(AttachmentKind::Image)
                        .build()?,
                ),
                (Some(image), _) => {
                    req.image_data = Some(image);
                    None
                }
                (None, Some(path)) => Some(upload_file(&orchestrator, &path)?),
                (None, None) => None,
            };

            let reply = match attachment {
                Some(a) => orchestrator.process_turn_with(req, Some(a)).await?,
                None => orchestrator.process_turn(req).await?,
            };
            print_reply(&reply);
        }
        Commands::Repl { session } => {
            let orchestrator = build_orchestrator(&config);
            repl(&orchestrator, session).await?;
        }
        Commands::Logs { session_id } => {
            let sink = JsonFileSink::new(&config.storage.log_dir);
            let Some(path) = sink.latest_for(&session_id)? else {
                anyhow::bail!(
                    "no persisted log for session {session_id} in {}",
                    config.storage.log_dir
                );
            };
            let entries = JsonFileSink::read(&path)?;
            println!("# {}", path.display());
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
    }

    Ok(())
}

fn build_orchestrator(config: &RainbowConfig) -> Orchestrator {
    let uploads = Arc::new(
        DirectoryStore::new(&config.storage.upload_dir)
            .with_probe_roots(config.storage.probe_roots.iter().map(PathBuf::from)),
    );
    let tools = rainbow_agent::tools::build_registry(&config.tools.weather, uploads.clone());
    let events = EventLog::new(JsonFileSink::new(&config.storage.log_dir));

    let (provider, agent) = build_provider(config);
    Orchestrator::new(AgentContext {
        gateway: ModelGateway::new(provider, &agent),
        tools: Arc::new(tools),
        events: Arc::new(events),
        store: open_store(&config.storage.db_path),
        attachments: Some(uploads),
        system_prompt: config.agent.system_prompt.clone(),
    })
}

/// Anthropic when configured, otherwise OpenAI, otherwise a provider that
/// explains what is missing. The agent settings come back with the model
/// names the chosen provider understands.
fn build_provider(config: &RainbowConfig) -> (Arc<dyn LlmProvider>, AgentConfig) {
    if let Some(ref anthropic) = config.providers.anthropic {
        info!(model = %anthropic.model, "LLM provider: Anthropic ({})", anthropic.base_url);
        let provider: Arc<dyn LlmProvider> = Arc::new(rainbow_agent::AnthropicProvider::new(
            anthropic.api_key.clone(),
            Some(anthropic.base_url.clone()),
        ));
        return (provider, config.agent.routed_to(&anthropic.model));
    }
    if let Some(ref openai) = config.providers.openai {
        let mut agent = config.agent.clone();
        if let Some(ref model) = openai.model {
            agent.model = model.clone();
        }
        info!(model = %agent.model, "LLM provider: OpenAI ({})", openai.base_url);
        let provider: Arc<dyn LlmProvider> = Arc::new(rainbow_agent::OpenAiProvider::new(
            openai.api_key.clone(),
            Some(openai.base_url.clone()),
        ));
        return (provider, agent);
    }
    warn!("no LLM provider configured; replies will explain the missing key");
    (Arc::new(NullProvider), config.agent.clone())
}

/// Session bookkeeping is optional: a database that cannot be opened only
/// disables it.
fn open_store(db_path: &str) -> Option<Arc<dyn KvStore>> {
    ensure_parent_dir(db_path);
    let opened = rusqlite::Connection::open(db_path)
        .map_err(rainbow_store::StoreError::from)
        .and_then(|conn| {
            rainbow_store::db::init_db(&conn)?;
            Ok(conn)
        });
    match opened {
        Ok(conn) => {
            info!(path = %db_path, "session store ready");
            Some(Arc::new(SqliteKvStore::new(conn)))
        }
        Err(e) => {
            warn!(path = %db_path, error = %e, "session store unavailable");
            None
        }
    }
}

fn upload_file(orchestrator: &Orchestrator, path: &Path) -> Result<Attachment> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    let media_type = mime_guess::from_path(path).first_or_octet_stream();
    Ok(orchestrator.upload(bytes, &filename, media_type.essence_str()))
}

async fn repl(orchestrator: &Orchestrator, session: Option<String>) -> Result<()> {
    let mut session = session;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("rainbow repl, /clear resets the session, /exit quits");

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                if let Some(id) = session.take() {
                    orchestrator.clear_session(&id);
                    eprintln!("session {id} cleared");
                }
                continue;
            }
            _ => {}
        }

        let req = TurnRequest {
            user_input: line.to_string(),
            session_id: session.clone(),
            ..TurnRequest::default()
        };
        match orchestrator.process_turn(req).await {
            Ok(reply) => {
                session = Some(reply.session_id.clone());
                print_reply(&reply);
            }
            Err(e) => eprintln!("error: {e}"),
        }
    }
    Ok(())
}

fn print_reply(reply: &TurnResponse) {
    for result in &reply.tool_results {
        eprintln!("[{}] {}", result.tool_name, result.result);
    }
    println!("{}", reply.response);
    eprintln!(
        "(session {}, log {})",
        reply.session_id,
        if reply.log_file.is_empty() {
            "not written"
        } else {
            &reply.log_file
        }
    );
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}

/// Placeholder provider when no API key is available.
struct NullProvider;

#[async_trait::async_trait]
impl LlmProvider for NullProvider {
    fn name(&self) -> &str {
        "null"
    }

    async fn send(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        Err(ProviderError::Unavailable(
            "no LLM provider configured, set OPENAI_API_KEY or providers.openai.api_key in rainbow.toml".into(),
        ))
    }
}
