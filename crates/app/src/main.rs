use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use doc_chat_core::agents::{physics_lesson, STUDENT_OPENING};
use doc_chat_core::llm::ModelSettings;
use doc_chat_core::{
    initiate_chat, load_folder, read_document, AnthropicChatModel, ChatHistory, ChatModel,
    ChatSession, ChatTurn, CharacterNgramEmbedder, ChunkingStrategy, DocumentIndex, Embedder,
    InMemoryHistory, IndexOptions, Neo4jChatHistory, OllamaChatModel, OpenAiChatModel,
    OpenAiEmbedder, QueryEngine, Role,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type DynModel = Box<dyn ChatModel + Send + Sync>;
type DynEmbedder = Box<dyn Embedder + Send + Sync>;

#[derive(Parser)]
#[command(name = "doc-chat", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Chat model back end; each demo has its own default.
    #[arg(long, value_enum, global = true)]
    provider: Option<Provider>,

    /// Override the provider's default model name.
    #[arg(long, global = true)]
    model: Option<String>,

    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, global = true)]
    openai_api_key: Option<String>,

    /// OpenAI base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com", global = true)]
    openai_url: String,

    /// Anthropic API key
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true, global = true)]
    anthropic_api_key: Option<String>,

    /// Anthropic base URL
    #[arg(long, env = "ANTHROPIC_BASE_URL", default_value = "https://api.anthropic.com", global = true)]
    anthropic_url: String,

    /// Ollama base URL
    #[arg(long, env = "OLLAMA_BASE_URL", default_value = "http://localhost:11434", global = true)]
    ollama_url: String,

    /// Embedding back end for document indexing.
    #[arg(long, value_enum, default_value = "local", global = true)]
    embedder: EmbedderKind,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Provider {
    Openai,
    Anthropic,
    Ollama,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EmbedderKind {
    /// Offline character-trigram embeddings.
    Local,
    /// OpenAI text-embedding-3-large.
    Openai,
}

#[derive(Subcommand)]
enum Command {
    /// Multi-turn chat with the assistant.
    Chat,
    /// Upload pdf/txt files and chat about their content.
    Docs {
        /// Files to index (pdf or txt).
        #[arg(long = "file", required = true)]
        files: Vec<PathBuf>,
        /// Maximum number of chunks placed in the context.
        #[arg(long, default_value = "10")]
        max_documents: usize,
    },
    /// Index a folder of pdf/txt files and answer questions from it.
    Search {
        /// Folder that contains the documents, searched recursively.
        #[arg(long, default_value = "data")]
        folder: PathBuf,
        /// Number of chunks retrieved per question.
        #[arg(long, default_value = "3")]
        top_k: usize,
    },
    /// Programming tutor whose conversation is persisted in Neo4j.
    Tutor {
        /// Language the tutor specialises in; also names the session.
        #[arg(long, default_value = "java")]
        language: String,
        /// Neo4j URI (bolt://, neo4j:// or http://)
        #[arg(long, env = "NEO4J_URI", default_value = "http://localhost:7474")]
        neo4j_uri: String,
        /// Neo4j database name
        #[arg(long, env = "NEO4J_DATABASE", default_value = "neo4j")]
        neo4j_database: String,
        /// Neo4j username
        #[arg(long, env = "NEO4J_USERNAME", default_value = "neo4j")]
        neo4j_username: String,
        /// Neo4j password
        #[arg(long, env = "NEO4J_PASSWORD", hide_env_values = true, default_value = "password")]
        neo4j_password: String,
        /// Only the most recent N stored turns are shown and sent to the model.
        #[arg(long)]
        history_window: Option<usize>,
    },
    /// Let a physics teacher and a student agent talk to each other.
    Agents {
        /// Maximum number of replies before the conversation is cut off.
        #[arg(long, default_value = "8")]
        max_turns: usize,
    },
}

const TUTOR_SYSTEM_PROMPT: &str = "You are an expert programmer in the programming language specified by the user. \
     Your task is to carefully read the user's question, and provide a clear answer with step-by-step explanation. \
     Try to give alternative implementations if possible.";

const SUGGESTED_QUESTIONS: [&str; 4] = [
    "Comment on the labour force within the home care sector",
    "What changes have been made to the labour force in the home care sector?",
    "How are providers in the home care sector coping with challenges?",
    "What are the challenges faced by providers in the home care sector?",
];

impl Cli {
    fn chat_model(&self, fallback: Provider) -> anyhow::Result<DynModel> {
        let provider = self.provider.unwrap_or(fallback);
        let model: DynModel = match provider {
            Provider::Openai => Box::new(OpenAiChatModel::new(
                &self.openai_url,
                self.openai_api_key.clone(),
                self.settings(ModelSettings::openai()),
            )?),
            Provider::Anthropic => Box::new(AnthropicChatModel::new(
                &self.anthropic_url,
                self.anthropic_api_key.clone(),
                self.settings(ModelSettings::anthropic()),
            )?),
            Provider::Ollama => Box::new(OllamaChatModel::new(
                &self.ollama_url,
                self.settings(ModelSettings::ollama()),
            )),
        };
        info!(provider = ?provider, model = model.model_name(), "chat model ready");
        Ok(model)
    }

    fn settings(&self, defaults: ModelSettings) -> ModelSettings {
        match &self.model {
            Some(model) => defaults.with_model(model),
            None => defaults,
        }
    }

    fn embedder(&self) -> anyhow::Result<DynEmbedder> {
        let embedder: DynEmbedder = match self.embedder {
            EmbedderKind::Local => Box::new(CharacterNgramEmbedder::default()),
            EmbedderKind::Openai => Box::new(OpenAiEmbedder::new(
                &self.openai_url,
                self.openai_api_key.clone(),
            )?),
        };
        info!(embedder = embedder.name(), dimensions = embedder.dimensions(), "embedder ready");
        Ok(embedder)
    }
}

struct Prompt {
    lines: Lines<BufReader<Stdin>>,
}

impl Prompt {
    fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }

    /// Next non-empty line, or `None` on end of input.
    async fn ask(&mut self, label: &str) -> anyhow::Result<Option<String>> {
        loop {
            print!("{label}");
            std::io::stdout().flush()?;
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(line.trim().to_string())),
                None => return Ok(None),
            }
        }
    }
}

fn show_turns(turns: &[ChatTurn]) {
    for turn in turns {
        let label = match turn.role {
            Role::User => "human",
            Role::Assistant => "ai",
            Role::System => "system",
        };
        println!("[{label}] {}", turn.content);
    }
}

async fn show_history<H>(history: &H, session_id: &str) -> anyhow::Result<()>
where
    H: ChatHistory + Send + Sync,
{
    let turns = history.messages(session_id).await?;
    show_turns(&turns);
    Ok(())
}

async fn run_chat(cli: &Cli) -> anyhow::Result<()> {
    let session = ChatSession::new(
        cli.chat_model(Provider::Openai)?,
        InMemoryHistory::new(),
        "chat-with-assistant",
    );
    session.greet().await?;
    println!("Lets chat - Please ask me anything");
    show_turns(&session.history().await?);

    let mut prompt = Prompt::new();
    while let Some(question) = prompt.ask("> ").await? {
        match session.run(&question).await {
            Ok(answer) => println!("[ai] {answer}"),
            Err(error) => eprintln!("error: {error}"),
        }
    }
    Ok(())
}

async fn run_docs(cli: &Cli, files: &[PathBuf], max_documents: usize) -> anyhow::Result<()> {
    let mut index = DocumentIndex::new(cli.embedder()?, IndexOptions::default())?;

    for path in files {
        println!("Processing {}...", path.display());
        let indexed = match read_document(path) {
            Ok(document) => index.add_document(&document).await.map_err(anyhow::Error::from),
            Err(error) => Err(error.into()),
        };
        match indexed {
            Ok(count) => info!(path = %path.display(), chunk_count = count, "document indexed"),
            Err(error) => eprintln!("error: {}: {error}", path.display()),
        }
    }

    if index.is_empty() {
        warn!("no chunks indexed, every answer will be the empty-result answer");
    }

    let session = ChatSession::new(
        cli.chat_model(Provider::Openai)?,
        InMemoryHistory::new(),
        "chat-with-documents",
    );
    session.greet().await?;
    println!("Query an AI using semantic search");
    show_turns(&session.history().await?);

    let mut prompt = Prompt::new();
    while let Some(question) = prompt.ask("> ").await? {
        match session.run_with_context(&question, &index, max_documents).await {
            Ok(answer) => println!("[ai] {answer}"),
            Err(error) => eprintln!("error: {error}"),
        }
    }
    Ok(())
}

async fn run_search(cli: &Cli, folder: &Path, top_k: usize) -> anyhow::Result<()> {
    let loaded = load_folder(folder)
        .with_context(|| format!("loading documents from {}", folder.display()))?;
    for skipped in &loaded.skipped {
        warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped document");
    }

    let options = IndexOptions {
        chunking: ChunkingStrategy::sentence_overlap(),
        batch_size: 128,
    };
    let mut index = DocumentIndex::new(cli.embedder()?, options)?;
    for document in &loaded.documents {
        if let Err(error) = index.add_document(document).await {
            warn!(source = %document.name, %error, "document not indexed");
        }
    }
    info!(folder = %folder.display(), chunk_count = index.len(), "index built");

    let engine = QueryEngine::new(index, cli.chat_model(Provider::Openai)?, top_k);

    println!("Suggested questions for the sample data file are:\n");
    for question in SUGGESTED_QUESTIONS {
        println!("{question}");
    }
    println!("{}\n", "-".repeat(83));

    let mut prompt = Prompt::new();
    while let Some(question) = prompt.ask("Enter your question(:q to quit): ").await? {
        if question == ":q" {
            break;
        }
        match engine.answer(&question).await {
            Ok(answer) => println!("{answer}"),
            Err(error) => eprintln!("error: {error}"),
        }
        println!("\n{}\n", "=".repeat(53));
    }
    Ok(())
}

async fn run_tutor(
    cli: &Cli,
    language: &str,
    history: Neo4jChatHistory,
) -> anyhow::Result<()> {
    history
        .ensure_schema()
        .await
        .context("connecting to neo4j")?;

    let session_id = format!("session_{language}");
    println!(
        "Hi, I am your programming assistant.\nI can help you with any {language} programming questions you have.\n"
    );
    show_history(&history, &session_id).await?;

    let session = ChatSession::new(cli.chat_model(Provider::Ollama)?, history, session_id)
        .with_system_prompt(TUTOR_SYSTEM_PROMPT)
        .with_question_template(format!(
            "Programming Language: {language}\nQuestion: {{question}}"
        ));

    let mut prompt = Prompt::new();
    while let Some(question) = prompt.ask("How can I help?: ").await? {
        println!("Generating response ... please wait");
        match session.run(&question).await {
            Ok(answer) => println!("[ai] {answer}"),
            Err(error) => eprintln!("error: {error}"),
        }
    }
    Ok(())
}

async fn run_agents(cli: &Cli, max_turns: usize) -> anyhow::Result<()> {
    let model: Arc<dyn ChatModel + Send + Sync> = Arc::from(cli.chat_model(Provider::Openai)?);
    let (student, teacher) = physics_lesson(model);

    let result = initiate_chat(&student, &teacher, STUDENT_OPENING, max_turns).await?;
    for message in &result.transcript {
        println!("{}:\n{}\n", message.speaker, message.content);
        println!("{}", "-".repeat(80));
    }
    if !result.terminated {
        info!(max_turns, "conversation reached the turn limit");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "doc-chat boot"
    );

    match &cli.command {
        Command::Chat => run_chat(&cli).await?,
        Command::Docs {
            files,
            max_documents,
        } => run_docs(&cli, files, *max_documents).await?,
        Command::Search { folder, top_k } => run_search(&cli, folder, *top_k).await?,
        Command::Tutor {
            language,
            neo4j_uri,
            neo4j_database,
            neo4j_username,
            neo4j_password,
            history_window,
        } => {
            let mut history = Neo4jChatHistory::new(
                neo4j_uri,
                neo4j_database.as_str(),
                neo4j_username.as_str(),
                neo4j_password.as_str(),
            )?;
            if let Some(window) = *history_window {
                history = history.with_window(window);
            }
            run_tutor(&cli, language, history).await?
        }
        Command::Agents { max_turns } => run_agents(&cli, *max_turns).await?,
    }

    Ok(())
}
