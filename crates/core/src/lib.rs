pub mod agents;
pub mod chunking;
pub mod embeddings;
pub mod error;
pub mod index;
pub mod llm;
pub mod loader;
pub mod models;
pub mod runner;
pub mod stores;
pub mod traits;

pub use agents::{initiate_chat, physics_lesson, AgentMessage, ConversableAgent, ConversationResult};
pub use chunking::{build_chunks, clean_text, split_sentences, ChunkingStrategy};
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, OpenAiEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{HistoryError, IndexError, LoadError, RunError, ServiceError};
pub use index::{DocumentIndex, InMemoryIndex};
pub use llm::{AnthropicChatModel, ModelSettings, OllamaChatModel, OpenAiChatModel};
pub use loader::{discover_documents, load, load_folder, read_document, FolderLoad, SkippedDocument};
pub use models::{
    ChatMessage, ChatTurn, Chunk, Document, DocumentFormat, IndexOptions, Role, ScoredChunk,
};
pub use runner::{Answerer, ChatSession, QueryEngine, GREETING, NO_ANSWER};
pub use stores::{InMemoryHistory, Neo4jChatHistory};
pub use traits::{ChatHistory, ChatModel, Retriever};
