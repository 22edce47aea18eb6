use crate::models::{ChatMessage, ChatTurn, ScoredChunk};
use crate::traits::{ChatHistory, ChatModel, Retriever};
use crate::{IndexError, RunError, ServiceError};
use tracing::{debug, info};

pub const KNOWLEDGE_BASE_PROMPT: &str = "You are a helpful assistant that can only reference material from a knowledge base.
You do not like using any of your general knowledge.
You may only use information prefixed by \"Explicit knowledge base:\"
If the question cannot be answered only using information from the knowledge base, say instead \"I'm sorry I cannot answer that.\"
Start every answer with a justification of whether their question can be answered from the explicit knowledge base provided.";

pub const SIMPLE_SYSTEM_PROMPT: &str = "You are a chatbot having a conversation with a human.";

pub const CONTEXT_SYSTEM_PROMPT: &str = "You are a helpful assistant that can only reference material from a knowledge base.
You do not like using any of your general knowledge.
You may only use information provided in the context.
If the question cannot be answered only using information from context, say instead \"I'm sorry I cannot answer that.\"
Context: {context}";

pub const GREETING: &str = "How can I help you today?";

/// Returned instead of calling the model when retrieval found nothing.
pub const NO_ANSWER: &str = "I'm sorry I cannot answer that.";

pub fn format_context(chunks: &[ScoredChunk]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(rank, hit)| format!("[{}] {}", rank + 1, hit.chunk.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Sends a question plus retrieved chunks to the model in a single call.
pub struct Answerer<M> {
    model: M,
}

impl<M> Answerer<M>
where
    M: ChatModel + Send + Sync,
{
    pub fn new(model: M) -> Self {
        Self { model }
    }

    pub async fn complete(&self, question: &str, chunks: &[ScoredChunk]) -> Result<String, ServiceError> {
        if chunks.is_empty() {
            debug!("no chunks retrieved, skipping model call");
            return Ok(NO_ANSWER.to_string());
        }

        let messages = [
            ChatMessage::system(KNOWLEDGE_BASE_PROMPT),
            ChatMessage::user(format!(
                "{question}. Explicit knowledge base:\n{}",
                format_context(chunks)
            )),
        ];
        self.model.complete(&messages).await
    }
}

/// Retrieve-then-answer over a fixed number of chunks.
pub struct QueryEngine<R, M> {
    retriever: R,
    answerer: Answerer<M>,
    top_k: usize,
}

impl<R, M> QueryEngine<R, M>
where
    R: Retriever + Send + Sync,
    M: ChatModel + Send + Sync,
{
    pub fn new(retriever: R, model: M, top_k: usize) -> Self {
        Self {
            retriever,
            answerer: Answerer::new(model),
            top_k,
        }
    }

    pub fn retriever(&self) -> &R {
        &self.retriever
    }

    pub async fn answer(&self, question: &str) -> Result<String, RunError> {
        let chunks = self.retriever.retrieve(question, self.top_k).await?;
        info!(retrieved = chunks.len(), top_k = self.top_k, "answering question");
        Ok(self.answerer.complete(question, &chunks).await?)
    }
}

/// A multi-turn conversation whose turns are stored in a `ChatHistory`.
pub struct ChatSession<M, H> {
    model: M,
    history: H,
    session_id: String,
    system_prompt: String,
    question_template: Option<String>,
}

impl<M, H> ChatSession<M, H>
where
    M: ChatModel + Send + Sync,
    H: ChatHistory + Send + Sync,
{
    pub fn new(model: M, history: H, session_id: impl Into<String>) -> Self {
        Self {
            model,
            history,
            session_id: session_id.into(),
            system_prompt: SIMPLE_SYSTEM_PROMPT.to_string(),
            question_template: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Wraps each question sent to the model; `{question}` is substituted.
    /// History keeps the question as typed.
    pub fn with_question_template(mut self, template: impl Into<String>) -> Self {
        self.question_template = Some(template.into());
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Seeds an empty session with the assistant greeting.
    pub async fn greet(&self) -> Result<(), RunError> {
        if self.history.messages(&self.session_id).await?.is_empty() {
            self.history
                .add_messages(&self.session_id, &[ChatMessage::assistant(GREETING)])
                .await?;
        }
        Ok(())
    }

    pub async fn history(&self) -> Result<Vec<ChatTurn>, RunError> {
        Ok(self.history.messages(&self.session_id).await?)
    }

    pub async fn run(&self, question: &str) -> Result<String, RunError> {
        let system = self.system_prompt.clone();
        self.exchange(system, question).await
    }

    /// Answers with the top `max_documents` chunks placed in the system prompt.
    pub async fn run_with_context<R>(
        &self,
        question: &str,
        retriever: &R,
        max_documents: usize,
    ) -> Result<String, RunError>
    where
        R: Retriever + Send + Sync,
    {
        let chunks = retriever.retrieve(question, max_documents).await?;
        if chunks.is_empty() {
            self.record(question, NO_ANSWER).await?;
            return Ok(NO_ANSWER.to_string());
        }

        let system = CONTEXT_SYSTEM_PROMPT.replace("{context}", &format_context(&chunks));
        self.exchange(system, question).await
    }

    async fn exchange(&self, system: String, question: &str) -> Result<String, RunError> {
        let past = self.history.messages(&self.session_id).await?;

        let mut messages = Vec::with_capacity(past.len() + 2);
        messages.push(ChatMessage::system(system));
        messages.extend(past.iter().map(ChatTurn::to_message));
        messages.push(ChatMessage::user(self.frame(question)));

        let answer = self.model.complete(&messages).await?;
        self.record(question, &answer).await?;
        debug!(
            session_id = %self.session_id,
            history = past.len(),
            model = self.model.model_name(),
            "chat exchange complete"
        );
        Ok(answer)
    }

    async fn record(&self, question: &str, answer: &str) -> Result<(), RunError> {
        self.history
            .add_messages(
                &self.session_id,
                &[ChatMessage::user(question), ChatMessage::assistant(answer)],
            )
            .await?;
        Ok(())
    }

    fn frame(&self, question: &str) -> String {
        match &self.question_template {
            Some(template) => template.replace("{question}", question),
            None => question.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::index::DocumentIndex;
    use crate::models::{Chunk, IndexOptions, Role};
    use crate::stores::InMemoryHistory;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingModel {
        reply: String,
        calls: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl RecordingModel {
        fn replying(reply: &str) -> Self {
            Self {
                reply: reply.to_string(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Vec<ChatMessage>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl<'a> ChatModel for &'a RecordingModel {
        fn model_name(&self) -> &str {
            "recording"
        }

        async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ServiceError> {
            self.calls.lock().unwrap().push(messages.to_vec());
            Ok(self.reply.clone())
        }
    }

    struct FailingModel;

    #[async_trait]
    impl ChatModel for FailingModel {
        fn model_name(&self) -> &str {
            "failing"
        }

        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String, ServiceError> {
            Err(ServiceError::BackendResponse {
                backend: "openai".to_string(),
                details: "429 Too Many Requests".to_string(),
            })
        }
    }

    struct FixedRetriever {
        hits: Vec<ScoredChunk>,
    }

    #[async_trait]
    impl Retriever for FixedRetriever {
        async fn retrieve(&self, _question: &str, k: usize) -> Result<Vec<ScoredChunk>, IndexError> {
            Ok(self.hits.iter().take(k).cloned().collect())
        }
    }

    fn hit(text: &str) -> ScoredChunk {
        ScoredChunk {
            chunk: Chunk {
                chunk_id: text.to_string(),
                source: "report.txt".to_string(),
                position: 0,
                text: text.to_string(),
            },
            distance: 0.1,
        }
    }

    #[tokio::test]
    async fn answerer_embeds_chunks_in_user_message() {
        let model = RecordingModel::replying("The sector lacks staff.");
        let answerer = Answerer::new(&model);

        let answer = answerer
            .complete("What are the challenges", &[hit("Staff shortages."), hit("Low wages.")])
            .await
            .unwrap();

        assert_eq!(answer, "The sector lacks staff.");
        let calls = model.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0].role, Role::System);
        assert_eq!(calls[0][0].content, KNOWLEDGE_BASE_PROMPT);
        assert!(calls[0][1]
            .content
            .starts_with("What are the challenges. Explicit knowledge base:"));
        assert!(calls[0][1].content.contains("[2] Low wages."));
    }

    #[tokio::test]
    async fn empty_retrieval_yields_defined_answer_without_model_call() {
        let model = RecordingModel::replying("unused");
        let index = DocumentIndex::new(CharacterNgramEmbedder::default(), IndexOptions::default()).unwrap();
        let engine = QueryEngine::new(index, &model, 3);

        let answer = engine.answer("Anything?").await.unwrap();
        assert_eq!(answer, NO_ANSWER);
        assert!(model.calls().is_empty());
    }

    #[tokio::test]
    async fn engine_limits_retrieval_to_top_k() {
        let model = RecordingModel::replying("ok");
        let retriever = FixedRetriever {
            hits: vec![hit("one"), hit("two"), hit("three")],
        };
        let engine = QueryEngine::new(retriever, &model, 2);

        engine.answer("count").await.unwrap();
        let calls = model.calls();
        let prompt = &calls[0][1].content;
        assert!(prompt.contains("[2] two"));
        assert!(!prompt.contains("three"));
    }

    #[tokio::test]
    async fn service_failures_surface_verbatim() {
        let retriever = FixedRetriever { hits: vec![hit("x")] };
        let engine = QueryEngine::new(retriever, FailingModel, 1);

        let error = engine.answer("q").await.unwrap_err();
        assert!(error.to_string().contains("429 Too Many Requests"));
    }

    #[tokio::test]
    async fn greeting_is_seeded_once() {
        let model = RecordingModel::replying("hi");
        let session = ChatSession::new(&model, InMemoryHistory::new(), "chat");

        session.greet().await.unwrap();
        session.greet().await.unwrap();

        let history = session.history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::Assistant);
        assert_eq!(history[0].content, GREETING);
    }

    #[tokio::test]
    async fn each_exchange_sends_history_and_records_both_turns() {
        let model = RecordingModel::replying("Sure.");
        let session = ChatSession::new(&model, InMemoryHistory::new(), "chat");
        session.greet().await.unwrap();

        session.run("First question").await.unwrap();
        session.run("Second question").await.unwrap();

        let calls = model.calls();
        assert_eq!(calls[0].len(), 3);
        assert_eq!(calls[0][0].content, SIMPLE_SYSTEM_PROMPT);
        assert_eq!(calls[0][1].content, GREETING);
        assert_eq!(calls[1].len(), 5);
        assert_eq!(calls[1][2].content, "First question");
        assert_eq!(calls[1][3].content, "Sure.");

        let history = session.history().await.unwrap();
        let roles: Vec<Role> = history.iter().map(|turn| turn.role).collect();
        assert_eq!(
            roles,
            vec![Role::Assistant, Role::User, Role::Assistant, Role::User, Role::Assistant]
        );
    }

    #[tokio::test]
    async fn question_template_frames_prompt_but_not_history() {
        let model = RecordingModel::replying("Use a record.");
        let session = ChatSession::new(&model, InMemoryHistory::new(), "session_java")
            .with_system_prompt("You are an expert programmer.")
            .with_question_template("Programming Language: java\nQuestion: {question}");

        session.run("How do I model a point?").await.unwrap();

        let calls = model.calls();
        let sent = &calls[0];
        assert_eq!(sent[0].content, "You are an expert programmer.");
        assert_eq!(
            sent[1].content,
            "Programming Language: java\nQuestion: How do I model a point?"
        );
        let history = session.history().await.unwrap();
        assert_eq!(history[0].content, "How do I model a point?");
    }

    #[tokio::test]
    async fn context_run_places_chunks_in_system_prompt() {
        let model = RecordingModel::replying("Wages are low.");
        let session = ChatSession::new(&model, InMemoryHistory::new(), "docs");
        let retriever = FixedRetriever {
            hits: vec![hit("Wages in the sector are low.")],
        };

        let answer = session.run_with_context("Wages?", &retriever, 10).await.unwrap();

        assert_eq!(answer, "Wages are low.");
        let calls = model.calls();
        let system = &calls[0][0].content;
        assert!(system.ends_with("Context: [1] Wages in the sector are low."));
    }

    #[tokio::test]
    async fn context_run_without_documents_answers_locally() {
        let model = RecordingModel::replying("unused");
        let session = ChatSession::new(&model, InMemoryHistory::new(), "docs");
        let retriever = FixedRetriever { hits: Vec::new() };

        let answer = session.run_with_context("Anything?", &retriever, 10).await.unwrap();

        assert_eq!(answer, NO_ANSWER);
        assert!(model.calls().is_empty());
        assert_eq!(session.history().await.unwrap().len(), 2);
    }
}
