use crate::models::{ChatMessage, ChatTurn, Role};
use crate::traits::ChatHistory;
use crate::{HistoryError, ServiceError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

const APPEND_MESSAGE: &str = r#"
    MERGE (s:Session {id: $session_id})
    WITH s
    OPTIONAL MATCH (s)-[lm:LAST_MESSAGE]->(last:Message)
    CREATE (m:Message {
        role: $role,
        content: $content,
        created_at: $created_at,
        seq: coalesce(last.seq + 1, 0)
    })
    CREATE (s)-[:LAST_MESSAGE]->(m)
    FOREACH (_ IN CASE WHEN last IS NULL THEN [] ELSE [1] END | CREATE (last)-[:NEXT]->(m))
    DELETE lm
    RETURN m.seq AS seq;
"#;

const READ_SESSION: &str = r#"
    MATCH (s:Session {id: $session_id})-[:LAST_MESSAGE]->(last:Message)
    MATCH (m:Message)-[:NEXT*0..]->(last)
    RETURN m.role AS role, m.content AS content, m.created_at AS created_at
    ORDER BY m.seq ASC;
"#;

const SESSION_CONSTRAINT: &str = "CREATE CONSTRAINT session_id IF NOT EXISTS \
     FOR (s:Session) REQUIRE s.id IS UNIQUE";

/// Chat history persisted as a linked list of `:Message` nodes hanging off a
/// `:Session` node, written through the Neo4j HTTP transaction API.
pub struct Neo4jChatHistory {
    endpoint: String,
    database: String,
    username: String,
    password: String,
    window: Option<usize>,
    client: Client,
}

impl Neo4jChatHistory {
    pub fn new(
        uri: &str,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            endpoint: http_endpoint(uri)?,
            database: database.into(),
            username: username.into(),
            password: password.into(),
            window: None,
            client: Client::new(),
        })
    }

    /// Only the most recent `window` turns are returned by `messages`.
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = Some(window);
        self
    }

    fn tx_url(&self) -> String {
        format!("{}/db/{}/tx/commit", self.endpoint, self.database)
    }

    pub async fn ensure_schema(&self) -> Result<(), ServiceError> {
        self.commit(vec![statement(SESSION_CONSTRAINT, json!({}))])
            .await?;
        info!(database = %self.database, "neo4j session constraint ensured");
        Ok(())
    }

    async fn commit(&self, statements: Vec<Value>) -> Result<Value, ServiceError> {
        let response = self
            .client
            .post(self.tx_url())
            .basic_auth(&self.username, Some(&self.password))
            .json(&json!({ "statements": statements }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::status("neo4j", status, &body));
        }

        let body: Value = response.json().await?;
        check_errors(&body)?;
        Ok(body)
    }
}

fn statement(cypher: &str, parameters: Value) -> Value {
    json!({ "statement": cypher, "parameters": parameters })
}

fn append_statements(session_id: &str, turns: &[ChatMessage], now: DateTime<Utc>) -> Vec<Value> {
    turns
        .iter()
        .map(|turn| {
            statement(
                APPEND_MESSAGE,
                json!({
                    "session_id": session_id,
                    "role": turn.role.as_str(),
                    "content": turn.content,
                    "created_at": now.to_rfc3339(),
                }),
            )
        })
        .collect()
}

/// Maps bolt/neo4j connection URIs onto the HTTP endpoint of the same host.
pub fn http_endpoint(uri: &str) -> Result<String, ServiceError> {
    let mut url = Url::parse(uri.trim())?;

    let http_target = match url.scheme() {
        "http" | "https" => None,
        "bolt" | "neo4j" => Some(("http", 7474)),
        "bolt+s" | "neo4j+s" | "bolt+ssc" | "neo4j+ssc" => Some(("https", 7473)),
        other => {
            return Err(ServiceError::Malformed {
                backend: "neo4j".to_string(),
                details: format!("unsupported uri scheme {other}"),
            })
        }
    };

    if let Some((scheme, port)) = http_target {
        let host = url.host_str().unwrap_or("localhost").to_string();
        url = Url::parse(&format!("{scheme}://{host}:{port}"))?;
    }

    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn check_errors(payload: &Value) -> Result<(), ServiceError> {
    let errors = payload
        .pointer("/errors")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if errors.is_empty() {
        return Ok(());
    }

    let details = errors
        .iter()
        .map(|error| {
            format!(
                "{}: {}",
                error.pointer("/code").and_then(Value::as_str).unwrap_or("unknown"),
                error.pointer("/message").and_then(Value::as_str).unwrap_or_default()
            )
        })
        .collect::<Vec<_>>()
        .join("; ");

    Err(ServiceError::BackendResponse {
        backend: "neo4j".to_string(),
        details,
    })
}

fn extract_rows(payload: &Value) -> Vec<&Value> {
    payload
        .pointer("/results")
        .and_then(Value::as_array)
        .map(|results| {
            results
                .iter()
                .filter_map(|result| result.pointer("/data").and_then(Value::as_array))
                .flatten()
                .filter_map(|entry| entry.pointer("/row").filter(|row| row.is_array()))
                .collect()
        })
        .unwrap_or_default()
}

fn rows_to_turns(session_id: &str, payload: &Value) -> Result<Vec<ChatTurn>, HistoryError> {
    let mut turns = Vec::new();

    for row in extract_rows(payload) {
        let values = row.as_array().map(Vec::as_slice).unwrap_or_default();
        let role_name = values.first().and_then(Value::as_str).unwrap_or_default();
        let role = Role::parse(role_name)
            .ok_or_else(|| HistoryError::InvalidMessage(format!("unknown role {role_name:?}")))?;
        let content = values
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| HistoryError::InvalidMessage("message without content".to_string()))?;
        let created_at = values
            .get(2)
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|stamp| stamp.with_timezone(&Utc))
            .unwrap_or_default();

        turns.push(ChatTurn {
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            created_at,
        });
    }

    Ok(turns)
}

fn keep_latest(mut turns: Vec<ChatTurn>, window: Option<usize>) -> Vec<ChatTurn> {
    if let Some(window) = window {
        if turns.len() > window {
            turns.drain(..turns.len() - window);
        }
    }
    turns
}

#[async_trait]
impl ChatHistory for Neo4jChatHistory {
    async fn messages(&self, session_id: &str) -> Result<Vec<ChatTurn>, HistoryError> {
        let payload = self
            .commit(vec![statement(
                READ_SESSION,
                json!({ "session_id": session_id }),
            )])
            .await?;

        let turns = keep_latest(rows_to_turns(session_id, &payload)?, self.window);
        debug!(session_id, turns = turns.len(), "loaded chat history");
        Ok(turns)
    }

    async fn add_messages(&self, session_id: &str, turns: &[ChatMessage]) -> Result<(), HistoryError> {
        if turns.is_empty() {
            return Ok(());
        }

        // one transaction so a question is never stored without its answer
        self.commit(append_statements(session_id, turns, Utc::now()))
            .await?;
        debug!(session_id, appended = turns.len(), "stored chat turns");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bolt_uris_map_to_http_port() {
        assert_eq!(http_endpoint("bolt://localhost:7687").unwrap(), "http://localhost:7474");
        assert_eq!(
            http_endpoint("neo4j+s://abc.databases.neo4j.io").unwrap(),
            "https://abc.databases.neo4j.io:7473"
        );
        assert_eq!(http_endpoint("http://db:7474/").unwrap(), "http://db:7474");
        assert!(http_endpoint("ftp://db").is_err());
    }

    #[test]
    fn transaction_url_targets_database() {
        let history = Neo4jChatHistory::new("http://localhost:7474", "neo4j", "neo4j", "pw").unwrap();
        assert_eq!(history.tx_url(), "http://localhost:7474/db/neo4j/tx/commit");
    }

    #[test]
    fn each_turn_becomes_one_statement() {
        let now = Utc::now();
        let statements = append_statements(
            "session_java",
            &[ChatMessage::user("What is a record?"), ChatMessage::assistant("An immutable carrier.")],
            now,
        );

        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0]["parameters"]["role"], "user");
        assert_eq!(statements[1]["parameters"]["role"], "assistant");
        assert_eq!(statements[1]["parameters"]["session_id"], "session_java");
        assert_eq!(statements[1]["parameters"]["created_at"], now.to_rfc3339());
    }

    #[test]
    fn stored_turns_come_back_with_same_role_and_text() {
        let payload = json!({
            "results": [{
                "columns": ["role", "content", "created_at"],
                "data": [
                    { "row": ["user", "What is a record?", "2024-03-01T10:00:00+00:00"], "meta": [null, null, null] },
                    { "row": ["assistant", "An immutable carrier.", "2024-03-01T10:00:01+00:00"], "meta": [null, null, null] }
                ]
            }],
            "errors": []
        });

        let turns = rows_to_turns("session_java", &payload).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].content, "What is a record?");
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].content, "An immutable carrier.");
        assert!(turns[0].created_at < turns[1].created_at);
        assert_eq!(turns[1].session_id, "session_java");
    }

    #[test]
    fn unknown_roles_are_rejected() {
        let payload = json!({
            "results": [{ "columns": [], "data": [{ "row": ["tool", "x", null] }] }],
            "errors": []
        });
        assert!(matches!(
            rows_to_turns("s", &payload),
            Err(HistoryError::InvalidMessage(_))
        ));
    }

    #[test]
    fn errors_inside_ok_responses_surface() {
        let payload = json!({
            "results": [],
            "errors": [{ "code": "Neo.ClientError.Security.Unauthorized", "message": "bad credentials" }]
        });

        let error = check_errors(&payload).unwrap_err();
        assert!(error.to_string().contains("Unauthorized"));
        assert!(check_errors(&json!({ "results": [], "errors": [] })).is_ok());
    }

    #[test]
    fn window_keeps_most_recent_turns() {
        let turns: Vec<ChatTurn> = (0..5)
            .map(|index| ChatTurn::new("s", ChatMessage::user(index.to_string())))
            .collect();

        let kept = keep_latest(turns, Some(2));
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].content, "3");
        assert_eq!(kept[1].content, "4");
    }

    #[test]
    fn history_window_is_opt_in() {
        let history = Neo4jChatHistory::new("bolt://localhost:7687", "neo4j", "neo4j", "secret").unwrap();
        assert_eq!(history.window, None);
        assert_eq!(history.tx_url(), "http://localhost:7474/db/neo4j/tx/commit");

        let windowed = history.with_window(6);
        assert_eq!(windowed.window, Some(6));
    }
}
