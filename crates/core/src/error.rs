use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported format: {0} (only pdf and txt are supported)")]
    UnsupportedFormat(String),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("text is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("missing credential: {0}")]
    MissingCredential(String),

    #[error("malformed response from {backend}: {details}")]
    Malformed { backend: String, details: String },
}

impl ServiceError {
    /// A non-success HTTP status together with whatever body the service sent.
    pub fn status(backend: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let body = body.trim();
        let details = if body.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {body}")
        };
        Self::BackendResponse {
            backend: backend.to_string(),
            details,
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("embedding dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding count {embeddings} doesn't match chunk count {chunks}")]
    CountMismatch { chunks: usize, embeddings: usize },

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("invalid stored message: {0}")]
    InvalidMessage(String),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    History(#[from] HistoryError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn status_errors_carry_the_response_body() {
        let error = ServiceError::status(
            "neo4j",
            StatusCode::UNAUTHORIZED,
            r#"{"errors":[{"code":"Neo.ClientError.Security.Unauthorized"}]}"#,
        );
        let message = error.to_string();
        assert!(message.starts_with("invalid response from neo4j: 401 Unauthorized: "));
        assert!(message.contains("Security.Unauthorized"));
    }

    #[test]
    fn empty_bodies_report_only_the_status() {
        let error = ServiceError::status("openai", StatusCode::TOO_MANY_REQUESTS, "  ");
        assert_eq!(
            error.to_string(),
            "invalid response from openai: 429 Too Many Requests"
        );
    }
}
