use queryserver_core::{selector::ParseError, ResourceKey};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("resource does not exist: {0}")]
    DoesNotExist(String),

    #[error("invalid page request: {0}")]
    InvalidPage(String),

    #[error("invalid selector: {0}")]
    InvalidSelector(#[from] ParseError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not authorized to access {0}")]
    NotAuthorized(ResourceKey),

    #[error("historical summaries are not available")]
    NoHistory,

    #[error("failed to read historical summary: {0}")]
    History(#[source] anyhow::Error),

    #[error("query deadline exceeded")]
    DeadlineExceeded,

    #[error("query server is not running")]
    Unavailable,
}

impl QueryError {
    pub(crate) fn does_not_exist(key: impl std::fmt::Display) -> Self {
        Self::DoesNotExist(key.to_string())
    }
}
