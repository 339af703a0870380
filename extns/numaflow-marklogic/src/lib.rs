//! Source that queries MarkLogic and emits every matching document as a [message::FlowUnit].
//!
//! A run builds the query from the configuration ([query::QueryBuilder]), hands it to a
//! [marklogic_client::QueryBatcher], maps every delivered document ([mapper::ResultMapper]) and,
//! once the job completed, persists the highest watermark seen ([state::StateStore]) so that the
//! next run only picks up newer documents.

/// Query source configuration.
pub mod config;

/// Query construction, templating and incremental range conditions.
pub mod query;

/// State index resolution, watermark extraction and ordering.
pub mod watermark;

/// Persisted query state.
pub mod state;

/// Units and relationships emitted by a run.
pub mod message;

/// Document to flow unit mapping.
pub mod mapper;

/// The query source itself.
pub mod processor;

mod xml;

pub use config::{QueryConfig, QueryType, ReturnType, StateIndexType};
pub use message::{FlowUnit, Relationship, Routed};
pub use processor::{QueryMarkLogic, RunContext, RunOutcome};
pub use state::{InMemoryStateStore, STATE_KEY, StateStore};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Configuration Error - {0}")]
    Configuration(String),

    #[error("Retriable Error - {0}")]
    Retriable(String),

    #[error("Fatal Error - {0}")]
    Fatal(String),

    #[error("State Error - {0}")]
    State(String),

    #[error("Output Error - {0}")]
    Output(String),

    #[error("Run was cancelled")]
    Cancelled,
}

impl Error {
    /// Whether running the same query again later may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Retriable(_) | Error::State(_))
    }
}

impl From<marklogic_client::Error> for Error {
    fn from(value: marklogic_client::Error) -> Self {
        match value {
            marklogic_client::Error::InvalidConfig(message) => Error::Configuration(message),
            marklogic_client::Error::Cancelled => Error::Cancelled,
            marklogic_client::Error::Listener(message) => Error::Output(message),
            e if e.is_transient() => Error::Retriable(e.to_string()),
            e => Error::Fatal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert_eq!(
            Error::from(marklogic_client::Error::Transport("reset".to_string())),
            Error::Retriable("Transport Error - reset".to_string())
        );
        assert!(matches!(
            Error::from(marklogic_client::Error::Rejected {
                status: 400,
                message: "SEARCH-BADQUERY".to_string()
            }),
            Error::Fatal(_)
        ));
        assert!(matches!(
            Error::from(marklogic_client::Error::Unauthorized {
                status: 401,
                message: "Unauthorized".to_string()
            }),
            Error::Fatal(_)
        ));
        assert_eq!(
            Error::from(marklogic_client::Error::InvalidConfig("batch size".to_string())),
            Error::Configuration("batch size".to_string())
        );
        assert_eq!(
            Error::from(marklogic_client::Error::Cancelled),
            Error::Cancelled
        );
        assert!(Error::Retriable("x".to_string()).is_retriable());
        assert!(!Error::Fatal("x".to_string()).is_retriable());
    }
}
