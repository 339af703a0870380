use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Schedule Error - {0}")]
    Schedule(String),

    #[error("Connection Error - {0}")]
    Connection(String),

    #[error("Output Error - {0}")]
    Output(String),

    #[error("MarkLogic Error - {0}")]
    MarkLogic(#[from] marklogic_client::Error),

    #[error("Query Error - {0}")]
    Query(#[from] numaflow_marklogic::Error),
}
