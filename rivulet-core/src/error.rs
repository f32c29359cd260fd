use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Closed Pool Error - {0}")]
    ClosedPool(String),

    #[error("Worker Fatal Error - {0}")]
    WorkerFatal(String),

    #[error("Recovery Error - {0}")]
    Recovery(String),

    #[error("Changelog Error - {0}")]
    Changelog(String),

    #[error("Store Error - {0}")]
    Store(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Topology Error - {0}")]
    Topology(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),
}
