use std::time::Duration;

pub mod command;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod log;
pub mod manager;
pub mod producer;
pub mod resp;
pub mod server;

pub use config::Config;
pub use connection::Connection;
pub use consumer::Consumer;
pub use manager::Manager;
pub use producer::Producer;
pub use server::Server;

/// Identity of a logical consumer slot: a member `id` within consumer `group`.
/// At most one live Consumer may hold an Identity at a time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    pub group: String,
    pub id: String,
}

impl Identity {
    pub fn new(group: impl Into<String>, id: impl Into<String>) -> Result<Self, Error> {
        let (group, id) = (group.into(), id.into());

        if group.is_empty() || id.is_empty() {
            return Err(Error::InvalidIdentity(format!("{group}:{id}")));
        }
        Ok(Self { group, id })
    }
}

impl std::str::FromStr for Identity {
    type Err = Error;

    /// Parse an Identity of the form `group:id`.
    /// The group may not contain ':', but the id may.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((group, id)) = s.split_once(':') else {
            return Err(Error::InvalidIdentity(s.to_string()));
        };
        Self::new(group, id)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.group, self.id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("consumer {0} is already registered")]
    DuplicateIdentity(Identity),
    #[error("invalid consumer identity '{0}' (expected <group>:<id>)")]
    InvalidIdentity(String),
    #[error("{0}")]
    Binding(String),
    #[error("timed out")]
    Timeout,
    #[error("consumer session is dead: {0}")]
    SessionDead(String),
    #[error("shutting down")]
    Shutdown,
    #[error("delivery failed: {0}")]
    ProduceFailure(#[source] log::LogError),
    #[error("failed to enqueue message: {0}")]
    LocalEnqueueFailure(#[source] log::LogError),
    #[error(transparent)]
    Log(#[from] log::LogError),
}

impl Error {
    /// Code which prefixes this error when it's sent to a client as an error reply.
    pub fn code(&self) -> &'static str {
        match self {
            Error::DuplicateIdentity(_) => "DUPLICATE",
            Error::InvalidIdentity(_) | Error::Binding(_) => "ERR",
            Error::Timeout => "TIMEOUT",
            Error::SessionDead(_) => "DEAD",
            Error::Shutdown => "SHUTDOWN",
            Error::ProduceFailure(_) => "PRODUCE",
            Error::LocalEnqueueFailure(_) => "ENQUEUE",
            Error::Log(_) => "LOG",
        }
    }
}

/// Upper bound of any single blocking client operation.
/// It keeps deadline arithmetic away from `Instant` overflow.
pub const MAX_BLOCK_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
