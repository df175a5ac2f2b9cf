use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeaError {
    #[error("No active Kea servers configured")]
    NoActiveServers,

    #[error("Failed to build Kea HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Kea API error on {server}: {source}")]
    Transport {
        server: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Kea API on {server} answered HTTP {status}")]
    Http { server: String, status: u16 },

    #[error("Malformed Kea response: {0}")]
    Protocol(String),

    #[error("Kea command '{command}' failed: {text}")]
    Command { command: String, text: String },

    #[error("Kea command '{command}' is not supported: {text}")]
    Unsupported { command: String, text: String },
}
