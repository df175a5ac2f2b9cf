use std::time::Duration;

use cin_common::{KeaConfig, KeaServerConfig};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::KeaError;
use crate::protocol::{KeaCommand, KeaResponse};

/// Result of one server's answer during a broadcast.
#[derive(Debug)]
pub struct ServerOutcome {
    pub server: String,
    pub result: Result<KeaResponse, KeaError>,
}

impl ServerOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(&self.result, Ok(resp) if resp.is_success() || resp.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct KeaClient {
    http: reqwest::Client,
    servers: Vec<KeaServerConfig>,
    service: String,
    remote_type: String,
    server_tags: Vec<String>,
}

impl KeaClient {
    pub fn new(config: &KeaConfig) -> Result<Self, KeaError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(KeaError::Client)?;

        Ok(Self {
            http,
            servers: config.active_servers(),
            service: config.service.clone(),
            remote_type: config.remote_type.clone(),
            server_tags: config.server_tags.clone(),
        })
    }

    /// Active servers in priority order.
    pub fn servers(&self) -> &[KeaServerConfig] {
        &self.servers
    }

    /// Send a command to the highest-priority server. A transport failure is
    /// returned as is: the command may already have been applied there.
    pub async fn send(&self, command: &str, arguments: Value) -> Result<KeaResponse, KeaError> {
        let server = self.servers.first().ok_or(KeaError::NoActiveServers)?;
        self.send_to(server, command, &arguments).await
    }

    pub async fn send_to(
        &self,
        server: &KeaServerConfig,
        command: &str,
        arguments: &Value,
    ) -> Result<KeaResponse, KeaError> {
        let envelope = KeaCommand {
            command,
            service: [self.service.as_str()],
            arguments,
        };
        debug!(server = %server.name, command, "Kea request");

        let transport = |source: reqwest::Error| KeaError::Transport {
            server: server.name.clone(),
            source,
        };

        let resp = self
            .http
            .post(&server.url)
            .json(&envelope)
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(KeaError::Http {
                server: server.name.clone(),
                status: status.as_u16(),
            });
        }

        let body = resp.bytes().await.map_err(transport)?;
        let answer = KeaResponse::decode(&body)?;

        match &answer {
            KeaResponse::Error { text } | KeaResponse::Unsupported { text } => {
                warn!(server = %server.name, command, "Kea command failed: {text}");
            }
            _ => debug!(server = %server.name, command, text = ?answer.text(), "Kea answer"),
        }

        Ok(answer)
    }

    /// Send the same command to every active server, in order.
    pub async fn broadcast(&self, command: &str, arguments: Value) -> Vec<ServerOutcome> {
        let mut outcomes = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            let result = self.send_to(server, command, &arguments).await;
            if let Err(e) = &result {
                warn!(server = %server.name, command, "Kea broadcast failed: {e}");
            }
            outcomes.push(ServerOutcome {
                server: server.name.clone(),
                result,
            });
        }
        outcomes
    }

    /// Add the config-backend selector (`remote`, `server-tags`) that every
    /// `remote-*` command needs.
    pub fn with_remote(&self, mut arguments: Value) -> Value {
        if let Value::Object(map) = &mut arguments {
            map.insert("remote".into(), json!({ "type": self.remote_type }));
            map.insert("server-tags".into(), json!(self.server_tags));
        }
        arguments
    }
}
