/// Connection pool to external MCP tool servers: lazy connect, prefixed
/// tool-name routing, fault eviction, and a non-pooled inspect path.
///
/// Client-side counterpart to the `ServerHandler`/`tool_router` machinery in
/// `server.rs` — there the crate answers `call_tool`; here it issues one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rmcp::model::CallToolRequestParam;
use rmcp::service::RunningService;
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport, TokioChildProcess};
use rmcp::{RoleClient, ServiceExt};
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::errors::CoreError;
use crate::mcp::registry::{ServerType, ToolDescriptor};

type Client = RunningService<RoleClient, ()>;

struct PooledEntry {
    client: Mutex<Option<Client>>,
}

pub struct McpProxyManager {
    pool: PgPool,
    connect_timeout: Duration,
    call_timeout: Duration,
    clients: RwLock<HashMap<Uuid, Arc<PooledEntry>>>,
}

#[derive(Debug, Clone)]
struct ConnectConfig {
    server_type: ServerType,
    command: Option<String>,
    args: Vec<String>,
    env: HashMap<String, String>,
    url: Option<String>,
    headers: HashMap<String, String>,
    enabled: bool,
}

impl McpProxyManager {
    pub fn new(pool: PgPool, connect_timeout: Duration, call_timeout: Duration) -> Self {
        McpProxyManager { pool, connect_timeout, call_timeout, clients: RwLock::new(HashMap::new()) }
    }

    async fn load_config(&self, server_id: Uuid) -> Result<ConnectConfig, CoreError> {
        let row = sqlx::query("SELECT * FROM mcp_servers WHERE id = $1")
            .bind(server_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found("mcp_server", server_id.to_string()))?;

        let server_type_str: String = row.try_get("server_type")?;
        let server_type = ServerType::from_sql(&server_type_str)
            .ok_or_else(|| CoreError::Internal(format!("unknown server_type: {server_type_str}")))?;
        let args: Value = row.try_get("args")?;
        let env: Value = row.try_get("env")?;
        let headers: Value = row.try_get("headers")?;

        Ok(ConnectConfig {
            server_type,
            command: row.try_get("command")?,
            args: serde_json::from_value(args).unwrap_or_default(),
            env: serde_json::from_value(env).unwrap_or_default(),
            url: row.try_get("url")?,
            headers: serde_json::from_value(headers).unwrap_or_default(),
            enabled: row.try_get("enabled")?,
        })
    }

    async fn dial(&self, config: &ConnectConfig) -> Result<Client, CoreError> {
        let connect = async {
            match config.server_type {
                ServerType::Builtin => Err(CoreError::Transport("builtin servers are in-process and not proxied".to_string())),
                ServerType::Stdio => {
                    let command = config
                        .command
                        .as_deref()
                        .ok_or_else(|| CoreError::Transport("stdio server missing command".to_string()))?;
                    let mut cmd = Command::new(command);
                    cmd.args(&config.args);
                    for (key, value) in &config.env {
                        cmd.env(key, value);
                    }
                    let transport = TokioChildProcess::new(cmd)
                        .map_err(|e| CoreError::Transport(format!("failed to spawn stdio server: {e}")))?;
                    ().serve(transport).await.map_err(|e| CoreError::Transport(e.to_string()))
                }
                ServerType::Sse => {
                    let url = config.url.clone().ok_or_else(|| CoreError::Transport("sse server missing url".to_string()))?;
                    let transport = SseClientTransport::start(url).await.map_err(|e| CoreError::Transport(e.to_string()))?;
                    ().serve(transport).await.map_err(|e| CoreError::Transport(e.to_string()))
                }
                ServerType::Http => {
                    let url = config.url.clone().ok_or_else(|| CoreError::Transport("http server missing url".to_string()))?;
                    let transport = StreamableHttpClientTransport::from_uri(url);
                    ().serve(transport).await.map_err(|e| CoreError::Transport(e.to_string()))
                }
            }
        };

        tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| CoreError::Transport("connect timed out".to_string()))?
    }

    async fn entry_for(&self, server_id: Uuid) -> Arc<PooledEntry> {
        if let Some(entry) = self.clients.read().await.get(&server_id) {
            return entry.clone();
        }
        let mut write = self.clients.write().await;
        write
            .entry(server_id)
            .or_insert_with(|| Arc::new(PooledEntry { client: Mutex::new(None) }))
            .clone()
    }

    /// Acquires a connected client for `server_id`, dialing lazily on first
    /// use. Any caller-observed transport error should follow up with
    /// `evict` so the next call reconnects.
    async fn with_client<F, Fut, T>(&self, server_id: Uuid, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&Client) -> Fut,
        Fut: std::future::Future<Output = Result<T, CoreError>>,
    {
        let config = self.load_config(server_id).await?;
        if !config.enabled {
            return Err(CoreError::Transport("server is disabled".to_string()));
        }

        let entry = self.entry_for(server_id).await;
        let mut guard = entry.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.dial(&config).await?);
        }
        let client = guard.as_ref().expect("client populated above");

        match tokio::time::timeout(self.call_timeout, f(client)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                *guard = None;
                Err(e)
            }
            Err(_) => {
                *guard = None;
                Err(CoreError::Transport("call timed out".to_string()))
            }
        }
    }

    pub async fn discover_tools(&self, server_id: Uuid) -> Result<Vec<ToolDescriptor>, CoreError> {
        self.with_client(server_id, |client| async move {
            let tools = client.list_tools(Default::default()).await.map_err(|e| CoreError::Transport(e.to_string()))?;
            Ok(tools
                .tools
                .into_iter()
                .map(|t| ToolDescriptor {
                    tool_name: t.name.to_string(),
                    description: t.description.map(|d| d.to_string()),
                    input_schema: Value::Object((*t.input_schema).clone()),
                })
                .collect())
        })
        .await
    }

    /// `prefixed_name` is `"<server_name>_<tool_name>"`; callers resolve the
    /// server id from the prefix before calling this.
    pub async fn call_tool(&self, server_id: Uuid, tool_name: &str, arguments: Map<String, Value>) -> Result<Value, CoreError> {
        let tool_name = tool_name.to_string();
        self.with_client(server_id, move |client| async move {
            let result = client
                .call_tool(CallToolRequestParam { name: tool_name.into(), arguments: Some(arguments) })
                .await
                .map_err(|e| CoreError::Transport(e.to_string()))?;
            Ok(serde_json::to_value(result).unwrap_or(Value::Null))
        })
        .await
    }

    pub async fn evict(&self, server_id: Uuid) {
        let clients = self.clients.read().await;
        if let Some(entry) = clients.get(&server_id) {
            let mut guard = entry.client.lock().await;
            *guard = None;
        }
    }

    /// A fresh, non-pooled connection used purely for diagnostics. Never
    /// touches the pooled entry, so it can't evict or disturb live traffic.
    pub async fn inspect(&self, server_id: Uuid) -> InspectReport {
        let start = Instant::now();
        let config = match self.load_config(server_id).await {
            Ok(config) => config,
            Err(e) => return InspectReport::error(e.to_string(), start.elapsed()),
        };

        let client = match tokio::time::timeout(self.connect_timeout, self.dial(&config)).await {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => return InspectReport::error(e.to_string(), start.elapsed()),
            Err(_) => return InspectReport::error("connect timed out".to_string(), start.elapsed()),
        };

        let tools = client.list_tools(Default::default()).await.ok().map(|r| r.tools.len());
        let prompts = client.list_prompts(Default::default()).await.ok().map(|r| r.prompts.len());
        let resources = client.list_resources(Default::default()).await.ok().map(|r| r.resources.len());
        let resource_templates = client.list_resource_templates(Default::default()).await.ok().map(|r| r.resource_templates.len());

        let _ = client.cancel().await;

        InspectReport {
            status: InspectStatus::Ok,
            error: None,
            latency: start.elapsed(),
            tool_count: tools,
            prompt_count: prompts,
            resource_count: resources,
            resource_template_count: resource_templates,
        }
    }

    pub async fn shutdown(&self) {
        let mut clients = self.clients.write().await;
        for (_, entry) in clients.drain() {
            let mut guard = entry.client.lock().await;
            if let Some(client) = guard.take() {
                let _ = client.cancel().await;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone)]
pub struct InspectReport {
    pub status: InspectStatus,
    pub error: Option<String>,
    pub latency: Duration,
    pub tool_count: Option<usize>,
    pub prompt_count: Option<usize>,
    pub resource_count: Option<usize>,
    pub resource_template_count: Option<usize>,
}

impl InspectReport {
    fn error(message: String, latency: Duration) -> Self {
        InspectReport {
            status: InspectStatus::Error,
            error: Some(message),
            latency,
            tool_count: None,
            prompt_count: None,
            resource_count: None,
            resource_template_count: None,
        }
    }
}

/// Parses `"<server_name>_<tool_name>"` against the known server names for a
/// project, returning the matched name and the unprefixed tool name. Longest
/// matching prefix wins so server names that are themselves prefixes of one
/// another don't misroute.
pub fn resolve_prefixed_tool<'a>(prefixed_name: &'a str, known_server_names: &[String]) -> Option<(&'a str, &'a str)> {
    known_server_names
        .iter()
        .filter(|name| prefixed_name.starts_with(name.as_str()) && prefixed_name.as_bytes().get(name.len()) == Some(&b'_'))
        .max_by_key(|name| name.len())
        .map(|name| {
            let (prefix, rest) = prefixed_name.split_at(name.len());
            (prefix, &rest[1..])
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_prefixed_tool_name() {
        let servers = vec!["github".to_string()];
        assert_eq!(resolve_prefixed_tool("github_list_issues", &servers), Some(("github", "list_issues")));
    }

    #[test]
    fn prefers_longest_matching_server_name() {
        let servers = vec!["git".to_string(), "github".to_string()];
        assert_eq!(resolve_prefixed_tool("github_list_issues", &servers), Some(("github", "list_issues")));
    }

    #[test]
    fn returns_none_for_unknown_prefix() {
        let servers = vec!["github".to_string()];
        assert_eq!(resolve_prefixed_tool("unknown_list_issues", &servers), None);
    }
}
