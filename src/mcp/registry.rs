/// CRUD + builtin materialization + tool sync for external MCP tool
/// providers, one registry per project. Shaped after `server.rs`'s own
/// tool-registration flow, turned inside-out: this module manages rows
/// describing *other* servers rather than hosting tools itself.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::errors::CoreError;
use crate::mcp::proxy::{resolve_prefixed_tool, McpProxyManager};
use crate::services::ToolPoolInvalidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    Builtin,
    Stdio,
    Sse,
    Http,
}

impl ServerType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ServerType::Builtin => "builtin",
            ServerType::Stdio => "stdio",
            ServerType::Sse => "sse",
            ServerType::Http => "http",
        }
    }

    pub fn from_sql(s: &str) -> Option<ServerType> {
        match s {
            "builtin" => Some(ServerType::Builtin),
            "stdio" => Some(ServerType::Stdio),
            "sse" => Some(ServerType::Sse),
            "http" => Some(ServerType::Http),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct McpServer {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub server_type: ServerType,
    pub enabled: bool,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    pub headers: HashMap<String, String>,
}

fn row_to_server(row: &sqlx::postgres::PgRow) -> Result<McpServer, CoreError> {
    let server_type: String = row.try_get("server_type")?;
    let args: Value = row.try_get("args")?;
    let env: Value = row.try_get("env")?;
    let headers: Value = row.try_get("headers")?;
    Ok(McpServer {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        server_type: ServerType::from_sql(&server_type)
            .ok_or_else(|| CoreError::Internal(format!("unknown server_type: {server_type}")))?,
        enabled: row.try_get("enabled")?,
        command: row.try_get("command")?,
        args: serde_json::from_value(args).unwrap_or_default(),
        env: serde_json::from_value(env).unwrap_or_default(),
        url: row.try_get("url")?,
        headers: serde_json::from_value(headers).unwrap_or_default(),
    })
}

#[derive(Debug, Clone)]
pub struct McpTool {
    pub id: Uuid,
    pub server_id: Uuid,
    pub tool_name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub enabled: bool,
}

fn row_to_tool(row: &sqlx::postgres::PgRow) -> Result<McpTool, CoreError> {
    Ok(McpTool {
        id: row.try_get("id")?,
        server_id: row.try_get("server_id")?,
        tool_name: row.try_get("tool_name")?,
        description: row.try_get("description")?,
        input_schema: row.try_get("input_schema")?,
        enabled: row.try_get("enabled")?,
    })
}

#[derive(Debug, Clone)]
pub struct NewServer {
    pub project_id: Uuid,
    pub name: String,
    pub server_type: ServerType,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ServerPatch {
    pub enabled: Option<bool>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    pub url: Option<String>,
    pub headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub tool_name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

pub enum SyncMode {
    AutoDiscover,
    Manual(Vec<ToolDescriptor>),
}

/// The in-process catalogue of tools the builtin server exposes. Supplied by
/// the binary embedding this crate; kept separate from the registry so the
/// registry doesn't need to know what the builtin tools actually do.
pub trait BuiltinToolCatalog: Send + Sync {
    fn builtin_tools(&self) -> Vec<ToolDescriptor>;
}

fn validate_transport_fields(server_type: ServerType, command: &Option<String>, url: &Option<String>) -> Result<(), CoreError> {
    match server_type {
        ServerType::Builtin => Ok(()),
        ServerType::Stdio => {
            if command.as_deref().unwrap_or("").is_empty() {
                return Err(CoreError::validation("command", "command is required for stdio servers"));
            }
            Ok(())
        }
        ServerType::Sse | ServerType::Http => {
            if url.as_deref().unwrap_or("").is_empty() {
                return Err(CoreError::validation("url", "url is required for sse/http servers"));
            }
            Ok(())
        }
    }
}

pub struct McpRegistry {
    pool: PgPool,
    proxy: Arc<McpProxyManager>,
    invalidator: Arc<dyn ToolPoolInvalidator>,
    builtin_catalog: Arc<dyn BuiltinToolCatalog>,
    registry_url: String,
    http: reqwest::Client,
}

impl McpRegistry {
    pub fn new(
        pool: PgPool,
        proxy: Arc<McpProxyManager>,
        invalidator: Arc<dyn ToolPoolInvalidator>,
        builtin_catalog: Arc<dyn BuiltinToolCatalog>,
        registry_url: String,
    ) -> Self {
        McpRegistry { pool, proxy, invalidator, builtin_catalog, registry_url, http: reqwest::Client::new() }
    }

    pub async fn get_server(&self, id: Uuid) -> Result<Option<McpServer>, CoreError> {
        let row = sqlx::query("SELECT * FROM mcp_servers WHERE id = $1").bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_server).transpose()
    }

    pub async fn list_servers(&self, project_id: Uuid) -> Result<Vec<McpServer>, CoreError> {
        let rows = sqlx::query("SELECT * FROM mcp_servers WHERE project_id = $1 ORDER BY name")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_server).collect()
    }

    pub async fn get_server_by_name(&self, project_id: Uuid, name: &str) -> Result<Option<McpServer>, CoreError> {
        let row = sqlx::query("SELECT * FROM mcp_servers WHERE project_id = $1 AND name = $2")
            .bind(project_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_server).transpose()
    }

    pub async fn list_tools(&self, server_id: Uuid) -> Result<Vec<McpTool>, CoreError> {
        let rows = sqlx::query("SELECT * FROM mcp_tools WHERE server_id = $1 ORDER BY tool_name")
            .bind(server_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_tool).collect()
    }

    /// Materializes the per-project `"builtin"` row on first access and
    /// re-syncs its tool set from the in-process catalogue every time.
    pub async fn ensure_builtin(&self, project_id: Uuid) -> Result<McpServer, CoreError> {
        let existing = sqlx::query("SELECT * FROM mcp_servers WHERE project_id = $1 AND name = 'builtin'")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;

        let server = match existing {
            Some(row) => row_to_server(&row)?,
            None => {
                let row = sqlx::query(
                    "INSERT INTO mcp_servers (id, project_id, name, server_type, enabled, command, args, env, url, headers, created_at, updated_at)
                     VALUES ($1, $2, 'builtin', 'builtin', true, NULL, '[]'::jsonb, '{}'::jsonb, NULL, '{}'::jsonb, now(), now())
                     RETURNING *",
                )
                .bind(Uuid::new_v4())
                .bind(project_id)
                .fetch_one(&self.pool)
                .await?;
                row_to_server(&row)?
            }
        };

        let descriptors = self.builtin_catalog.builtin_tools();
        self.upsert_and_prune_tools(server.id, &descriptors).await?;
        self.invalidator.invalidate_cache(project_id).await;
        Ok(server)
    }

    pub async fn create_server(&self, new: NewServer) -> Result<McpServer, CoreError> {
        if new.server_type == ServerType::Builtin {
            return Err(CoreError::validation("server_type", "builtin servers cannot be created via the public API"));
        }
        validate_transport_fields(new.server_type, &new.command, &new.url)?;

        let row = sqlx::query(
            "INSERT INTO mcp_servers (id, project_id, name, server_type, enabled, command, args, env, url, headers, created_at, updated_at)
             VALUES ($1, $2, $3, $4, true, $5, $6, $7, $8, $9, now(), now())
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(new.project_id)
        .bind(&new.name)
        .bind(new.server_type.as_sql())
        .bind(&new.command)
        .bind(serde_json::to_value(&new.args).unwrap_or(Value::Array(vec![])))
        .bind(serde_json::to_value(&new.env).unwrap_or(Value::Object(Default::default())))
        .bind(&new.url)
        .bind(serde_json::to_value(&new.headers).unwrap_or(Value::Object(Default::default())))
        .fetch_one(&self.pool)
        .await?;
        let server = row_to_server(&row)?;
        self.invalidator.invalidate_cache(new.project_id).await;
        Ok(server)
    }

    pub async fn update_server(&self, id: Uuid, patch: ServerPatch) -> Result<McpServer, CoreError> {
        let current = self.get_server(id).await?.ok_or_else(|| CoreError::not_found("mcp_server", id.to_string()))?;

        // Builtin servers only take the enabled flag from the outside.
        let (command, args, env, url, headers) = if current.server_type == ServerType::Builtin {
            (current.command.clone(), current.args.clone(), current.env.clone(), current.url.clone(), current.headers.clone())
        } else {
            (
                patch.command.or(current.command.clone()),
                patch.args.unwrap_or(current.args.clone()),
                patch.env.unwrap_or(current.env.clone()),
                patch.url.or(current.url.clone()),
                patch.headers.unwrap_or(current.headers.clone()),
            )
        };
        if current.server_type != ServerType::Builtin {
            validate_transport_fields(current.server_type, &command, &url)?;
        }
        let enabled = patch.enabled.unwrap_or(current.enabled);

        let row = sqlx::query(
            "UPDATE mcp_servers SET enabled = $2, command = $3, args = $4, env = $5, url = $6, headers = $7, updated_at = now()
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(enabled)
        .bind(&command)
        .bind(serde_json::to_value(&args).unwrap_or(Value::Array(vec![])))
        .bind(serde_json::to_value(&env).unwrap_or(Value::Object(Default::default())))
        .bind(&url)
        .bind(serde_json::to_value(&headers).unwrap_or(Value::Object(Default::default())))
        .fetch_one(&self.pool)
        .await?;
        let server = row_to_server(&row)?;
        self.invalidator.invalidate_cache(server.project_id).await;
        Ok(server)
    }

    pub async fn delete_server(&self, id: Uuid) -> Result<(), CoreError> {
        let server = self.get_server(id).await?.ok_or_else(|| CoreError::not_found("mcp_server", id.to_string()))?;
        if server.server_type == ServerType::Builtin {
            return Err(CoreError::validation("server_type", "builtin servers cannot be deleted"));
        }
        sqlx::query("DELETE FROM mcp_tools WHERE server_id = $1").bind(id).execute(&self.pool).await?;
        sqlx::query("DELETE FROM mcp_servers WHERE id = $1").bind(id).execute(&self.pool).await?;
        self.proxy.evict(id).await;
        self.invalidator.invalidate_cache(server.project_id).await;
        Ok(())
    }

    pub async fn toggle_enabled(&self, id: Uuid, enabled: bool) -> Result<McpServer, CoreError> {
        self.update_server(id, ServerPatch { enabled: Some(enabled), ..Default::default() }).await
    }

    pub async fn sync_tools(&self, server_id: Uuid, mode: SyncMode) -> Result<usize, CoreError> {
        let server = self.get_server(server_id).await?.ok_or_else(|| CoreError::not_found("mcp_server", server_id.to_string()))?;
        let descriptors = match mode {
            SyncMode::AutoDiscover => self.proxy.discover_tools(server_id).await?,
            SyncMode::Manual(descs) => descs,
        };
        let count = descriptors.len();
        self.upsert_and_prune_tools(server_id, &descriptors).await?;
        self.invalidator.invalidate_cache(server.project_id).await;
        Ok(count)
    }

    /// Resolves `"<server_name>_<tool_name>"` against the project's known
    /// server names, confirms the matched server is enabled, and forwards
    /// the call through the proxy manager. The single composed operation
    /// behind "call an external tool by its prefixed name" — callers never
    /// need to resolve the server id themselves.
    pub async fn call_external_tool(
        &self,
        project_id: Uuid,
        prefixed_name: &str,
        arguments: Map<String, Value>,
    ) -> Result<Value, CoreError> {
        let servers = self.list_servers(project_id).await?;
        let names: Vec<String> = servers.iter().map(|s| s.name.clone()).collect();
        let (server_name, tool_name) = resolve_prefixed_tool(prefixed_name, &names)
            .ok_or_else(|| CoreError::not_found("mcp_tool", prefixed_name.to_string()))?;

        let server = servers
            .into_iter()
            .find(|s| s.name == server_name)
            .ok_or_else(|| CoreError::not_found("mcp_server", server_name.to_string()))?;

        if !server.enabled {
            return Err(CoreError::validation("server", format!("mcp server '{}' is disabled", server.name)));
        }

        self.proxy.call_tool(server.id, tool_name, arguments).await
    }

    async fn upsert_and_prune_tools(&self, server_id: Uuid, descriptors: &[ToolDescriptor]) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        let names: Vec<String> = descriptors.iter().map(|d| d.tool_name.clone()).collect();

        for descriptor in descriptors {
            sqlx::query(
                "INSERT INTO mcp_tools (id, server_id, tool_name, description, input_schema, enabled, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, true, now(), now())
                 ON CONFLICT (server_id, tool_name) DO UPDATE SET
                     description = EXCLUDED.description, input_schema = EXCLUDED.input_schema, updated_at = now()",
            )
            .bind(Uuid::new_v4())
            .bind(server_id)
            .bind(&descriptor.tool_name)
            .bind(&descriptor.description)
            .bind(&descriptor.input_schema)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM mcp_tools WHERE server_id = $1 AND NOT (tool_name = ANY($2))")
            .bind(server_id)
            .bind(&names)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn search_remote(&self, query: &str, cursor: Option<&str>) -> Result<RemoteSearchResult, CoreError> {
        let mut request = self.http.get(format!("{}/v0/servers", self.registry_url)).query(&[("search", query)]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        let response = request.send().await?.error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn fetch_remote(&self, name: &str, version: &str) -> Result<RemoteServerDescriptor, CoreError> {
        let response = self
            .http
            .get(format!("{}/v0/servers/{name}/versions/{version}", self.registry_url))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    /// Installs a package from the remote registry into a project. Remote
    /// transports are preferred (`streamable-http` over `sse`); stdio
    /// packages are rejected outright since they would spawn an arbitrary
    /// process on this host.
    pub async fn install(&self, project_id: Uuid, name: &str, version: &str) -> Result<InstallResult, CoreError> {
        let descriptor = self.fetch_remote(name, version).await?;

        let package = descriptor
            .packages
            .iter()
            .find(|p| p.transport_type == "streamable-http")
            .or_else(|| descriptor.packages.iter().find(|p| p.transport_type == "sse"))
            .ok_or_else(|| {
                CoreError::validation(
                    "transport_type",
                    "no remote (sse/streamable-http) transport is offered by this package; stdio packages are not installable",
                )
            })?;

        let server_type = if package.transport_type == "streamable-http" { ServerType::Http } else { ServerType::Sse };
        let url = package.url.clone().ok_or_else(|| CoreError::Internal("registry package missing url".to_string()))?;

        let server = self
            .create_server(NewServer {
                project_id,
                name: name.to_string(),
                server_type,
                command: None,
                args: vec![],
                env: HashMap::new(),
                url: Some(url),
                headers: HashMap::new(),
            })
            .await?;

        let required_env_vars = package.env_vars.iter().filter(|v| v.required).map(|v| v.name.clone()).collect();
        Ok(InstallResult { server, required_env_vars })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteSearchResult {
    pub servers: Vec<RemoteServerSummary>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteServerSummary {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteServerDescriptor {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub packages: Vec<RemotePackage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemotePackage {
    pub registry_type: String,
    pub transport_type: String,
    pub url: Option<String>,
    #[serde(default)]
    pub env_vars: Vec<RemoteEnvVar>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteEnvVar {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    pub description: Option<String>,
}

pub struct InstallResult {
    pub server: McpServer,
    pub required_env_vars: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_stdio_server_without_command() {
        let err = validate_transport_fields(ServerType::Stdio, &None, &None).unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[test]
    fn rejects_http_server_without_url() {
        let err = validate_transport_fields(ServerType::Http, &None, &None).unwrap_err();
        assert!(matches!(err, CoreError::Validation { .. }));
    }

    #[test]
    fn builtin_needs_no_transport_fields() {
        assert!(validate_transport_fields(ServerType::Builtin, &None, &None).is_ok());
    }
}
