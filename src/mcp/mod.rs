/// MCP server registry + connection-pooled proxy manager.
///
/// This is the *client* side of MCP: kbforge dials out to external tool
/// servers and forwards calls to them, the mirror image of the `rmcp` tool
/// router that serves calls inbound.

pub mod proxy;
pub mod registry;
