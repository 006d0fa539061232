// screenfix-mcp: tool server for coding agents (JSON-RPC 2.0 over stdio)

use std::io;

use anyhow::{Context, Result};
use screenfix_lib::config::Config;
use screenfix_lib::logging;
use screenfix_lib::tools::mcp::McpServer;
use screenfix_lib::tools::ToolServer;

fn main() -> Result<()> {
    logging::init();

    let config = Config::from_env().context("Failed to load configuration")?;
    let mut server = McpServer::new(ToolServer::new(config));

    let stdin = io::stdin();
    let stdout = io::stdout();
    server.serve(stdin.lock(), stdout.lock())
}
