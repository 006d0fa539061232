//! MCP tool server over JSON-RPC 2.0 stdio
//!
//! One JSON message per line in, one per line out. Notifications get no
//! reply. Tool failures come back as results with `isError: true` so the
//! agent sees them; only malformed requests become JSON-RPC errors.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info};

use super::protocol::{ImagePayload, ToolError};
use super::ToolServer;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;

/// JSON-RPC 2.0 Request
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    #[serde(default)]
    jsonrpc: Option<String>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Option<Value>,
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    fn err(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
            id,
        }
    }
}

/// MCP Tool Definition
#[derive(Serialize)]
struct McpToolDef {
    name: &'static str,
    description: &'static str,
    #[serde(rename = "inputSchema")]
    input_schema: Value,
}

fn tool_definitions() -> Vec<McpToolDef> {
    vec![
        McpToolDef {
            name: "get_status",
            description: "Show whether the screenfix capture daemon is listening, plus screenshot and pending task counts",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        McpToolDef {
            name: "start_daemon",
            description: "Start the screenfix capture daemon in the background",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "force": {
                        "type": "boolean",
                        "description": "Start even though a stale state record claims a daemon is listening"
                    }
                }
            }),
        },
        McpToolDef {
            name: "stop_daemon",
            description: "Stop the screenfix capture daemon",
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        McpToolDef {
            name: "list_screenshots",
            description: "List captured screenshots, newest first",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "limit": {
                        "type": "integer",
                        "minimum": 0,
                        "description": "Maximum number of screenshots to return (default 10)"
                    }
                }
            }),
        },
        McpToolDef {
            name: "get_last_screenshot",
            description: "Get the most recent screenshot with its task instruction",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "include_image": {
                        "type": "boolean",
                        "description": "Attach the image itself (default true)"
                    }
                }
            }),
        },
        McpToolDef {
            name: "get_tasks",
            description: "List tasks from the screenfix task file in priority order",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pending_only": {
                        "type": "boolean",
                        "description": "Only return tasks that are not done yet (default false)"
                    }
                }
            }),
        },
        McpToolDef {
            name: "complete_task",
            description: "Mark a task as done by ordinal, screenshot id/file/path, or exact instruction text",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task_id": {
                        "type": ["string", "integer"],
                        "description": "Task ordinal (1-based), screenshot id, file name or path, or the instruction text"
                    }
                },
                "required": ["task_id"]
            }),
        },
        McpToolDef {
            name: "read_screenshot",
            description: "Read a screenshot image from the screenfix screenshot directory",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Screenshot path, file name or id"
                    }
                },
                "required": ["path"]
            }),
        },
    ]
}

#[derive(Debug, Default, Deserialize)]
struct NoArgs {}

#[derive(Debug, Default, Deserialize)]
struct StartArgs {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ListArgs {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct LastArgs {
    #[serde(default = "default_true")]
    include_image: bool,
}

impl Default for LastArgs {
    fn default() -> Self {
        Self {
            include_image: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct TasksArgs {
    #[serde(default)]
    pending_only: bool,
}

#[derive(Debug, Deserialize)]
struct CompleteArgs {
    #[serde(alias = "task_text")]
    task_id: TaskRef,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TaskRef {
    Ordinal(u64),
    Text(String),
}

impl TaskRef {
    fn into_selector(self) -> String {
        match self {
            TaskRef::Ordinal(n) => n.to_string(),
            TaskRef::Text(text) => text,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReadArgs {
    path: String,
}

/// Decode tool arguments; absent or null arguments mean "all defaults"
fn parse_args<T: for<'de> Deserialize<'de> + Default>(arguments: Value) -> Result<T, ToolError> {
    if arguments.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

fn parse_required<T: for<'de> Deserialize<'de>>(arguments: Value) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

/// A successful tool result before it is rendered as MCP content
struct ToolOutput {
    text: String,
    structured: Value,
    image: Option<ImagePayload>,
}

impl ToolOutput {
    fn new(text: String, structured: &impl Serialize) -> Result<Self, ToolError> {
        Ok(Self {
            text,
            structured: serde_json::to_value(structured)
                .map_err(|e| ToolError::Internal(e.to_string()))?,
            image: None,
        })
    }

    fn with_image(mut self, image: Option<ImagePayload>) -> Self {
        self.image = image;
        self
    }

    fn into_result(self) -> Value {
        let mut content = vec![json!({ "type": "text", "text": self.text })];
        if let Some(image) = self.image {
            content.push(json!({
                "type": "image",
                "data": base64::engine::general_purpose::STANDARD.encode(&image.bytes),
                "mimeType": image.format.mime_type(),
            }));
        }
        json!({
            "content": content,
            "structuredContent": self.structured,
            "isError": false,
        })
    }
}

fn error_result(err: &ToolError) -> Value {
    json!({
        "content": [{ "type": "text", "text": err.to_string() }],
        "structuredContent": { "code": err.code(), "message": err.to_string() },
        "isError": true,
    })
}

/// Dispatches JSON-RPC requests to a [`ToolServer`]
pub struct McpServer {
    tools: ToolServer,
    shutdown_requested: bool,
}

impl McpServer {
    pub fn new(tools: ToolServer) -> Self {
        Self {
            tools,
            shutdown_requested: false,
        }
    }

    /// Serve until EOF or `shutdown`
    pub fn serve<R: BufRead, W: Write>(&mut self, input: R, mut output: W) -> Result<()> {
        info!("Starting MCP server on stdio");

        for line in input.lines() {
            let line = line.context("Failed to read line from stdin")?;
            if let Some(response) = self.handle_line(&line) {
                write_response(&mut output, &response)?;
            }
            if self.shutdown_requested {
                break;
            }
        }

        info!("MCP server shutting down");
        Ok(())
    }

    /// Handle one raw line; `None` when nothing should be written back
    pub fn handle_line(&mut self, line: &str) -> Option<JsonRpcResponse> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        debug!("Received: {}", trimmed);

        match serde_json::from_str::<JsonRpcRequest>(trimmed) {
            Ok(request) => self.handle_request(request),
            Err(e) => {
                error!("Failed to parse JSON-RPC request: {}", e);
                Some(JsonRpcResponse::err(
                    None,
                    PARSE_ERROR,
                    format!("Parse error: {}", e),
                ))
            }
        }
    }

    fn handle_request(&mut self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id;

        // Notifications carry no id and never get a response
        if request.method.starts_with("notifications/") {
            debug!(method = %request.method, "notification");
            return None;
        }

        let response = match request.method.as_str() {
            "initialize" => JsonRpcResponse::ok(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {} },
                    "serverInfo": {
                        "name": "screenfix",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }),
            ),
            "ping" => JsonRpcResponse::ok(id, json!({})),
            "tools/list" => JsonRpcResponse::ok(id, json!({ "tools": tool_definitions() })),
            "tools/call" => match self.handle_tool_call(request.params) {
                Ok(result) => JsonRpcResponse::ok(id, result),
                Err(message) => JsonRpcResponse::err(id, INVALID_PARAMS, message),
            },
            "shutdown" => {
                self.shutdown_requested = true;
                JsonRpcResponse::ok(id, json!({}))
            }
            other => JsonRpcResponse::err(
                id,
                METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            ),
        };
        Some(response)
    }

    /// Protocol-level problems are `Err`; tool failures are `Ok` with isError
    fn handle_tool_call(&self, params: Option<Value>) -> Result<Value, String> {
        let params = params.ok_or("Missing params for tools/call")?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or("Missing tool name")?
            .to_string();
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

        debug!("Tool call: {} with args: {}", name, arguments);

        let outcome = match name.as_str() {
            "get_status" => self.call_get_status(arguments),
            "start_daemon" => self.call_start_daemon(arguments),
            "stop_daemon" => self.call_stop_daemon(arguments),
            "list_screenshots" => self.call_list_screenshots(arguments),
            "get_last_screenshot" => self.call_get_last_screenshot(arguments),
            "get_tasks" => self.call_get_tasks(arguments),
            "complete_task" => self.call_complete_task(arguments),
            "read_screenshot" => self.call_read_screenshot(arguments),
            _ => return Err(format!("Unknown tool: {}", name)),
        };

        Ok(match outcome {
            Ok(output) => output.into_result(),
            Err(err) => {
                info!(tool = %name, code = ?err.code(), "tool failed: {}", err);
                error_result(&err)
            }
        })
    }

    fn call_get_status(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let _: NoArgs = parse_args(arguments)?;
        let status = self.tools.get_status()?;

        let mut text = if status.listening {
            format!(
                "Daemon: listening (PID {})\n",
                status
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            )
        } else {
            "Daemon: not running\n".to_string()
        };
        if let Some(beat) = status.heartbeat_at {
            text.push_str(&format!("Last heartbeat: {}\n", beat.to_rfc3339()));
        }
        text.push_str(&format!(
            "Screenshots: {} in {}\nPending tasks: {} in {}\n",
            status.screenshot_count,
            status.screenshots_dir.display(),
            status.pending_task_count,
            status.tasks_file.display()
        ));
        if let Some(warning) = &status.warning {
            text.push_str(&format!("Warning: {}\n", warning));
        }

        ToolOutput::new(text, &status)
    }

    fn call_start_daemon(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let args: StartArgs = parse_args(arguments)?;
        let transition = self.tools.start_daemon(args.force)?;
        ToolOutput::new(transition.message.clone(), &transition)
    }

    fn call_stop_daemon(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let _: NoArgs = parse_args(arguments)?;
        let transition = self.tools.stop_daemon()?;
        ToolOutput::new(transition.message.clone(), &transition)
    }

    fn call_list_screenshots(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let args: ListArgs = parse_args(arguments)?;
        let list = self.tools.list_screenshots(args.limit)?;

        let mut text = String::new();
        if list.screenshots.is_empty() {
            text.push_str("No screenshots found.\n");
        } else {
            text.push_str(&format!(
                "Showing {} of {} screenshots (newest first):\n",
                list.screenshots.len(),
                list.total
            ));
            for shot in &list.screenshots {
                text.push_str(&format!("- {}  {}\n", shot.captured_at, shot.path.display()));
            }
        }

        ToolOutput::new(text, &list)
    }

    fn call_get_last_screenshot(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let args: LastArgs = parse_args(arguments)?;
        let last = self.tools.get_last_screenshot(args.include_image)?;

        let mut text = format!(
            "Latest screenshot: {}\nCaptured: {}\n",
            last.screenshot.path.display(),
            last.screenshot.captured_at
        );
        match &last.task {
            Some(task) => text.push_str(&format!(
                "Task #{} [{}]: {}\n",
                task.ordinal,
                if task.is_pending() { "pending" } else { "done" },
                task.instruction
            )),
            None => text.push_str("No task recorded for this screenshot.\n"),
        }

        let image = last.image.clone();
        Ok(ToolOutput::new(text, &last)?.with_image(image))
    }

    fn call_get_tasks(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let args: TasksArgs = parse_args(arguments)?;
        let listing = self.tools.get_tasks(args.pending_only)?;

        let mut text = String::new();
        if listing.tasks.is_empty() {
            text.push_str(if args.pending_only {
                "No pending tasks.\n"
            } else {
                "No tasks found.\n"
            });
        }
        for task in &listing.tasks {
            text.push_str(&format!(
                "{}. [{}] {}\n   Screenshot: {}\n",
                task.ordinal,
                if task.is_pending() { " " } else { "x" },
                task.instruction,
                task.capture_ref.display()
            ));
        }
        for warning in &listing.warnings {
            text.push_str(&format!(
                "Warning: skipped line {} ({}): {}\n",
                warning.line, warning.reason, warning.content
            ));
        }

        ToolOutput::new(text, &listing)
    }

    fn call_complete_task(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let args: CompleteArgs = parse_required(arguments)?;
        let outcome = self.tools.complete_task(&args.task_id.into_selector())?;

        let text = if outcome.already_done {
            format!(
                "Task #{} was already done: {}",
                outcome.task.ordinal, outcome.task.instruction
            )
        } else {
            format!(
                "Marked task #{} as done: {}",
                outcome.task.ordinal, outcome.task.instruction
            )
        };
        ToolOutput::new(text, &outcome)
    }

    fn call_read_screenshot(&self, arguments: Value) -> Result<ToolOutput, ToolError> {
        let args: ReadArgs = parse_required(arguments)?;
        let shot = self.tools.read_screenshot(&args.path)?;

        let text = format!(
            "Screenshot {} ({}, {} bytes)",
            shot.screenshot.path.display(),
            shot.image.format.mime_type(),
            shot.image.bytes.len()
        );
        let image = shot.image.clone();
        Ok(ToolOutput::new(text, &shot)?.with_image(Some(image)))
    }
}

fn write_response<W: Write>(out: &mut W, response: &JsonRpcResponse) -> Result<()> {
    serde_json::to_writer(&mut *out, response).context("Failed to serialize response")?;
    out.write_all(b"\n")
        .context("Failed to write newline to stdout")?;
    out.flush().context("Failed to flush stdout")?;
    Ok(())
}
