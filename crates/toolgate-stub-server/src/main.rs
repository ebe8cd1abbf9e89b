//! Minimal downstream tool server for integration testing.
//!
//! Speaks the two-verb line-delimited protocol on stdio and exposes a small
//! tool roster with strict schemas: `echo`, `math.add`, `fail` (always
//! errors, for circuit-breaker tests), and `slow` (sleeps, for timeout
//! tests).

use serde_json::{json, Value};
use tokio::io::BufReader;
use toolgate_client::protocol::{
    read_line, write_line, WireError, WireRequest, WireResponse, METHOD_CALL_TOOL,
    METHOD_LIST_TOOLS,
};

fn tool_roster() -> Value {
    json!({
        "tools": [
            {
                "name": "echo",
                "description": "Echo a message back unchanged",
                "inputSchema": {
                    "type": "object",
                    "properties": { "message": { "type": "string" } },
                    "required": ["message"]
                }
            },
            {
                "name": "math.add",
                "description": "Add two numbers together",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "a": { "type": "number" },
                        "b": { "type": "number" }
                    },
                    "required": ["a", "b"]
                }
            },
            {
                "name": "fail",
                "description": "Always returns an error",
                "inputSchema": { "type": "object" }
            },
            {
                "name": "slow",
                "description": "Sleep before answering",
                "inputSchema": {
                    "type": "object",
                    "properties": { "ms": { "type": "integer", "minimum": 0 } },
                    "required": ["ms"]
                }
            }
        ]
    })
}

async fn handle_call(params: &Value) -> Result<Value, String> {
    let name = params["name"].as_str().unwrap_or_default();
    let args = &params["args"];
    match name {
        "echo" => Ok(json!({"echoed": args["message"]})),
        "math.add" => {
            let a = args["a"].as_f64().ok_or("'a' must be a number")?;
            let b = args["b"].as_f64().ok_or("'b' must be a number")?;
            Ok(json!({"result": a + b}))
        }
        "fail" => Err("intentional failure".to_string()),
        "slow" => {
            let ms = args["ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            Ok(json!({"slept": ms}))
        }
        other => Err(format!("no such tool: {other}")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();

    while let Some(request) = read_line::<WireRequest, _>(&mut stdin).await? {
        let response = match request.method.as_str() {
            METHOD_LIST_TOOLS => WireResponse {
                id: request.id,
                result: Some(tool_roster()),
                error: None,
            },
            METHOD_CALL_TOOL => match handle_call(&request.params).await {
                Ok(result) => WireResponse {
                    id: request.id,
                    result: Some(result),
                    error: None,
                },
                Err(message) => WireResponse {
                    id: request.id,
                    result: None,
                    error: Some(WireError { message }),
                },
            },
            other => WireResponse {
                id: request.id,
                result: None,
                error: Some(WireError {
                    message: format!("unknown method: {other}"),
                }),
            },
        };
        write_line(&mut stdout, &response).await?;
    }

    Ok(())
}
