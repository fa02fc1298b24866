//! Scripted MCP server used by the integration tests.
//!
//! Speaks newline-delimited JSON-RPC on stdio and exposes a handful of tools
//! whose behavior exercises the client: slow and missing responses, remote
//! errors, notifications, crashes, split writes and server-initiated
//! requests.

use clap::Parser;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const DEFAULT_TOOLS: &[&str] = &[
    "ping",
    "echo",
    "slow",
    "never",
    "fail",
    "notify",
    "exit",
    "split",
    "env",
    "cwd",
    "list_changed",
    "ask",
];

#[derive(Parser, Debug)]
#[command(name = "toolhub-mock-server")]
struct Args {
    /// Name reported in `serverInfo`.
    #[arg(long, default_value = "mock")]
    name: String,
    /// Advertise only these tools. Unrecognized names echo their call.
    #[arg(long = "tool")]
    tools: Vec<String>,
    /// Never answer `initialize`.
    #[arg(long)]
    hang_handshake: bool,
    /// Answer `initialize` with an error.
    #[arg(long)]
    fail_init: bool,
    /// Keep running after stdin closes or a shutdown notice.
    #[arg(long)]
    linger: bool,
    /// Print a non-JSON line on stdout before anything else.
    #[arg(long)]
    banner: bool,
    /// Split `tools/list` into pages of this size.
    #[arg(long)]
    page_size: Option<usize>,
}

type Out = Arc<Mutex<io::Stdout>>;

fn send(out: &Out, message: &Value) {
    if let Ok(line) = serde_json::to_string(message) {
        if let Ok(mut stdout) = out.lock() {
            let _ = writeln!(stdout, "{line}");
            let _ = stdout.flush();
        }
    }
}

fn reply(out: &Out, id: &Value, result: Value) {
    send(out, &json!({"jsonrpc": "2.0", "id": id, "result": result}));
}

fn reply_error(out: &Out, id: &Value, code: i64, message: &str, data: Option<Value>) {
    let mut error = json!({"code": code, "message": message});
    if let Some(data) = data {
        error["data"] = data;
    }
    send(out, &json!({"jsonrpc": "2.0", "id": id, "error": error}));
}

fn text(value: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": value.into()}]})
}

struct Server {
    args: Args,
    out: Out,
    tools: Vec<String>,
    /// `tools/call` ids waiting on our own request to the client.
    asks: HashMap<String, Value>,
    next_ask: u64,
}

impl Server {
    fn new(args: Args) -> Self {
        let tools = if args.tools.is_empty() {
            DEFAULT_TOOLS.iter().map(|t| t.to_string()).collect()
        } else {
            args.tools.clone()
        };
        Self {
            args,
            out: Arc::new(Mutex::new(io::stdout())),
            tools,
            asks: HashMap::new(),
            next_ask: 1,
        }
    }

    /// Returns `false` when the server should stop reading.
    fn handle(&mut self, message: Value) -> bool {
        let id = message.get("id").cloned().filter(|id| !id.is_null());
        let method = message.get("method").and_then(Value::as_str).map(str::to_string);
        let params = message.get("params").cloned().unwrap_or(Value::Null);

        match (id, method) {
            (Some(id), Some(method)) => self.request(&id, &method, params),
            (None, Some(method)) => self.notification(&method, &params),
            (Some(id), None) => self.client_reply(&id, message),
            (None, None) => {
                eprintln!("mock: ignoring message without id or method");
                true
            }
        }
    }

    fn request(&mut self, id: &Value, method: &str, params: Value) -> bool {
        match method {
            "initialize" => {
                if self.args.hang_handshake {
                    eprintln!("mock: not answering initialize");
                } else if self.args.fail_init {
                    reply_error(&self.out, id, -32603, "initialization refused", None);
                } else {
                    reply(
                        &self.out,
                        id,
                        json!({
                            "protocolVersion": params["protocolVersion"],
                            "capabilities": {"tools": {"listChanged": true}},
                            "serverInfo": {"name": self.args.name, "version": "0.0.1"}
                        }),
                    );
                }
            }
            "tools/list" => self.list_tools(id, &params),
            "tools/call" => return self.call_tool(id, params),
            "ping" => reply(&self.out, id, json!({})),
            other => reply_error(
                &self.out,
                id,
                -32601,
                &format!("Method not found: {other}"),
                None,
            ),
        }
        true
    }

    fn list_tools(&self, id: &Value, params: &Value) {
        let start = params["cursor"]
            .as_str()
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let page_size = self.args.page_size.unwrap_or(usize::MAX).max(1);
        let end = start.saturating_add(page_size).min(self.tools.len());

        let page: Vec<Value> = self.tools[start.min(end)..end]
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "description": format!("mock tool {name}"),
                    "inputSchema": {"type": "object"}
                })
            })
            .collect();

        let mut result = json!({"tools": page});
        if end < self.tools.len() {
            result["nextCursor"] = json!(end.to_string());
        }
        reply(&self.out, id, result);
    }

    fn call_tool(&mut self, id: &Value, params: Value) -> bool {
        let name = params["name"].as_str().unwrap_or_default().to_string();
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        match name.as_str() {
            "ping" => reply(&self.out, id, text("pong")),
            "echo" => reply(&self.out, id, arguments),
            "slow" => {
                let ms = arguments["ms"].as_u64().unwrap_or(100);
                let out = Arc::clone(&self.out);
                let id = id.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(ms));
                    reply(&out, &id, json!({"slept": ms, "tag": arguments["tag"]}));
                });
            }
            "never" => {}
            "fail" => reply_error(
                &self.out,
                id,
                -32000,
                "tool failed",
                Some(json!({"arguments": arguments})),
            ),
            "notify" => {
                send(
                    &self.out,
                    &json!({
                        "jsonrpc": "2.0",
                        "method": "notifications/message",
                        "params": {"level": "info", "data": arguments}
                    }),
                );
                reply(&self.out, id, json!({}));
            }
            "exit" => {
                let code = arguments["code"].as_i64().unwrap_or(1);
                eprintln!("mock: exiting with {code}");
                std::process::exit(i32::try_from(code).unwrap_or(1));
            }
            "split" => self.split_reply(id, arguments),
            "env" => {
                let var = arguments["name"].as_str().unwrap_or_default();
                reply(&self.out, id, json!({"value": std::env::var(var).ok()}));
            }
            "cwd" => {
                let cwd = std::env::current_dir()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                reply(&self.out, id, json!({"cwd": cwd}));
            }
            "list_changed" => {
                self.tools.push("late".to_string());
                send(
                    &self.out,
                    &json!({"jsonrpc": "2.0", "method": "notifications/tools/list_changed"}),
                );
                reply(&self.out, id, json!({}));
            }
            "ask" => {
                let method = arguments["method"].as_str().unwrap_or("ping").to_string();
                let ask_id = format!("srv-{}", self.next_ask);
                self.next_ask += 1;
                self.asks.insert(ask_id.clone(), id.clone());
                send(
                    &self.out,
                    &json!({"jsonrpc": "2.0", "id": ask_id, "method": method}),
                );
            }
            other if self.tools.iter().any(|t| t == other) => reply(
                &self.out,
                id,
                json!({"server": self.args.name, "tool": other, "arguments": arguments}),
            ),
            other => reply_error(&self.out, id, -32602, &format!("Unknown tool: {other}"), None),
        }
        true
    }

    /// Write one response in two pieces with a pause in between.
    fn split_reply(&self, id: &Value, arguments: Value) {
        let message = json!({"jsonrpc": "2.0", "id": id, "result": {"split": true, "arguments": arguments}});
        let Ok(line) = serde_json::to_string(&message) else {
            return;
        };
        let (head, tail) = line.split_at(line.len() / 2);
        if let Ok(mut stdout) = self.out.lock() {
            let _ = stdout.write_all(head.as_bytes());
            let _ = stdout.flush();
            thread::sleep(Duration::from_millis(50));
            let _ = writeln!(stdout, "{tail}");
            let _ = stdout.flush();
        }
    }

    fn notification(&mut self, method: &str, params: &Value) -> bool {
        match method {
            "shutdown" if !self.args.linger => return false,
            "notifications/cancelled" => {
                eprintln!("mock: request {} cancelled", params["requestId"]);
            }
            _ => {}
        }
        true
    }

    fn client_reply(&mut self, id: &Value, message: Value) -> bool {
        let key = id.as_str().unwrap_or_default().to_string();
        match self.asks.remove(&key) {
            Some(call_id) => reply(&self.out, &call_id, json!({"reply": message})),
            None => eprintln!("mock: unexpected reply {id}"),
        }
        true
    }
}

fn main() {
    let args = Args::parse();
    if args.banner {
        println!("mock server starting (not JSON)");
        eprintln!("mock: banner printed");
    }
    let linger = args.linger;
    let mut server = Server::new(args);

    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(message) => {
                if !server.handle(message) {
                    return;
                }
            }
            Err(e) => eprintln!("mock: bad input ({e}): {line}"),
        }
    }

    if linger {
        loop {
            thread::sleep(Duration::from_secs(60));
        }
    }
}
