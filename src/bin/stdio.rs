//! Stdio transport shim: line-delimited JSON-RPC on stdin/stdout, bridged to
//! the HTTP MCP endpoint. Re-initializes transparently when the server
//! reports a dead session, and tolerates both JSON and SSE-framed replies.

use anyhow::{bail, Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use serde_json::{json, Value};
use tavily_bridge::config::SearchSourceMode;
use tavily_bridge::mcp::sse;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Parser)]
#[command(name = "bridge-stdio", about = "Stdio MCP shim for the search bridge")]
struct Cli {
    /// Client token (or TAVILY_BRIDGE_MCP_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Routing mode forwarded per request
    #[arg(long, default_value = "brave_prefer_tavily_fallback")]
    search_source_mode: String,

    /// Bridge endpoint (or TAVILY_BRIDGE_URL)
    #[arg(long)]
    url: Option<String>,
}

fn main() {
    // Exit codes: 1 config error, 2 help, 0 clean shutdown.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            std::process::exit(2);
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let token = cli
        .token
        .or_else(|| std::env::var("TAVILY_BRIDGE_MCP_TOKEN").ok())
        .filter(|t| !t.trim().is_empty());
    let Some(token) = token else {
        eprintln!("error: client token required (--token or TAVILY_BRIDGE_MCP_TOKEN)");
        std::process::exit(1);
    };

    if SearchSourceMode::parse_loose(&cli.search_source_mode).is_none() {
        eprintln!(
            "error: invalid --search-source-mode '{}'",
            cli.search_source_mode
        );
        std::process::exit(1);
    }

    let url = cli
        .url
        .or_else(|| std::env::var("TAVILY_BRIDGE_URL").ok())
        .unwrap_or_else(|| "http://127.0.0.1:8080/".to_string());

    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: runtime: {e}");
            std::process::exit(1);
        }
    };

    let shim = Shim {
        http: reqwest::Client::new(),
        url,
        token,
        mode: cli.search_source_mode,
        session: None,
    };
    if let Err(e) = rt.block_on(run(shim)) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

struct Shim {
    http: reqwest::Client,
    url: String,
    token: String,
    mode: String,
    session: Option<String>,
}

impl Shim {
    /// POST one JSON-RPC message; returns every JSON-RPC message found in
    /// the reply regardless of framing.
    async fn post(&mut self, body: &Value) -> Result<Vec<Value>> {
        let mut req = self
            .http
            .post(&self.url)
            .header("authorization", format!("Bearer {}", self.token))
            .header("accept", "application/json, text/event-stream")
            .header("x-search-source-mode", &self.mode)
            .json(body);
        if let Some(session) = &self.session {
            req = req.header("mcp-session-id", session);
        }

        let resp = req.send().await.context("bridge unreachable")?;
        if let Some(session) = resp
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            self.session = Some(session.to_string());
        }
        let looks_like_sse = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));
        let text = resp.text().await.context("reading bridge reply")?;
        Ok(sse::parse_response_body(&text, looks_like_sse))
    }

    async fn ensure_session(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let init = json!({
            "jsonrpc": "2.0",
            "id": 0,
            "method": "initialize",
            "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {
                    "name": "bridge-stdio",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            },
        });
        self.post(&init).await?;
        if self.session.is_none() {
            bail!("server did not issue a session id");
        }
        Ok(())
    }
}

async fn run(mut shim: Shim) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                let err = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": { "code": -32700, "message": "Parse error" },
                });
                stdout.write_all(format!("{err}\n").as_bytes()).await?;
                continue;
            }
        };

        let is_initialize =
            request.get("method").and_then(Value::as_str) == Some("initialize");
        if !is_initialize {
            shim.ensure_session().await?;
        }

        let mut messages = shim.post(&request).await?;

        // Dead session: re-initialize once and replay the request.
        if !is_initialize {
            let invalid = sse::pick_response(&messages, request.get("id"))
                .and_then(|m| m.pointer("/error/message"))
                .and_then(Value::as_str)
                .is_some_and(sse::is_session_invalid_message);
            if invalid {
                shim.session = None;
                shim.ensure_session().await?;
                messages = shim.post(&request).await?;
            }
        }

        // Notifications get no reply line.
        if request.get("id").is_some() {
            if let Some(reply) = sse::pick_response(&messages, request.get("id")) {
                stdout.write_all(format!("{reply}\n").as_bytes()).await?;
                stdout.flush().await?;
            }
        }
    }

    Ok(())
}
