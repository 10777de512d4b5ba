//! Stdio Backend Connection variant (§4.1). Newline-delimited JSON framing
//! over a child process's stdout, with a whitelisted parent environment, a
//! stderr ring buffer, and the resource caps named in the specification.

use super::error::BackendError;
use super::transport::{
    AtomicConnectionState, ConnectionState, DEFAULT_REQUEST_DEADLINE, HealthDetail, JsonRpcRequest,
    JsonRpcResponse, PendingTable, Transport, check_response_size,
};
use crate::model::ToolDescriptor;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;

/// Parent-process env vars forwarded to every stdio child in addition to
/// the backend's own configured env (§4.1).
const ENV_WHITELIST: &[&str] = &["PATH", "HOME", "NODE_ENV", "LANG", "TZ", "TERM", "USER", "SHELL"];

/// Config-supplied env var names that are never forwarded, regardless of
/// whitelisting, because they can redirect the dynamic linker or Node's
/// module resolution (§4.1).
const ENV_BLOCKLIST: &[&str] = &[
    "PATH",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "NODE_OPTIONS",
    "NODE_PATH",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
];

const MAX_LINE_BUFFER: usize = 10 * 1024 * 1024;
const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
const STDERR_RING_CAPACITY: usize = 50;
const STDERR_CHUNK_TRUNCATE: usize = 500;

#[derive(Debug, PartialEq, Eq)]
pub struct FramingError(pub String);

/// Pure function stdio line splitter (§9): `(buffer, chunk) -> (messages,
/// new_buffer, overflow?)`. No recursion, no hidden state — the supervising
/// task owns `buffer` and drives this on every chunk read.
pub fn split_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> Result<Vec<Vec<u8>>, FramingError> {
    buffer.extend_from_slice(chunk);

    let mut messages = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = &line[..line.len() - 1]; // drop the newline
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(FramingError(format!(
                "message of {} bytes exceeds the {}-byte cap",
                line.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        if !line.is_empty() {
            messages.push(line.to_vec());
        }
    }

    if buffer.len() > MAX_LINE_BUFFER {
        return Err(FramingError(format!(
            "line buffer of {} bytes exceeds the {}-byte cap with no newline",
            buffer.len(),
            MAX_LINE_BUFFER
        )));
    }

    Ok(messages)
}

/// Redacts known secret shapes from captured stderr text (§4.1).
fn redact_secrets(text: &str) -> String {
    let mut out = text.to_string();
    out = replace_matches(&out, "sk-", |_| "sk-[REDACTED]".to_string());
    out = replace_matches(&out, "ghp_", |_| "ghp_[REDACTED]".to_string());
    out = replace_prefixed_token(&out, "Bearer ", "Bearer [REDACTED]");
    out = redact_key_value_pairs(&out);
    out
}

fn replace_matches(text: &str, needle: &str, redactor: impl Fn(&str) -> String) -> String {
    if !text.contains(needle) {
        return text.to_string();
    }
    let mut result = String::new();
    let mut rest = text;
    while let Some(idx) = rest.find(needle) {
        result.push_str(&rest[..idx]);
        let tail = &rest[idx + needle.len()..];
        let token_len = tail
            .find(|c: char| c.is_whitespace() || c == '"' || c == '\'')
            .unwrap_or(tail.len());
        result.push_str(&redactor(&tail[..token_len]));
        rest = &tail[token_len..];
    }
    result.push_str(rest);
    result
}

fn replace_prefixed_token(text: &str, prefix: &str, replacement: &str) -> String {
    if !text.contains(prefix) {
        return text.to_string();
    }
    let mut result = String::new();
    let mut rest = text;
    while let Some(idx) = rest.find(prefix) {
        result.push_str(&rest[..idx]);
        let tail = &rest[idx + prefix.len()..];
        let token_len = tail
            .find(|c: char| c.is_whitespace() || c == '"')
            .unwrap_or(tail.len());
        result.push_str(replacement);
        rest = &tail[token_len..];
    }
    result.push_str(rest);
    result
}

fn redact_key_value_pairs(text: &str) -> String {
    let secret_key_markers = ["key", "token", "secret", "password", "apikey"];
    text.split_whitespace()
        .map(|word| {
            if let Some(eq) = word.find('=') {
                let key = &word[..eq].to_lowercase();
                if secret_key_markers.iter().any(|m| key.contains(m)) {
                    return format!("{}=[REDACTED]", &word[..eq]);
                }
            }
            word.to_string()
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct StderrRing {
    entries: Mutex<VecDeque<String>>,
}

impl Default for StderrRing {
    fn default() -> Self {
        Self::new()
    }
}

impl StderrRing {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(STDERR_RING_CAPACITY)),
        }
    }

    pub fn push(&self, chunk: &str) {
        let mut truncated: String = chunk.chars().take(STDERR_CHUNK_TRUNCATE).collect();
        if chunk.chars().count() > STDERR_CHUNK_TRUNCATE {
            truncated.push_str("...[truncated]");
        }
        let redacted = redact_secrets(&truncated);

        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= STDERR_RING_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(redacted);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }
}

pub struct StdioConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<String>,
    pub timeout: Duration,
}

pub struct StdioTransport {
    name: String,
    config: StdioConfig,
    // Shared with the background stdout/stderr reader tasks spawned in
    // `start()`, which outlive the borrow of `&self` that spawned them.
    state: Arc<AtomicConnectionState>,
    pending: Arc<PendingTable>,
    stderr_ring: Arc<StderrRing>,
    tools: RwLock<Vec<ToolDescriptor>>,
    child: RwLock<Option<Child>>,
    stdin: RwLock<Option<tokio::process::ChildStdin>>,
    started_at: Mutex<Option<Instant>>,
    exited: Arc<AtomicBool>,
}

impl StdioTransport {
    pub fn new(name: String, config: StdioConfig) -> Self {
        Self {
            pending: Arc::new(PendingTable::new(name.clone())),
            stderr_ring: Arc::new(StderrRing::new()),
            name,
            config,
            state: Arc::new(AtomicConnectionState::new(ConnectionState::Idle)),
            tools: RwLock::new(Vec::new()),
            child: RwLock::new(None),
            stdin: RwLock::new(None),
            started_at: Mutex::new(None),
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    fn build_env(&self) -> Result<HashMap<String, String>, BackendError> {
        let mut env = HashMap::new();
        for key in ENV_WHITELIST {
            if let Ok(val) = std::env::var(key) {
                env.insert(key.to_string(), val);
            }
        }
        for (key, val) in &self.config.env {
            if ENV_BLOCKLIST.contains(&key.as_str()) {
                return Err(BackendError::StartupError {
                    name: self.name.clone(),
                    reason: format!("config env var '{key}' is on the blocklist"),
                });
            }
            env.insert(key.clone(), val.clone());
        }
        Ok(env)
    }

    fn validate_command(&self) -> Result<(), BackendError> {
        const SHELL_METACHARACTERS: &[char] = &['|', '&', ';', '$', '>', '<', '`', '\n', '(', ')'];
        if self.config.command.contains(SHELL_METACHARACTERS) {
            return Err(BackendError::StartupError {
                name: self.name.clone(),
                reason: "command must not contain shell metacharacters".to_string(),
            });
        }
        Ok(())
    }

    pub fn stderr_snapshot(&self) -> Vec<String> {
        self.stderr_ring.snapshot()
    }
}

#[cfg(unix)]
fn kill_process_group(pid: i32) {
    unsafe {
        libc::kill(-pid, libc::SIGTERM);
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), BackendError> {
        self.state.store(ConnectionState::Starting);
        self.validate_command()?;
        let env = self.build_env()?;

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.config.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| BackendError::StartupError {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        *self.stdin.write().await = Some(stdin);
        *self.child.write().await = Some(child);
        *self.started_at.lock().unwrap() = Some(Instant::now());

        spawn_stdout_reader(
            self.name.clone(),
            stdout,
            Arc::clone(&self.pending),
            Arc::clone(&self.state),
            Arc::clone(&self.exited),
        );
        spawn_stderr_reader(self.name.clone(), stderr, Arc::clone(&self.stderr_ring));

        self.invoke_raw("initialize", serde_json::json!({}))
            .await
            .map_err(|e| BackendError::StartupError {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;

        self.refresh_tools().await?;
        self.state.store(ConnectionState::Running);
        Ok(())
    }

    async fn invoke(&self, tool: &str, arguments: Option<Value>) -> Result<Value, BackendError> {
        if self.state.load() != ConnectionState::Running {
            return Err(BackendError::Unavailable {
                name: self.name.clone(),
            });
        }

        let params = serde_json::json!({
            "name": tool,
            "arguments": arguments.unwrap_or(Value::Object(Default::default())),
        });
        let result = self.invoke_raw("tools/call", params).await?;
        check_response_size(&self.name, &result)?;
        Ok(result)
    }

    async fn refresh_tools(&self) -> Result<Vec<ToolDescriptor>, BackendError> {
        let result = self.invoke_raw("tools/list", serde_json::json!({})).await?;
        let tools: Vec<ToolDescriptor> = result
            .get("tools")
            .and_then(|t| t.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| {
                        Some(ToolDescriptor {
                            name: t.get("name")?.as_str()?.to_string(),
                            description: t
                                .get("description")
                                .and_then(|d| d.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            input_schema: t.get("inputSchema").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        *self.tools.write().await = tools.clone();
        Ok(tools)
    }

    async fn health_check(&self) -> HealthDetail {
        let healthy = self.state.load() == ConnectionState::Running;
        let pid = self.child.read().await.as_ref().and_then(|c| c.id());
        HealthDetail {
            healthy,
            uptime_secs: self
                .started_at
                .lock()
                .unwrap()
                .map(|t| t.elapsed().as_secs()),
            tool_count: self.tools.read().await.len(),
            pending_requests: Some(self.pending.len()),
            pid,
            consecutive_failures: None,
            redacted_url: None,
            error: if healthy {
                None
            } else if self.exited.load(std::sync::atomic::Ordering::SeqCst) {
                Some(format!(
                    "backend process exited\n{}",
                    self.stderr_ring.snapshot().join("\n")
                ))
            } else {
                Some(self.stderr_ring.snapshot().join("\n"))
            },
        }
    }

    async fn stop(&self) -> Result<(), BackendError> {
        self.state.store(ConnectionState::Stopping);
        self.pending.cancel_all();

        let mut child_guard = self.child.write().await;
        if let Some(mut child) = child_guard.take() {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                kill_process_group(pid as i32);
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
            let _ = child.kill().await;
        }

        self.state.store(ConnectionState::Stopped);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state.load()
    }
}

impl StdioTransport {
    async fn invoke_raw(&self, method: &str, params: Value) -> Result<Value, BackendError> {
        let (id, rx) = self.pending.register()?;
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let mut body = serde_json::to_vec(&request).map_err(|e| BackendError::ProtocolError {
            name: self.name.clone(),
            reason: e.to_string(),
        })?;
        body.push(b'\n');

        {
            let mut guard = self.stdin.write().await;
            let stdin = guard.as_mut().ok_or_else(|| BackendError::Unavailable {
                name: self.name.clone(),
            })?;
            stdin
                .write_all(&body)
                .await
                .map_err(|e| BackendError::ProtocolError {
                    name: self.name.clone(),
                    reason: e.to_string(),
                })?;
        }

        match tokio::time::timeout(self.config.timeout.max(DEFAULT_REQUEST_DEADLINE), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BackendError::Canceled {
                name: self.name.clone(),
            }),
            Err(_) => Err(BackendError::Timeout {
                name: self.name.clone(),
                deadline_secs: self.config.timeout.as_secs(),
            }),
        }
    }

}

/// Resolves a pending request from a parsed JSON-RPC message. Free function
/// rather than a `&self` method since the reader task that calls it only
/// holds the `Arc<PendingTable>` it was spawned with, not the transport.
fn dispatch_response(pending: &PendingTable, response: JsonRpcResponse) {
    let Some(id) = response.id else { return };
    let result = if let Some(err) = response.error {
        Err(BackendError::PeerError {
            name: pending.name().to_string(),
            code: err.code,
            message: err.message,
        })
    } else {
        Ok(response.result.unwrap_or(Value::Null))
    };
    pending.complete(id, result);
}

fn spawn_stdout_reader(
    name: String,
    stdout: tokio::process::ChildStdout,
    pending: Arc<PendingTable>,
    state: Arc<AtomicConnectionState>,
    exited: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 64 * 1024];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => match split_lines(&mut buffer, &chunk[..n]) {
                    Ok(messages) => {
                        for msg in messages {
                            match serde_json::from_slice::<JsonRpcResponse>(&msg) {
                                Ok(response) => dispatch_response(&pending, response),
                                Err(e) => {
                                    tracing::warn!(backend = %name, error = %e, "unparseable stdout line");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(backend = %name, error = %e.0, "stdio framing error, killing connection");
                        break;
                    }
                },
                Err(e) => {
                    tracing::error!(backend = %name, error = %e, "stdout read error");
                    break;
                }
            }
        }
        // Child exited or the pipe broke: nothing will ever complete the
        // requests still waiting in `pending`, so fail them now instead of
        // making callers wait out their full deadline (§4.1, §7).
        exited.store(true, std::sync::atomic::Ordering::SeqCst);
        state.store(ConnectionState::Failed);
        pending.cancel_all();
        tracing::warn!(backend = %name, "stdout closed, marking backend failed");
    });
}

fn spawn_stderr_reader(name: String, stderr: tokio::process::ChildStderr, stderr_ring: Arc<StderrRing>) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end();
                    tracing::debug!(backend = %name, chunk = %trimmed, "backend stderr");
                    stderr_ring.push(trimmed);
                }
                Err(_) => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_complete_lines() {
        let mut buffer = Vec::new();
        let messages = split_lines(&mut buffer, b"{\"a\":1}\n{\"b\":2}\n").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], b"{\"a\":1}");
        assert_eq!(messages[1], b"{\"b\":2}");
        assert!(buffer.is_empty());
    }

    #[test]
    fn holds_partial_line_in_buffer() {
        let mut buffer = Vec::new();
        let messages = split_lines(&mut buffer, b"{\"a\":1}\n{\"partial").unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(buffer, b"{\"partial");

        let messages2 = split_lines(&mut buffer, b"\"}\n").unwrap();
        assert_eq!(messages2.len(), 1);
        assert_eq!(messages2[0], b"{\"partial\"}");
    }

    #[test]
    fn rejects_oversized_message() {
        let mut buffer = Vec::new();
        let huge = vec![b'x'; MAX_MESSAGE_SIZE + 1];
        let mut chunk = huge;
        chunk.push(b'\n');
        assert!(split_lines(&mut buffer, &chunk).is_err());
    }

    #[test]
    fn rejects_oversized_buffer_without_newline() {
        let mut buffer = Vec::new();
        let huge = vec![b'x'; MAX_LINE_BUFFER + 1];
        assert!(split_lines(&mut buffer, &huge).is_err());
    }

    #[test]
    fn env_blocklist_rejects_ld_preload() {
        let mut env = HashMap::new();
        env.insert("LD_PRELOAD".to_string(), "/evil.so".to_string());
        let transport = StdioTransport::new(
            "test".to_string(),
            StdioConfig {
                command: "echo".to_string(),
                args: vec![],
                env,
                cwd: None,
                timeout: Duration::from_secs(5),
            },
        );
        assert!(transport.build_env().is_err());
    }

    #[test]
    fn redacts_bearer_and_sk_tokens() {
        let redacted = redact_secrets("auth: Bearer sk-abcdef123456 extra");
        assert!(!redacted.contains("sk-abcdef123456"));
        assert!(redacted.contains("[REDACTED]"));
    }

    #[test]
    fn redacts_key_value_secrets() {
        let redacted = redact_secrets("starting with api_key=supersecret and debug=true");
        assert!(redacted.contains("api_key=[REDACTED]"));
        assert!(redacted.contains("debug=true"));
    }

    #[test]
    fn stderr_ring_caps_at_fifty() {
        let ring = StderrRing::new();
        for i in 0..60 {
            ring.push(&format!("line {i}"));
        }
        assert_eq!(ring.snapshot().len(), STDERR_RING_CAPACITY);
    }
}
