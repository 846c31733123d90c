//! External processor
//!
//! Delegates one message at a time to a subprocess in any language. The
//! wire contract:
//!
//! - the command is invoked with two extra arguments,
//!   `--input=<tmp>` and `--output=<tmp>`
//! - the input file holds the message (one JSON document, or the raw
//!   `body` bytes with `input_format: text`)
//! - on exit 0 the output file (or stdout, when the file is left empty)
//!   becomes the new message
//! - every `config` entry is exported as `CONFIG_<UPPER_KEY>`
//! - the subprocess sees the engine's environment snapshot, not the live
//!   environment
//!
//! One invocation per message, spawned fresh each time - isolation over
//! throughput. The deadline defaults to 60 s (`config.timeout` overrides,
//! in seconds); on expiry the whole process group gets SIGTERM, two
//! seconds of grace, then SIGKILL.

use std::collections::HashMap;
use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use virta_core::{keys, Message, Result, RouteError};

use super::Processor;
use crate::config::PayloadFormat;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Subprocess-delegating processor
#[derive(Debug)]
pub struct External {
    command: Vec<String>,
    input_format: PayloadFormat,
    output_format: PayloadFormat,
    config: Map<String, Value>,
    timeout: Duration,
    env: Arc<HashMap<String, String>>,
}

impl External {
    /// Build from configuration; an empty command is a configuration error
    pub fn new(
        command: Vec<String>,
        input_format: PayloadFormat,
        output_format: PayloadFormat,
        config: Map<String, Value>,
        env: Arc<HashMap<String, String>>,
    ) -> Result<Self> {
        if command.is_empty() {
            return Err(RouteError::Config(
                "external processor needs a command".to_string(),
            ));
        }
        let timeout = config
            .get("timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);
        Ok(Self {
            command,
            input_format,
            output_format,
            config,
            timeout,
            env,
        })
    }

    /// The deadline applied to each invocation
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn write_input(&self, msg: &Message) -> Result<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("virta-ext-in-")
            .tempfile()
            .map_err(RouteError::Io)?;
        match self.input_format {
            PayloadFormat::Json => {
                serde_json::to_writer(&mut file, &msg.to_json())
                    .map_err(|e| RouteError::processing("external", format!("write input: {e}")))?;
            }
            PayloadFormat::Text => {
                file.write_all(msg.body_str().as_bytes())
                    .map_err(RouteError::Io)?;
            }
        }
        file.flush().map_err(RouteError::Io)?;
        Ok(file)
    }

    fn parse_output(&self, bytes: &[u8], input: &Message) -> Result<Message> {
        match self.output_format {
            PayloadFormat::Json => {
                let value: Value = serde_json::from_slice(bytes).map_err(|e| {
                    RouteError::processing("external", format!("output is not valid JSON: {e}"))
                })?;
                let mut msg = Message::from_json(value)?;
                // Subprocesses that emit a bare payload keep their routing
                for key in [keys::TIMESTAMP, keys::SOURCE, keys::ROUTE] {
                    msg.inherit(key, input);
                }
                Ok(msg)
            }
            PayloadFormat::Text => {
                let text = String::from_utf8_lossy(bytes);
                let text = text.strip_suffix('\n').unwrap_or(&text);
                Ok(input.clone().with_field(keys::BODY, text))
            }
        }
    }

    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let pgid = Pid::from_raw(pid as i32);
            let _ = killpg(pgid, Signal::SIGTERM);
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
                return;
            }
            let _ = killpg(pgid, Signal::SIGKILL);
            let _ = child.wait().await;
            return;
        }

        #[allow(unreachable_code)]
        {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
    }
}

#[async_trait]
impl Processor for External {
    fn name(&self) -> &str {
        "external"
    }

    async fn process(&self, msg: Message, cancel: &CancellationToken) -> Result<Option<Message>> {
        let input_file = self.write_input(&msg)?;
        let output_file = tempfile::Builder::new()
            .prefix("virta-ext-out-")
            .tempfile()
            .map_err(RouteError::Io)?;

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .arg(format!("--input={}", input_file.path().display()))
            .arg(format!("--output={}", output_file.path().display()))
            .env_clear()
            .envs(self.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.config {
            cmd.env(format!("CONFIG_{}", key.to_uppercase()), stringify(value));
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| RouteError::ExternalProcess {
            code: -1,
            stderr: format!("failed to spawn '{}': {e}", self.command[0]),
        })?;

        // Drain pipes concurrently so a chatty subprocess can't deadlock
        // against a full pipe buffer while we wait on it
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            status = tokio::time::timeout(self.timeout, child.wait()) => match status {
                Ok(Ok(status)) => status,
                Ok(Err(e)) => return Err(RouteError::Io(e)),
                Err(_) => {
                    self.terminate(&mut child).await;
                    return Err(RouteError::ExternalTimeout {
                        timeout_secs: self.timeout.as_secs(),
                    });
                }
            },
            _ = cancel.cancelled() => {
                self.terminate(&mut child).await;
                tracing::debug!("external processor cancelled mid-flight");
                return Ok(None);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(RouteError::ExternalProcess {
                code: status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        let written = tokio::fs::read(output_file.path())
            .await
            .unwrap_or_default();
        let output = if written.is_empty() { &stdout[..] } else { &written[..] };
        if output.is_empty() {
            return Err(RouteError::processing(
                "external",
                "command produced no output",
            ));
        }

        self.parse_output(output, &msg).map(Some)
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
