//! Log sink
//!
//! `log://` writes one line per message to stdout; `log://<path>` appends
//! to a file instead, creating parent directories. The line is the
//! stringified body, which for sources that set no `body` field is the
//! whole message as JSON.

use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use virta_core::{Message, Result, RouteError};

use super::Sink;
use crate::uri::EndpointUri;

/// Line-per-message sink for stdout or a file
pub struct LogSink {
    path: Option<String>,
}

impl LogSink {
    /// Build from a `log://[path]` URI
    pub fn from_uri(uri: &EndpointUri) -> Result<Self> {
        let path = uri.fs_path();
        Ok(Self {
            path: if path.is_empty() { None } else { Some(path) },
        })
    }
}

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, msg: &Message, _cancel: &CancellationToken) -> Result<()> {
        let line = msg.body_str();

        match &self.path {
            None => {
                use std::io::Write;
                let mut stdout = std::io::stdout().lock();
                writeln!(stdout, "{line}")
                    .map_err(|e| RouteError::delivery("log", format!("stdout: {e}")))?;
            }
            Some(path) => {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| RouteError::delivery("log", e.to_string()))?;
                    }
                }
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| RouteError::delivery("log", format!("{path}: {e}")))?;
                file.write_all(line.as_bytes())
                    .await
                    .map_err(|e| RouteError::delivery("log", e.to_string()))?;
                file.write_all(b"\n")
                    .await
                    .map_err(|e| RouteError::delivery("log", e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use virta_core::keys;

    #[tokio::test]
    async fn test_file_target_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/route.log");
        let uri = EndpointUri::parse(&format!("log://{}", path.display())).unwrap();
        let sink = LogSink::from_uri(&uri).unwrap();
        let cancel = CancellationToken::new();

        sink.deliver(&Message::new("t://").with_field(keys::BODY, "one"), &cancel)
            .await
            .unwrap();
        sink.deliver(&Message::new("t://").with_field(keys::BODY, "two"), &cancel)
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_bodyless_message_logs_whole_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let uri = EndpointUri::parse(&format!("log://{}", path.display())).unwrap();
        let sink = LogSink::from_uri(&uri).unwrap();

        let msg = Message::new("timer://1s").with_field(keys::TICK_ID, 0);
        sink.deliver(&msg, &CancellationToken::new()).await.unwrap();

        let line = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(parsed["tick_id"], 0);
        assert_eq!(parsed["source"], "timer://1s");
    }

    #[tokio::test]
    async fn test_stdout_target() {
        let sink = LogSink::from_uri(&EndpointUri::parse("log://").unwrap()).unwrap();
        let msg = Message::new("t://").with_field(keys::BODY, "hello");
        sink.deliver(&msg, &CancellationToken::new()).await.unwrap();
    }
}
