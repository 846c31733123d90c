//! File endpoints
//!
//! Source: `file://<glob>` emits one message per currently-matching file,
//! then watches the filesystem for newly-created matches. Watching is
//! OS-level (inotify/FSEvents/kqueue via `notify`); there is no polling
//! rescan.
//!
//! Sink: `file://<path>` appends the message body to the path, creating
//! parent directories. A path ending in `/` gets one generated file per
//! message instead.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;
use virta_core::{keys, Message, Result, RouteError};

use super::{MessageTx, Sink, Source};
use crate::uri::EndpointUri;

/// Glob-watching file source
#[derive(Debug)]
pub struct FileSource {
    pattern: glob::Pattern,
    pattern_str: String,
    uri: String,
}

impl FileSource {
    /// Build from a `file://<glob>` URI
    pub fn from_uri(uri: &EndpointUri) -> Result<Self> {
        let pattern_str = uri.fs_path();
        if pattern_str.is_empty() {
            return Err(RouteError::Config(format!(
                "file source '{}' has no path",
                uri.raw()
            )));
        }
        let pattern = glob::Pattern::new(&pattern_str).map_err(|e| {
            RouteError::Config(format!("bad glob '{pattern_str}': {e}"))
        })?;
        Ok(Self {
            pattern,
            pattern_str,
            uri: uri.raw().to_string(),
        })
    }

    /// Directory to watch: the longest prefix of the pattern without glob
    /// metacharacters
    fn watch_root(&self) -> PathBuf {
        let mut root = PathBuf::new();
        for component in Path::new(&self.pattern_str).components() {
            let text = component.as_os_str().to_string_lossy();
            if text.contains(['*', '?', '[']) {
                break;
            }
            root.push(component);
        }
        if root.as_os_str().is_empty() {
            root.push(".");
        }
        root
    }

    async fn emit(&self, path: &Path, tx: &MessageTx) -> bool {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                // The file may have vanished between the event and the read
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable file");
                return true;
            }
        };

        let mut msg = Message::new(self.uri.clone())
            .with_field(keys::PATH, path.to_string_lossy().as_ref())
            .with_field(keys::SIZE, bytes.len() as u64)
            .with_bytes(keys::CONTENT_BYTES, &bytes);
        if let Ok(text) = std::str::from_utf8(&bytes) {
            msg.set(keys::CONTENT_UTF8, text);
        }

        tx.send(msg).await
    }
}

#[async_trait]
impl Source for FileSource {
    fn name(&self) -> &str {
        "file"
    }

    async fn run(&self, tx: MessageTx, cancel: CancellationToken) -> Result<()> {
        let mut seen: HashSet<PathBuf> = HashSet::new();

        // Initial snapshot of currently-matching files, in glob order
        let entries = glob::glob(&self.pattern_str)
            .map_err(|e| RouteError::SourceFatal(format!("glob '{}': {e}", self.pattern_str)))?;
        for entry in entries {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(error = %e, "glob entry unreadable");
                    continue;
                }
            };
            if !path.is_file() {
                continue;
            }
            seen.insert(path.clone());
            if !self.emit(&path, &tx).await {
                return Ok(());
            }
        }

        // Watch for newly-created matches
        let (event_tx, mut event_rx) = mpsc::channel::<notify::Result<notify::Event>>(256);
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = event_tx.blocking_send(res);
        })
        .map_err(|e| RouteError::endpoint_start(&self.uri, format!("watcher: {e}")))?;

        let root = self.watch_root();
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| {
                RouteError::endpoint_start(&self.uri, format!("watch {}: {e}", root.display()))
            })?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = event_rx.recv() => match event {
                    Some(Ok(event)) => {
                        if !matches!(event.kind, EventKind::Create(_)) {
                            continue;
                        }
                        for path in event.paths {
                            if !self.pattern.matches_path(&path)
                                || !path.is_file()
                                || !seen.insert(path.clone())
                            {
                                continue;
                            }
                            if !self.emit(&path, &tx).await {
                                return Ok(());
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "file watch event error");
                    }
                    None => {
                        return Err(RouteError::SourceFatal(
                            "file watcher closed unexpectedly".to_string(),
                        ));
                    }
                }
            }
        }
    }
}

/// Body-writing file sink
pub struct FileSink {
    path: String,
}

impl FileSink {
    /// Build from a `file://<path>` URI
    pub fn from_uri(uri: &EndpointUri) -> Result<Self> {
        let path = uri.fs_path();
        if path.is_empty() {
            return Err(RouteError::Config(format!(
                "file sink '{}' has no path",
                uri.raw()
            )));
        }
        Ok(Self { path })
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn deliver(&self, msg: &Message, _cancel: &CancellationToken) -> Result<()> {
        let body = msg.body_str();

        if self.path.ends_with('/') {
            // One generated file per message
            tokio::fs::create_dir_all(&self.path)
                .await
                .map_err(|e| RouteError::delivery("file", e.to_string()))?;
            let target = format!("{}{}.json", self.path, Ulid::new());
            tokio::fs::write(&target, body.as_bytes())
                .await
                .map_err(|e| RouteError::delivery("file", format!("{target}: {e}")))?;
            return Ok(());
        }

        if let Some(parent) = Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| RouteError::delivery("file", e.to_string()))?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| RouteError::delivery("file", format!("{}: {e}", self.path)))?;
        file.write_all(body.as_bytes())
            .await
            .map_err(|e| RouteError::delivery("file", e.to_string()))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| RouteError::delivery("file", e.to_string()))?;
        Ok(())
    }
}
