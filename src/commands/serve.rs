//! Run the coordinator behind a JSON-lines control channel.
//!
//! Each line on stdin is one request, tagged by `op`; each response is one
//! line on stdout carrying the request's `id`. Requests are handled
//! concurrently, so responses can come back out of order. Logs go to
//! stderr. On EOF or Ctrl-C every live sandbox is backed up and killed.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordinator::{Coordinator, FileWrite, StreamingGuard};
use crate::error::CoordinatorError;

// -----------------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------------

pub(crate) async fn run(config: &Config, provider_override: Option<&str>) -> Result<()> {
    let coordinator = Coordinator::from_config(config, provider_override).await?;
    let server = Arc::new(Server::new(coordinator));

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                warn!("stdout closed, dropping responses");
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut inflight = JoinSet::new();
    info!("Ready for requests on stdin");

    let interrupted = loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read request")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => {
                        let server = Arc::clone(&server);
                        let tx = tx.clone();
                        inflight.spawn(async move {
                            let _ = tx.send(server.handle_line(&line).await);
                        });
                    }
                    None => break false,
                }
            }
            _ = tokio::signal::ctrl_c() => break true,
            Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
        }
    };

    if interrupted {
        info!("Interrupted, abandoning {} in-flight requests", inflight.len());
        inflight.abort_all();
    }
    while inflight.join_next().await.is_some() {}

    server.end_all_streams();
    let count = server.coordinator.shutdown_all().await;
    info!("Shut down {} sandboxes", count);

    drop(tx);
    let _ = writer.await;
    Ok(())
}

// -----------------------------------------------------------------------------
// Internal types
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Value,
    #[serde(flatten)]
    request: Request,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Load {
        project_id: String,
        user_id: String,
    },
    Refresh {
        sandbox_id: String,
    },
    Leave {
        sandbox_id: String,
    },
    Visibility {
        sandbox_id: String,
        hidden: bool,
    },
    Delete {
        sandbox_id: String,
    },
    Status {
        project_id: String,
    },
    Sessions,
    Inspect {
        sandbox_id: String,
    },
    StreamStart {
        sandbox_id: String,
    },
    StreamEnd {
        sandbox_id: String,
    },
    WriteFiles {
        sandbox_id: String,
        files: Vec<FileWrite>,
    },
    ReadFile {
        sandbox_id: String,
        path: String,
    },
    ListDir {
        sandbox_id: String,
        #[serde(default)]
        path: Option<String>,
    },
    Run {
        sandbox_id: String,
        commands: Vec<String>,
    },
    Purge {
        user_id: String,
        project_id: String,
    },
}

/// Dispatches requests to the coordinator and holds streaming guards
/// between `stream_start` and `stream_end`.
struct Server {
    coordinator: Coordinator,
    streams: Mutex<HashMap<String, StreamingGuard>>,
}

impl Server {
    fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            streams: Mutex::new(HashMap::new()),
        }
    }

    async fn handle_line(&self, line: &str) -> String {
        let envelope: Envelope = match serde_json::from_str(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("Rejected request: {}", e);
                return json!({
                    "id": Value::Null,
                    "ok": false,
                    "error": { "code": "bad_request", "message": e.to_string() },
                })
                .to_string();
            }
        };

        let response = self.handle(envelope.request).await;
        let pruned = self.prune_streams();
        if pruned > 0 {
            debug!("Dropped {} streams of sessions that are gone", pruned);
        }
        let response = match response {
            Ok(result) => json!({ "id": envelope.id, "ok": true, "result": result }),
            Err(e) => json!({
                "id": envelope.id,
                "ok": false,
                "error": { "code": e.code(), "message": e.to_string() },
            }),
        };
        response.to_string()
    }

    async fn handle(&self, request: Request) -> Result<Value, CoordinatorError> {
        let c = &self.coordinator;
        let value = match request {
            Request::Load {
                project_id,
                user_id,
            } => to_value(c.load_or_create(&project_id, &user_id).await?),
            Request::Refresh { sandbox_id } => {
                c.refresh(&sandbox_id).await?;
                Value::Null
            }
            Request::Leave { sandbox_id } => {
                let scheduled = c.notify_leaving(&sandbox_id).await?;
                json!({ "kill_scheduled": scheduled })
            }
            Request::Visibility { sandbox_id, hidden } => {
                c.visibility_change(&sandbox_id, hidden)?;
                Value::Null
            }
            Request::Delete { sandbox_id } => to_value(c.delete(&sandbox_id).await?),
            Request::Status { project_id } => to_value(c.status(&project_id)),
            Request::Sessions => to_value(c.sessions()),
            Request::Inspect { sandbox_id } => {
                let session = c
                    .session(&sandbox_id)
                    .ok_or_else(|| CoordinatorError::not_found(&sandbox_id))?;
                json!({
                    "session": session,
                    "phase": c.shutdown_phase(&sandbox_id),
                    "pending_shutdown": c.pending_shutdown(&sandbox_id),
                    "hidden_watch": c.is_watching_hidden(&sandbox_id),
                })
            }
            Request::StreamStart { sandbox_id } => {
                let mut streams = self.streams_table();
                if !streams.contains_key(&sandbox_id) {
                    let guard = c.begin_streaming(&sandbox_id)?;
                    streams.insert(sandbox_id, guard);
                }
                Value::Null
            }
            Request::StreamEnd { sandbox_id } => {
                json!({ "was_streaming": self.end_stream(&sandbox_id) })
            }
            Request::WriteFiles { sandbox_id, files } => {
                to_value(c.write_files(&sandbox_id, &files).await?)
            }
            Request::ReadFile { sandbox_id, path } => {
                let contents = c.read_file(&sandbox_id, &path).await?;
                Value::String(String::from_utf8_lossy(&contents).into_owned())
            }
            Request::ListDir { sandbox_id, path } => {
                to_value(c.list_dir(&sandbox_id, path.as_deref()).await?)
            }
            Request::Run {
                sandbox_id,
                commands,
            } => to_value(c.run_commands(&sandbox_id, &commands).await?),
            Request::Purge {
                user_id,
                project_id,
            } => {
                let removed = c.purge(&user_id, &project_id).await?;
                json!({ "removed": removed })
            }
        };
        Ok(value)
    }

    fn end_stream(&self, sandbox_id: &str) -> bool {
        // Drop outside the lock; the guard takes the registry lock
        let guard = self.streams_table().remove(sandbox_id);
        guard.is_some()
    }

    /// Drops guards whose session no longer exists, e.g. after a delete or
    /// after a dead sandbox was reaped.
    fn prune_streams(&self) -> usize {
        let stale: Vec<StreamingGuard> = {
            let mut streams = self.streams_table();
            let gone: Vec<String> = streams
                .keys()
                .filter(|id| self.coordinator.session(id).is_none())
                .cloned()
                .collect();
            gone.iter().filter_map(|id| streams.remove(id)).collect()
        };
        stale.len()
    }

    fn end_all_streams(&self) {
        let guards: Vec<StreamingGuard> = self.streams_table().drain().map(|(_, g)| g).collect();
        drop(guards);
    }

    fn streams_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamingGuard>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn to_value(value: impl serde::Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::mock::MockProvider;
    use crate::sandbox::SandboxProvider;
    use crate::store::{LocalDurableStore, MemoryMetadataStore};
    use tempfile::tempdir;

    fn server() -> (Server, tempfile::TempDir) {
        let mut config = Config::default();
        config.health.timeout_secs = 0;
        config.install.command = None;
        config.backup.auto_interval_secs = 0;
        let store = tempdir().unwrap();
        let coordinator = Coordinator::new(
            &config,
            Arc::new(MockProvider::new()) as Arc<dyn SandboxProvider>,
            Arc::new(MemoryMetadataStore::default()),
            Arc::new(LocalDurableStore::new(store.path())),
            None,
        );
        (Server::new(coordinator), store)
    }

    async fn call(server: &Server, line: &str) -> Value {
        serde_json::from_str(&server.handle_line(line).await).unwrap()
    }

    #[test]
    fn test_parse_request() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"id":7,"op":"visibility","sandbox_id":"sbx-1","hidden":true}"#)
                .unwrap();
        assert_eq!(envelope.id, json!(7));
        assert!(matches!(
            envelope.request,
            Request::Visibility { hidden: true, .. }
        ));

        let envelope: Envelope = serde_json::from_str(r#"{"op":"sessions"}"#).unwrap();
        assert_eq!(envelope.id, Value::Null);
        assert!(matches!(envelope.request, Request::Sessions));
    }

    #[tokio::test]
    async fn test_bad_request() {
        let (server, _store) = server();
        let response = call(&server, r#"{"op":"teleport"}"#).await;
        assert_eq!(response["ok"], json!(false));
        assert_eq!(response["error"]["code"], json!("bad_request"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_then_status() {
        let (server, _store) = server();
        let response = call(
            &server,
            r#"{"id":"a","op":"load","project_id":"p1","user_id":"alice"}"#,
        )
        .await;
        assert_eq!(response["id"], json!("a"));
        assert_eq!(response["ok"], json!(true));
        assert_eq!(response["result"]["session"]["sandbox_id"], json!("sbx-1"));
        assert_eq!(response["result"]["created"], json!(true));

        let response = call(&server, r#"{"op":"status","project_id":"p1"}"#).await;
        assert_eq!(response["result"], json!("active"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_carry_codes() {
        let (server, _store) = server();
        let response = call(&server, r#"{"id":1,"op":"leave","sandbox_id":"nope"}"#).await;
        assert_eq!(response["ok"], json!(false));
        assert_eq!(response["error"]["code"], json!("not_found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_start_and_end() {
        let (server, _store) = server();
        call(&server, r#"{"op":"load","project_id":"p1","user_id":"alice"}"#).await;

        call(&server, r#"{"op":"stream_start","sandbox_id":"sbx-1"}"#).await;
        call(&server, r#"{"op":"stream_start","sandbox_id":"sbx-1"}"#).await;
        assert!(server.coordinator.session("sbx-1").unwrap().is_streaming);

        let response = call(&server, r#"{"op":"delete","sandbox_id":"sbx-1"}"#).await;
        assert_eq!(response["error"]["code"], json!("streaming"));

        let response = call(&server, r#"{"op":"stream_end","sandbox_id":"sbx-1"}"#).await;
        assert_eq!(response["result"]["was_streaming"], json!(true));
        assert!(!server.coordinator.session("sbx-1").unwrap().is_streaming);

        let response = call(&server, r#"{"op":"delete","sandbox_id":"sbx-1"}"#).await;
        assert_eq!(response["ok"], json!(true));
        assert_eq!(response["result"]["result"], json!("synced"));
        assert_eq!(response["result"]["status"], json!("complete"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_of_vanished_sessions_are_dropped() {
        let (server, _store) = server();
        call(&server, r#"{"op":"load","project_id":"p1","user_id":"alice"}"#).await;
        call(&server, r#"{"op":"stream_start","sandbox_id":"sbx-1"}"#).await;
        assert_eq!(server.streams_table().len(), 1);

        assert_eq!(server.coordinator.shutdown_all().await, 1);
        call(&server, r#"{"op":"sessions"}"#).await;
        assert!(server.streams_table().is_empty());

        let response = call(&server, r#"{"op":"stream_start","sandbox_id":"sbx-1"}"#).await;
        assert_eq!(response["error"]["code"], json!("not_found"));
        assert!(server.streams_table().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inspect_shows_pending_shutdown() {
        let (server, _store) = server();
        call(&server, r#"{"op":"load","project_id":"p1","user_id":"alice"}"#).await;
        let response = call(&server, r#"{"op":"leave","sandbox_id":"sbx-1"}"#).await;
        assert_eq!(response["result"]["kill_scheduled"], json!(true));

        let response = call(&server, r#"{"op":"inspect","sandbox_id":"sbx-1"}"#).await;
        assert_eq!(response["result"]["phase"], json!("kill_scheduled"));
        assert_eq!(response["result"]["pending_shutdown"]["project_id"], json!("p1"));
        assert_eq!(response["result"]["session"]["is_shutting_down"], json!(true));
    }
}
