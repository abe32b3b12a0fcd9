//! TCP server for GUI and CLI clients
//!
//! Newline-delimited JSON: one request object per line, one response per line.
//! Requests are tagged by `method`. Store I/O runs on the blocking pool.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use cuepoint_core::registry::CueDocument;
use cuepoint_core::store::audio_files;
use cuepoint_core::{Beatgrid, CueSpec, CueUpdate, MetadataStore, OptimizeStrategy};

use crate::config::Config;
use crate::session::Session;

/// Server state
pub struct ServerState {
    config: Config,
    store: Arc<MetadataStore>,
    sessions: HashMap<String, Session>,
}

impl ServerState {
    pub fn new(config: Config) -> Self {
        Self {
            store: Arc::new(MetadataStore::new(config.engine.clone())),
            config,
            sessions: HashMap::new(),
        }
    }

    #[cfg(test)]
    fn with_store(config: Config, store: MetadataStore) -> Self {
        Self {
            store: Arc::new(store),
            config,
            sessions: HashMap::new(),
        }
    }
}

/// Request from a client
#[derive(Debug, Deserialize)]
#[serde(tag = "method")]
#[serde(rename_all = "snake_case")]
enum Request {
    Open { path: String },
    Close { path: String },
    List { path: String },
    Add { path: String, cue: CueSpec },
    AddBatch {
        path: String,
        cues: Vec<CueSpec>,
        #[serde(default)]
        validate: bool,
    },
    Update { path: String, id: u8, fields: CueUpdate },
    Remove { path: String, id: u8 },
    Nearest { path: String, position_ms: f64 },
    Optimize { path: String, strategy: OptimizeStrategy },
    Stats { path: String },
    Warnings { path: String },
    Export { path: String },
    Import { path: String, document: CueDocument },
    SetBeatgrid { path: String, beats: Vec<f64> },
    Save { path: String },
    Read { path: String },
    ReadBatch { dir: String },
    CleanupBackups { dir: String, max_age_secs: u64 },
    CacheStats,
    CacheClear,
    Status,
}

/// Response to a client
#[derive(Debug, Serialize)]
struct Response {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

impl Response {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: None,
        }
    }

    fn ok_with_data(message: impl Into<String>, data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                success: true,
                message: Some(message.into()),
                data: Some(data),
            },
            Err(e) => Self::error(format!("Failed to encode response: {}", e)),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }

    fn not_open(path: &str) -> Self {
        Self::error(format!("Track not open: {}", path))
    }
}

/// Run the server
pub async fn run(state: Arc<Mutex<ServerState>>) -> anyhow::Result<()> {
    let bind_addr = state.lock().await.config.bind_addr.clone();

    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Server listening on {}", bind_addr);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Client connected from {}", addr);
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, state).await {
                        error!("Client error: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("Accept error: {}", e);
            }
        }
    }
}

/// Flush every open session; called on shutdown
pub async fn close_all(state: &Arc<Mutex<ServerState>>) {
    let sessions: Vec<Session> = state.lock().await.sessions.drain().map(|(_, s)| s).collect();
    let count = sessions.len();
    for session in sessions {
        session.close().await;
    }
    info!("Closed {} open tracks", count);
}

/// Handle a single client connection
async fn handle_client(stream: TcpStream, state: Arc<Mutex<ServerState>>) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        debug!("Received: {}", line.trim());

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => handle_request(request, &state).await,
            Err(e) => Response::error(format!("Invalid request: {}", e)),
        };

        let response_json = serde_json::to_string(&response)?;
        writer.write_all(response_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

/// Run a store call on the blocking pool
async fn blocking<T, F>(store: Arc<MetadataStore>, f: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce(&MetadataStore) -> cuepoint_core::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || f(&store)).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(e) => Err(format!("Worker failed: {}", e)),
    }
}

/// Process a request
async fn handle_request(request: Request, state: &Arc<Mutex<ServerState>>) -> Response {
    match request {
        Request::Open { path } => {
            let (config, store) = {
                let guard = state.lock().await;
                if let Some(session) = guard.sessions.get(&path) {
                    return Response::ok_with_data("Track already open", session.registry.cues());
                }
                (guard.config.clone(), Arc::clone(&guard.store))
            };

            let read_path = PathBuf::from(&path);
            let mut metadata = match blocking(Arc::clone(&store), move |s| s.read(&read_path, true)).await {
                Ok(metadata) => metadata,
                Err(e) => return Response::error(format!("Failed to open {}: {}", path, e)),
            };
            metadata.path = path.clone();

            // Another client may have opened the track during the read
            let mut guard = state.lock().await;
            let response = match guard.sessions.entry(path.clone()) {
                Entry::Occupied(entry) => {
                    Response::ok_with_data("Track already open", entry.get().registry.cues())
                }
                Entry::Vacant(slot) => match Session::open(&config, &store, metadata) {
                    Ok(session) => {
                        let session = slot.insert(session);
                        let cues = session.registry.cues();
                        let repaired = session.metadata.repairs.len();
                        info!("Opened {} ({} cues)", path, cues.len());
                        let message = if repaired > 0 {
                            format!("Opened {} with {} cues, {} values repaired", path, cues.len(), repaired)
                        } else {
                            format!("Opened {} with {} cues", path, cues.len())
                        };
                        Response::ok_with_data(message, cues)
                    }
                    Err(e) => Response::error(format!("Failed to open {}: {}", path, e)),
                },
            };
            response
        }

        Request::Close { path } => {
            let session = state.lock().await.sessions.remove(&path);
            match session {
                Some(session) => {
                    session.close().await;
                    Response::ok(format!("Closed {}", path))
                }
                None => Response::not_open(&path),
            }
        }

        Request::List { path } => {
            let guard = state.lock().await;
            match guard.sessions.get(&path) {
                Some(session) => Response::ok_with_data(
                    format!("{} cues", session.registry.len()),
                    session.registry.cues(),
                ),
                None => Response::not_open(&path),
            }
        }

        Request::Add { path, cue } => with_session(state, &path, |session| {
            session
                .registry
                .add(cue)
                .map(|cue| Response::ok_with_data(format!("Added cue {}", cue.id), cue))
        })
        .await,

        Request::AddBatch {
            path,
            cues,
            validate,
        } => with_session(state, &path, |session| {
            let result = session.registry.add_batch(cues, validate);
            Ok(Response::ok_with_data(
                format!("Added {} cues, {} failed", result.added.len(), result.failed.len()),
                result,
            ))
        })
        .await,

        Request::Update { path, id, fields } => with_session(state, &path, |session| {
            session
                .registry
                .update(id, fields)
                .map(|cue| Response::ok_with_data(format!("Updated cue {}", cue.id), cue))
        })
        .await,

        Request::Remove { path, id } => with_session(state, &path, |session| {
            session
                .registry
                .remove(id)
                .map(|cue| Response::ok_with_data(format!("Removed cue {}", cue.id), cue))
        })
        .await,

        Request::Nearest { path, position_ms } => with_session(state, &path, |session| {
            Ok(match session.registry.find_nearest(position_ms) {
                Some(cue) => Response::ok_with_data(format!("Cue {}", cue.id), cue),
                None => Response::ok("No cues"),
            })
        })
        .await,

        Request::Optimize { path, strategy } => with_session(state, &path, |session| {
            let report = session.registry.optimize(strategy);
            Ok(Response::ok_with_data(
                format!("Moved {} cues, skipped {}", report.moved.len(), report.skipped.len()),
                report,
            ))
        })
        .await,

        Request::Stats { path } => with_session(state, &path, |session| {
            Ok(Response::ok_with_data("Cue statistics", session.registry.statistics()))
        })
        .await,

        Request::Warnings { path } => with_session(state, &path, |session| {
            let warnings = session.registry.warnings();
            Ok(Response::ok_with_data(format!("{} conflict warnings", warnings.len()), warnings))
        })
        .await,

        Request::Export { path } => with_session(state, &path, |session| {
            Ok(Response::ok_with_data("Exported cues", session.registry.export_document()))
        })
        .await,

        Request::Import { path, document } => with_session(state, &path, |session| {
            session
                .registry
                .import_document(document)
                .map(|count| Response::ok(format!("Imported {} cues", count)))
        })
        .await,

        Request::SetBeatgrid { path, beats } => with_session(state, &path, |session| {
            let grid = if beats.is_empty() {
                None
            } else {
                let min_spacing = session.registry.config().min_beat_spacing_ms;
                Some(Beatgrid::from_beats(&beats, min_spacing))
            };
            let summary = grid
                .as_ref()
                .map(|g| format!("Beatgrid set: {} beats at {:.2} BPM", g.len(), g.bpm))
                .unwrap_or_else(|| "Beatgrid cleared".to_string());
            session.registry.set_beatgrid(grid).map(|_| Response::ok(summary))
        })
        .await,

        Request::Save { path } => {
            let (store, snapshot) = {
                let guard = state.lock().await;
                let Some(session) = guard.sessions.get(&path) else {
                    return Response::not_open(&path);
                };
                if let Some(handle) = &session.autosave {
                    handle.cancel();
                }
                (Arc::clone(&guard.store), session.registry.snapshot())
            };

            let result = blocking(store, move |s| {
                s.save_cues(Path::new(&path), &snapshot.cues, snapshot.beatgrid.as_ref())
            })
            .await;
            match result {
                Ok(report) => Response::ok_with_data(format!("Saved {:?}", report.path), report),
                Err(e) => Response::error(format!("Save failed: {}", e)),
            }
        }

        Request::Read { path } => {
            let store = Arc::clone(&state.lock().await.store);
            match blocking(store, move |s| s.read(Path::new(&path), true)).await {
                Ok(metadata) => Response::ok_with_data(format!("Read {}", metadata.path), metadata),
                Err(e) => Response::error(format!("Read failed: {}", e)),
            }
        }

        Request::ReadBatch { dir } => {
            let (store, workers) = {
                let guard = state.lock().await;
                (Arc::clone(&guard.store), guard.config.max_workers)
            };
            let result = blocking(store, move |s| {
                let paths = audio_files(Path::new(&dir));
                let results = s.read_batch(&paths, workers);
                Ok(paths
                    .iter()
                    .filter_map(|p| results.get(p).map(|r| (p, r)))
                    .map(|(p, r)| match r {
                        Ok(meta) => serde_json::json!({
                            "path": p,
                            "ok": true,
                            "title": meta.title,
                            "artist": meta.artist,
                            "cues": meta.cues.len(),
                        }),
                        Err(e) => serde_json::json!({
                            "path": p,
                            "ok": false,
                            "error": e.to_string(),
                        }),
                    })
                    .collect::<Vec<_>>())
            })
            .await;
            match result {
                Ok(tracks) => {
                    let failed = tracks.iter().filter(|t| t["ok"] == false).count();
                    Response::ok_with_data(format!("Read {} files, {} failed", tracks.len(), failed), tracks)
                }
                Err(e) => Response::error(format!("Batch read failed: {}", e)),
            }
        }

        Request::CleanupBackups { dir, max_age_secs } => {
            let store = Arc::clone(&state.lock().await.store);
            let max_age = Duration::from_secs(max_age_secs);
            match blocking(store, move |s| s.cleanup_backups(Path::new(&dir), max_age)).await {
                Ok(removed) => Response::ok(format!("Removed {} backups", removed)),
                Err(e) => Response::error(format!("Cleanup failed: {}", e)),
            }
        }

        Request::CacheStats => {
            let guard = state.lock().await;
            Response::ok_with_data("Cache statistics", guard.store.cache_stats())
        }

        Request::CacheClear => {
            let guard = state.lock().await;
            guard.store.clear_cache();
            Response::ok("Cache cleared")
        }

        Request::Status => {
            let guard = state.lock().await;
            Response::ok_with_data(
                "Server running",
                serde_json::json!({
                    "open_tracks": guard.sessions.keys().collect::<Vec<_>>(),
                    "auto_save": guard.config.engine.auto_save,
                    "cache": guard.store.cache_stats(),
                }),
            )
        }
    }
}

/// Run a registry operation against an open session
async fn with_session<F>(state: &Arc<Mutex<ServerState>>, path: &str, f: F) -> Response
where
    F: FnOnce(&mut Session) -> cuepoint_core::Result<Response>,
{
    let mut guard = state.lock().await;
    let Some(session) = guard.sessions.get_mut(path) else {
        return Response::not_open(path);
    };
    match f(session) {
        Ok(response) => response,
        Err(e) if e.is_validation() => Response::error(format!("Rejected: {}", e)),
        Err(e) => Response::error(e.to_string()),
    }
}
