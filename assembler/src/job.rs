use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use session_manager::{SessionError, SharedSessions};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::media::{MediaTool, MediaToolError};
use crate::staging::{ChunkStore, MANIFEST_NAME};

const REPAIRED_PREFIX: &str = "repaired_";

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("no fragments appeared within the wait window")]
    NoFragments,
    #[error("repair of fragment {index} failed: {source}")]
    RepairFailed {
        index: u64,
        source: MediaToolError,
    },
    #[error("concatenation failed: {0}")]
    ConcatFailed(#[source] MediaToolError),
    #[error("session record vanished; recording kept for manual recovery")]
    SessionMissing,
    #[error("staging I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// How long to keep polling the staging area for fragments that are still
/// in flight from the final upload request.
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Assemble one session's fragments into the final recording.
///
/// Nothing mutates session state until the very end, so a failed run can be
/// retried from scratch: fragments stay on disk after every error path, and
/// only a fully written output transitions the session to recorded.
pub async fn assemble(
    session_id: &str,
    store: &ChunkStore,
    output_dir: &Path,
    wait: WaitPolicy,
    tool: &Arc<dyn MediaTool>,
    sessions: &SharedSessions,
) -> Result<PathBuf, AssemblyError> {
    let fragments = wait_for_fragments(session_id, store, wait).await?;
    let session_dir = store.session_dir(session_id);

    // Repair every fragment before touching the output; a single bad
    // fragment fails the whole job with the originals untouched.
    let mut repaired = Vec::with_capacity(fragments.len());
    for (index, path) in &fragments {
        let repaired_path = repaired_path(&session_dir, path);
        if let Err(source) = tool.repair(path, &repaired_path).await {
            discard(&repaired).await;
            let _ = tokio::fs::remove_file(&repaired_path).await;
            return Err(AssemblyError::RepairFailed {
                index: *index,
                source,
            });
        }
        repaired.push(repaired_path);
    }

    tokio::fs::create_dir_all(output_dir).await?;
    let output = output_dir.join(format!("{session_id}.webm"));

    if let [only] = repaired.as_slice() {
        // Concatenating one fragment is a degenerate case; copy it instead
        // of invoking the concat tool at all.
        tokio::fs::copy(only, &output).await?;
    } else {
        let manifest = session_dir.join(MANIFEST_NAME);
        write_manifest(&manifest, &repaired).await?;

        if let Err(err) = tool.concat(&manifest, &session_dir, &output).await {
            let _ = tokio::fs::remove_file(&output).await;
            let _ = tokio::fs::remove_file(&manifest).await;
            discard(&repaired).await;
            return Err(AssemblyError::ConcatFailed(err));
        }
    }

    let recording_path = output.to_string_lossy().into_owned();
    {
        let mut state = sessions.write().await;
        match state.mark_recorded(session_id, &recording_path).await {
            Ok(_) => {}
            Err(SessionError::SessionMissing) | Err(SessionError::NotFound) => {
                // The output file is already good; never delete a finished
                // recording because the bookkeeping failed.
                return Err(AssemblyError::SessionMissing);
            }
            Err(err) => {
                warn!(%err, session_id, "unexpected session error while attaching recording");
                return Err(AssemblyError::SessionMissing);
            }
        }
    }

    cleanup_staging(session_id, store, &fragments, &repaired).await;

    common_net::metrics::assembly_metrics().inc_fragments_merged(fragments.len() as u64);
    info!(
        session_id,
        fragments = fragments.len(),
        recording = %recording_path,
        "assembly finished"
    );
    Ok(output)
}

async fn wait_for_fragments(
    session_id: &str,
    store: &ChunkStore,
    wait: WaitPolicy,
) -> Result<Vec<(u64, PathBuf)>, AssemblyError> {
    let deadline = Instant::now() + wait.timeout;
    loop {
        let fragments = store.list_fragments(session_id).await?;
        if !fragments.is_empty() {
            return Ok(fragments);
        }
        if Instant::now() >= deadline {
            return Err(AssemblyError::NoFragments);
        }
        tokio::time::sleep(wait.poll_interval).await;
    }
}

fn repaired_path(session_dir: &Path, original: &Path) -> PathBuf {
    let name = original
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("chunk");
    session_dir.join(format!("{REPAIRED_PREFIX}{name}"))
}

async fn write_manifest(manifest: &Path, repaired: &[PathBuf]) -> Result<(), std::io::Error> {
    let mut lines = String::new();
    for path in repaired {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            lines.push_str(&format!("file '{name}'\n"));
        }
    }
    tokio::fs::write(manifest, lines).await
}

async fn discard(paths: &[PathBuf]) {
    for path in paths {
        let _ = tokio::fs::remove_file(path).await;
    }
}

/// Best-effort removal of the staging residue after a successful run.
/// Anything left behind is picked up by an out-of-band sweep later.
async fn cleanup_staging(
    session_id: &str,
    store: &ChunkStore,
    fragments: &[(u64, PathBuf)],
    repaired: &[PathBuf],
) {
    for (_, path) in fragments {
        if let Err(err) = tokio::fs::remove_file(path).await {
            warn!(%err, path = %path.display(), "could not remove fragment");
        }
    }
    discard(repaired).await;

    let session_dir = store.session_dir(session_id);
    let manifest = session_dir.join(MANIFEST_NAME);
    match tokio::fs::remove_file(&manifest).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(%err, "could not remove concat manifest"),
    }

    if let Err(err) = tokio::fs::remove_dir(&session_dir).await {
        warn!(%err, session_id, "staging directory left behind");
    }
}
