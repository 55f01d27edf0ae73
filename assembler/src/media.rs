use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MediaToolError {
    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },
    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },
}

/// External repair/concat tool. Both operations are opaque, potentially slow
/// subprocesses; the worker only cares about success or failure.
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Rewrite one fragment into a consistent, seekable container.
    async fn repair(&self, input: &Path, output: &Path) -> Result<(), MediaToolError>;

    /// Stream-copy every manifest entry into one output file. The manifest
    /// lists file names relative to `workdir`.
    async fn concat(
        &self,
        manifest: &Path,
        workdir: &Path,
        output: &Path,
    ) -> Result<(), MediaToolError>;
}

/// Production tool: ffmpeg invoked with fixed arguments, stream copy only,
/// never a re-encode.
#[derive(Debug, Clone)]
pub struct FfmpegTool {
    binary: String,
}

impl FfmpegTool {
    pub fn new() -> Self {
        Self {
            binary: std::env::var("FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".to_string()),
        }
    }

    async fn run(
        &self,
        args: &[&std::ffi::OsStr],
        workdir: Option<&Path>,
    ) -> Result<(), MediaToolError> {
        let mut command = tokio::process::Command::new(&self.binary);
        command.args(args).stdout(Stdio::null()).stderr(Stdio::piped());
        if let Some(dir) = workdir {
            command.current_dir(dir);
        }

        debug!(tool = %self.binary, ?args, "invoking media tool");
        let output = command.output().await.map_err(|source| MediaToolError::Spawn {
            tool: self.binary.clone(),
            source,
        })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(MediaToolError::Failed {
                tool: self.binary.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

impl Default for FfmpegTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaTool for FfmpegTool {
    async fn repair(&self, input: &Path, output: &Path) -> Result<(), MediaToolError> {
        self.run(
            &[
                "-y".as_ref(),
                "-i".as_ref(),
                input.as_os_str(),
                "-c".as_ref(),
                "copy".as_ref(),
                output.as_os_str(),
            ],
            None,
        )
        .await
    }

    async fn concat(
        &self,
        manifest: &Path,
        workdir: &Path,
        output: &Path,
    ) -> Result<(), MediaToolError> {
        // Runs with the staging directory as cwd so the relative names in
        // the manifest resolve, mirroring how the concat list is written.
        self.run(
            &[
                "-y".as_ref(),
                "-f".as_ref(),
                "concat".as_ref(),
                "-safe".as_ref(),
                "0".as_ref(),
                "-i".as_ref(),
                manifest.as_os_str(),
                "-c".as_ref(),
                "copy".as_ref(),
                output.as_os_str(),
            ],
            Some(workdir),
        )
        .await
    }
}
