use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use super::{AudioExtractor, CollaboratorError, ExtractedAudio};

/// Audio extraction through an `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct FfmpegAudioExtractor {
    binary: PathBuf,
}

impl FfmpegAudioExtractor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for FfmpegAudioExtractor {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

fn sidecar(destination: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = destination.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

#[async_trait]
impl AudioExtractor for FfmpegAudioExtractor {
    async fn extract(
        &self,
        video: &Path,
        destination: &Path,
    ) -> Result<ExtractedAudio, CollaboratorError> {
        let output = Command::new(&self.binary)
            .arg("-y")
            .arg("-i")
            .arg(video)
            .args(["-vn", "-ac", "1", "-ar", "16000", "-acodec", "pcm_s16le"])
            .arg(destination)
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout_log = sidecar(destination, ".out");
        let stderr_log = sidecar(destination, ".err");
        tokio::fs::write(&stdout_log, &output.stdout).await?;
        tokio::fs::write(&stderr_log, &output.stderr).await?;

        if !output.status.success() {
            let tail = String::from_utf8_lossy(&output.stderr)
                .lines()
                .last()
                .unwrap_or_default()
                .to_string();
            return Err(CollaboratorError::upstream(
                "ffmpeg",
                format!("{} ({tail})", output.status),
            ));
        }

        Ok(ExtractedAudio {
            audio: destination.to_path_buf(),
            stdout_log,
            stderr_log,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecars_extend_the_destination_name() {
        let dest = Path::new("/scratch/abc_audio.wav");
        assert_eq!(sidecar(dest, ".err"), PathBuf::from("/scratch/abc_audio.wav.err"));
    }
}
