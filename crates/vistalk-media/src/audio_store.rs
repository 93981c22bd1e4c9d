//! Published audio files served back to clients by name.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use vistalk_core::types::AudioArtifact;

#[derive(Debug, thiserror::Error)]
pub enum AudioStoreError {
    #[error("invalid audio file name: {0}")]
    InvalidName(String),

    #[error("audio file not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Directory of synthesized WAV files.
///
/// Files are written to a temp file in the same directory and renamed into
/// place, so a reader never observes a partial file.
#[derive(Debug, Clone)]
pub struct AudioStore {
    dir: PathBuf,
}

impl AudioStore {
    /// Create the store, making the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a successful artifact and return its file name.
    pub fn publish(&self, artifact: &AudioArtifact) -> Result<String, AudioStoreError> {
        let name = output_filename(artifact.encoding.extension());
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&artifact.bytes)?;
        tmp.flush()?;
        tmp.persist(self.dir.join(&name)).map_err(|e| e.error)?;
        debug!(name, bytes = artifact.bytes.len(), "Audio published");
        Ok(name)
    }

    /// Read a published file by name.
    pub fn read(&self, name: &str) -> Result<Vec<u8>, AudioStoreError> {
        if !is_valid_name(name) {
            return Err(AudioStoreError::InvalidName(name.to_string()));
        }
        match std::fs::read(self.dir.join(name)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(AudioStoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+\.wav$").expect("valid audio name pattern"));

/// Only plain `*.wav` names are served; anything with a path separator or
/// other punctuation is rejected before touching the filesystem.
pub fn is_valid_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

fn output_filename(ext: &str) -> String {
    let ts = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("tts_{ts}_{}.{ext}", &id[..8])
}
