//! Model manifest and integrity checks.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// One ONNX model the analyzer needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelFile {
    pub name: &'static str,
    pub url: &'static str,
    /// Pinned SHA-256; `None` for models distributed without a published digest.
    pub sha256: Option<&'static str>,
}

pub const DETECTOR: ModelFile = ModelFile {
    name: "det_10g.onnx",
    url: "https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/det_10g.onnx",
    sha256: Some("5838f7fe053675b1c7a08b633df49e7af5495cee0493c7dcf6697200b85b5b91"),
};

pub const LANDMARKS: ModelFile = ModelFile {
    name: "1k3d68.onnx",
    url: "https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/1k3d68.onnx",
    sha256: None,
};

pub const RECOGNIZER: ModelFile = ModelFile {
    name: "w600k_r50.onnx",
    url: "https://huggingface.co/public-data/insightface/resolve/main/models/buffalo_l/w600k_r50.onnx",
    sha256: Some("4c06341c33c2ca1f86781dab0e829f88ad5b64be9fba56e56bc9ebdefc619e43"),
};

pub const MODELS: [ModelFile; 3] = [DETECTOR, LANDMARKS, RECOGNIZER];

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {name} ({})", path.display())]
    Missing { name: &'static str, path: PathBuf },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: &'static str,
        expected: String,
        actual: String,
    },
}

/// Resolved on-disk locations of the three models.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub landmarks: PathBuf,
    pub recognizer: PathBuf,
}

impl ModelPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            detector: dir.join(DETECTOR.name),
            landmarks: dir.join(LANDMARKS.name),
            recognizer: dir.join(RECOGNIZER.name),
        }
    }

    fn entries(&self) -> [(&ModelFile, &Path); 3] {
        [
            (&DETECTOR, self.detector.as_path()),
            (&LANDMARKS, self.landmarks.as_path()),
            (&RECOGNIZER, self.recognizer.as_path()),
        ]
    }

    /// Every file exists; checksums are checked too when `verify` is set.
    pub fn check(&self, verify: bool) -> Result<(), ModelError> {
        for (model, path) in self.entries() {
            if !path.exists() {
                return Err(ModelError::Missing {
                    name: model.name,
                    path: path.to_path_buf(),
                });
            }
            if verify {
                verify_model(model, path)?;
            }
        }
        Ok(())
    }
}

/// `$XDG_DATA_HOME/facegate/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    let data_home = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("/usr/share"));
    data_home.join("facegate").join("models")
}

pub fn sha256_file_hex(path: &Path) -> Result<String, ModelError> {
    let io_err = |source| ModelError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare a model file against its pinned digest. Unpinned models pass.
pub fn verify_model(model: &ModelFile, path: &Path) -> Result<(), ModelError> {
    let Some(expected) = model.sha256 else {
        tracing::debug!(model = model.name, "no pinned checksum; skipping");
        return Ok(());
    };
    let actual = sha256_file_hex(path)?;
    if actual != expected {
        return Err(ModelError::ChecksumMismatch {
            name: model.name,
            expected: expected.to_string(),
            actual,
        });
    }
    tracing::debug!(model = model.name, "checksum verified");
    Ok(())
}
