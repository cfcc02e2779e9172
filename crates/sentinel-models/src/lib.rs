//! sentinel-models — ONNX model manifest and integrity verification.
//!
//! The daemon refuses to run inference on silently corrupted or swapped
//! model files: every model is pinned by SHA-256 and verified before the
//! engine loads it.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Model file descriptor: expected filename, SHA-256 checksum, role.
pub struct ModelFile {
    pub name: &'static str,
    pub sha256: &'static str,
    pub role: &'static str,
}

/// The four models the perception pipeline loads.
pub const MODELS: &[ModelFile] = &[
    ModelFile {
        name: "face_detection_yunet_2023mar.onnx",
        sha256: "8f2383e4dd3cfbb4553ea8718107fc0423210dc964f9f4280604804ed2552fa4",
        role: "face detection",
    },
    ModelFile {
        name: "face_recognition_sface_2021dec.onnx",
        sha256: "0ba7bde0d45af78101098cc3351d6d614c0bf8a82e2f1b34f29bf9f5c31c17f0",
        role: "face recognition",
    },
    ModelFile {
        name: "minifasnet_v2.onnx",
        sha256: "3cbf4cd76f1b5ccc2f370df93d13916f9c0b41b953df14ad33be828e1f4d3b03",
        role: "anti-spoofing",
    },
    ModelFile {
        name: "face_mesh_attention.onnx",
        sha256: "f0a4b40d57b88ae8b08de28d3a7c81f8e157fc4eb4c34e208aeb4fc836f44acd",
        role: "dense landmarks",
    },
];

#[derive(Error, Debug)]
pub enum ModelIntegrityError {
    #[error("model file not found: {name} ({path})")]
    MissingModel { name: &'static str, path: PathBuf },

    #[error("failed to open model file: {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read model file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "model checksum mismatch for {name} ({path})\n  expected: {expected}\n  got:      {got}"
    )]
    ChecksumMismatch {
        name: &'static str,
        path: PathBuf,
        expected: String,
        got: String,
    },
}

/// Compute SHA-256 hex digest of a file.
pub fn sha256_file_hex(path: &Path) -> Result<String, ModelIntegrityError> {
    let mut file = fs::File::open(path).map_err(|source| ModelIntegrityError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = file
            .read(&mut buf)
            .map_err(|source| ModelIntegrityError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

pub fn verify_file_sha256(
    name: &'static str,
    path: &Path,
    expected_sha256: &str,
) -> Result<(), ModelIntegrityError> {
    if !path.exists() {
        return Err(ModelIntegrityError::MissingModel {
            name,
            path: path.to_path_buf(),
        });
    }

    let digest = sha256_file_hex(path)?;
    if digest != expected_sha256 {
        return Err(ModelIntegrityError::ChecksumMismatch {
            name,
            path: path.to_path_buf(),
            expected: expected_sha256.to_string(),
            got: digest,
        });
    }

    Ok(())
}

/// Verify every model in the manifest against `model_dir`.
pub fn verify_models_dir(model_dir: &Path) -> Result<(), ModelIntegrityError> {
    for model in MODELS {
        let path = model_dir.join(model.name);
        verify_file_sha256(model.name, &path, model.sha256)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_file_sha256_rejects_missing() {
        let tmp = std::env::temp_dir().join(format!(
            "sentinel-models-test-missing-{}",
            std::process::id()
        ));
        let path = tmp.join("nope.onnx");

        let err = verify_file_sha256("nope.onnx", &path, "00").unwrap_err();
        assert!(matches!(err, ModelIntegrityError::MissingModel { .. }));
    }

    #[test]
    fn verify_file_sha256_rejects_mismatch() {
        let dir = std::env::temp_dir().join(format!(
            "sentinel-models-test-mismatch-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.onnx");
        fs::write(&path, b"hello").unwrap();

        let err = verify_file_sha256("model.onnx", &path, "00").unwrap_err();
        assert!(matches!(err, ModelIntegrityError::ChecksumMismatch { .. }));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn verify_file_sha256_accepts_match() {
        let dir = std::env::temp_dir().join(format!(
            "sentinel-models-test-match-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.onnx");
        fs::write(&path, b"hello").unwrap();

        let digest = sha256_file_hex(&path).unwrap();
        verify_file_sha256("model.onnx", &path, &digest).unwrap();

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn verify_models_dir_reports_missing() {
        let dir = std::env::temp_dir().join(format!(
            "sentinel-models-test-dir-missing-{}",
            std::process::id()
        ));

        let err = verify_models_dir(&dir).unwrap_err();
        assert!(matches!(err, ModelIntegrityError::MissingModel { .. }));
    }

    #[test]
    fn manifest_covers_all_pipeline_roles() {
        let roles: Vec<&str> = MODELS.iter().map(|m| m.role).collect();
        for role in [
            "face detection",
            "face recognition",
            "anti-spoofing",
            "dense landmarks",
        ] {
            assert!(roles.contains(&role), "missing model role: {role}");
        }
    }
}
