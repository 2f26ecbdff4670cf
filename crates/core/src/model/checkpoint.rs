//! On-disk checkpoint layout.
//!
//! A checkpoint directory holds one parameter file plus `manifest.json`
//! recording the architecture, format version and SHA256 of the parameters.
//! Saving overwrites the previous checkpoint in place. Both files are staged
//! as `.part` siblings and renamed only once both are fully written, so a
//! failed write leaves the previous checkpoint loadable. A crash between the
//! two renames still pairs new parameters with the old manifest, which the
//! SHA256 check then rejects on load.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub architecture: String,
    pub format_version: u32,
    pub params_file: String,
    pub sha256: String,
    pub saved_at: String,
}

/// Identity a checkpoint must match to be loadable.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointSpec<'a> {
    pub architecture: &'a str,
    pub format_version: u32,
    pub params_file: &'a str,
}

pub fn params_path(dir: &Path, spec: &CheckpointSpec<'_>) -> PathBuf {
    dir.join(spec.params_file)
}

/// Write `params` and a fresh manifest into `dir`.
pub fn write_checkpoint(dir: &Path, spec: &CheckpointSpec<'_>, params: &[u8]) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create checkpoint directory: {}", dir.display()))?;

    let manifest = CheckpointManifest {
        architecture: spec.architecture.to_string(),
        format_version: spec.format_version,
        params_file: spec.params_file.to_string(),
        sha256: sha256_bytes(params),
        saved_at: chrono::Utc::now().to_rfc3339(),
    };
    let encoded =
        serde_json::to_vec_pretty(&manifest).context("Failed to serialize checkpoint manifest")?;

    let params_part = stage(dir, spec.params_file, params)?;
    let manifest_part = match stage(dir, MANIFEST_FILE_NAME, &encoded) {
        Ok(path) => path,
        Err(err) => {
            let _ = fs::remove_file(&params_part);
            return Err(err);
        }
    };
    commit(&params_part, &params_path(dir, spec))?;
    commit(&manifest_part, &dir.join(MANIFEST_FILE_NAME))?;

    info!(
        dir = %dir.display(),
        architecture = spec.architecture,
        bytes = params.len(),
        "Checkpoint saved"
    );
    Ok(())
}

fn part_path(dir: &Path, file_name: &str) -> PathBuf {
    dir.join(format!("{file_name}.part"))
}

/// Write `bytes` to `<file_name>.part` in `dir` and sync it.
fn stage(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let tmp_path = part_path(dir, file_name);
    let mut tmp_file = fs::File::create(&tmp_path)
        .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;
    if let Err(err) = tmp_file
        .write_all(bytes)
        .and_then(|_| tmp_file.sync_all())
        .with_context(|| format!("Failed to write checkpoint: {}", tmp_path.display()))
    {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(tmp_path)
}

fn commit(tmp_path: &Path, final_path: &Path) -> Result<()> {
    fs::rename(tmp_path, final_path).with_context(|| {
        format!(
            "Failed to move {} → {}",
            tmp_path.display(),
            final_path.display()
        )
    })
}

/// Read and verify the parameter bytes stored in `dir`.
pub fn read_checkpoint(dir: &Path, spec: &CheckpointSpec<'_>) -> Result<Vec<u8>> {
    let manifest = read_manifest(dir)?;

    if manifest.architecture != spec.architecture {
        bail!(
            "Checkpoint in {} was saved by architecture '{}', expected '{}'",
            dir.display(),
            manifest.architecture,
            spec.architecture
        );
    }
    if manifest.format_version != spec.format_version {
        bail!(
            "Checkpoint in {} has format version {}, expected {}",
            dir.display(),
            manifest.format_version,
            spec.format_version
        );
    }

    let path = dir.join(&manifest.params_file);
    let mut params = Vec::new();
    fs::File::open(&path)
        .with_context(|| format!("Cannot open {}", path.display()))?
        .read_to_end(&mut params)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let actual = sha256_bytes(&params);
    if actual != manifest.sha256 {
        bail!(
            "SHA256 mismatch for {}: expected {}, got {actual}",
            path.display(),
            manifest.sha256
        );
    }

    debug!(path = %path.display(), bytes = params.len(), "Checkpoint verified");
    Ok(params)
}

pub fn read_manifest(dir: &Path) -> Result<CheckpointManifest> {
    if !dir.is_dir() {
        bail!("Checkpoint directory does not exist: {}", dir.display());
    }
    let manifest_path = dir.join(MANIFEST_FILE_NAME);
    let raw = fs::read_to_string(&manifest_path)
        .with_context(|| format!("Missing checkpoint manifest: {}", manifest_path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse checkpoint manifest: {}", manifest_path.display()))
}

fn sha256_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SPEC: CheckpointSpec<'static> = CheckpointSpec {
        architecture: "test-net",
        format_version: 2,
        params_file: "params.bin",
    };

    #[test]
    fn roundtrip_returns_written_bytes() {
        let dir = tempdir().unwrap();
        let ckpt = dir.path().join("train_log");
        write_checkpoint(&ckpt, &SPEC, b"weights").unwrap();

        assert!(ckpt.join("params.bin").exists());
        assert!(!ckpt.join("params.bin.part").exists());
        assert!(!ckpt.join("manifest.json.part").exists());
        assert_eq!(read_checkpoint(&ckpt, &SPEC).unwrap(), b"weights");

        let manifest = read_manifest(&ckpt).unwrap();
        assert_eq!(manifest.architecture, "test-net");
        assert_eq!(manifest.sha256.len(), 64);
    }

    #[test]
    fn second_save_overwrites_first() {
        let dir = tempdir().unwrap();
        write_checkpoint(dir.path(), &SPEC, b"old").unwrap();
        write_checkpoint(dir.path(), &SPEC, b"new").unwrap();
        assert_eq!(read_checkpoint(dir.path(), &SPEC).unwrap(), b"new");
    }

    #[test]
    fn failed_manifest_write_keeps_previous_checkpoint() {
        let dir = tempdir().unwrap();
        write_checkpoint(dir.path(), &SPEC, b"old").unwrap();
        // A directory where the staged manifest would go makes staging fail.
        fs::create_dir(dir.path().join("manifest.json.part")).unwrap();

        assert!(write_checkpoint(dir.path(), &SPEC, b"new").is_err());
        assert!(!dir.path().join("params.bin.part").exists());
        assert_eq!(read_checkpoint(dir.path(), &SPEC).unwrap(), b"old");
    }

    #[test]
    fn missing_directory_is_reported() {
        let dir = tempdir().unwrap();
        let err = read_checkpoint(&dir.path().join("absent"), &SPEC).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn architecture_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        write_checkpoint(dir.path(), &SPEC, b"weights").unwrap();
        let other = CheckpointSpec {
            architecture: "other-net",
            ..SPEC
        };
        let err = read_checkpoint(dir.path(), &other).unwrap_err();
        assert!(err.to_string().contains("expected 'other-net'"));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        write_checkpoint(dir.path(), &SPEC, b"weights").unwrap();
        let newer = CheckpointSpec {
            format_version: 3,
            ..SPEC
        };
        assert!(read_checkpoint(dir.path(), &newer).is_err());
    }

    #[test]
    fn tampered_params_fail_verification() {
        let dir = tempdir().unwrap();
        write_checkpoint(dir.path(), &SPEC, b"weights").unwrap();
        fs::write(dir.path().join("params.bin"), b"tampered").unwrap();
        let err = read_checkpoint(dir.path(), &SPEC).unwrap_err();
        assert!(err.to_string().contains("SHA256 mismatch"));
    }
}
