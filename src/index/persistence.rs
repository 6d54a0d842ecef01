//! On-disk cache of a built embedding index.
//!
//! The cache stores the catalogue fingerprint it was built from; a cache is
//! only reused when that fingerprint, the embedder identity and the row names
//! all match the live catalogue.

use crate::error::{AppError, Result};
use ndarray::Array2;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::{Path, PathBuf};

/// Cache file format version. Increment when format changes.
const CACHE_VERSION: u32 = 1;

/// Magic bytes to identify valid cache files.
const CACHE_MAGIC: &[u8; 8] = b"ACTUATOR";

/// Upper bound on any length-prefixed string in the file.
const MAX_STRING_LEN: usize = 64 * 1024;

/// Widest embedding a cache file may declare.
const MAX_DIMENSION: usize = 64 * 1024;

/// A persisted index: fingerprint, embedder identity, row names and vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexCache {
    pub version: u32,
    /// SHA-256 of the catalogue the index was built from
    pub fingerprint: [u8; 32],
    pub embedder_identity: String,
    /// Row names, in catalogue order
    pub names: Vec<String>,
    /// Embeddings matrix (names.len() × dimension)
    pub embeddings: Array2<f32>,
}

fn persist_err(what: &str, e: impl std::fmt::Display) -> AppError {
    AppError::PersistenceError(format!("{}: {}", what, e))
}

impl IndexCache {
    pub fn new(
        fingerprint: [u8; 32],
        embedder_identity: &str,
        names: Vec<String>,
        embeddings: Array2<f32>,
    ) -> Self {
        Self {
            version: CACHE_VERSION,
            fingerprint,
            embedder_identity: embedder_identity.to_string(),
            names,
            embeddings,
        }
    }

    /// Save cache to a binary file, replacing any previous cache atomically.
    ///
    /// File format:
    /// - 8 bytes: magic "ACTUATOR"
    /// - 4 bytes: version (u32 LE)
    /// - 32 bytes: catalogue fingerprint
    /// - 4 + n bytes: embedder identity (u32 LE length, UTF-8)
    /// - 8 bytes: num_rows (u64 LE)
    /// - 8 bytes: dimension (u64 LE)
    /// - per row: 4 + n bytes name (u32 LE length, UTF-8)
    /// - N bytes: embeddings data (f32 LE, row-major)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| persist_err("Failed to create cache directory", e))?;
            }
        }

        let tmp_path = temp_path(path);
        self.write_to(&tmp_path)?;
        fs::rename(&tmp_path, path).map_err(|e| persist_err("Failed to move cache into place", e))?;

        tracing::info!(
            path = %path.display(),
            num_rows = self.names.len(),
            dimension = self.embeddings.ncols(),
            "Index cache saved"
        );

        Ok(())
    }

    fn write_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| persist_err("Failed to create cache file", e))?;
        let mut writer = BufWriter::new(file);

        let data = self
            .embeddings
            .as_slice()
            .ok_or_else(|| AppError::PersistenceError("Embeddings array not contiguous".into()))?;

        write_all(&mut writer, CACHE_MAGIC)?;
        write_all(&mut writer, &self.version.to_le_bytes())?;
        write_all(&mut writer, &self.fingerprint)?;
        write_all(&mut writer, &(self.embedder_identity.len() as u32).to_le_bytes())?;
        write_all(&mut writer, self.embedder_identity.as_bytes())?;
        write_all(&mut writer, &(self.names.len() as u64).to_le_bytes())?;
        write_all(&mut writer, &(self.embeddings.ncols() as u64).to_le_bytes())?;
        for name in &self.names {
            write_all(&mut writer, &(name.len() as u32).to_le_bytes())?;
            write_all(&mut writer, name.as_bytes())?;
        }
        for &val in data {
            write_all(&mut writer, &val.to_le_bytes())?;
        }

        writer
            .flush()
            .map_err(|e| persist_err("Failed to flush cache file", e))
    }

    /// Load cache from a binary file.
    ///
    /// Returns None if the file doesn't exist or is from another format version.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Cache file does not exist");
            return Ok(None);
        }

        let file = File::open(path).map_err(|e| persist_err("Failed to open cache file", e))?;
        let file_len = file
            .metadata()
            .map_err(|e| persist_err("Failed to stat cache file", e))?
            .len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        if reader.read_exact(&mut magic).is_err() || &magic != CACHE_MAGIC {
            tracing::warn!(path = %path.display(), "Invalid cache magic, ignoring");
            return Ok(None);
        }

        let version = read_u32(&mut reader)?;
        if version != CACHE_VERSION {
            tracing::warn!(
                path = %path.display(),
                cache_version = version,
                expected_version = CACHE_VERSION,
                "Cache version mismatch, ignoring"
            );
            return Ok(None);
        }

        let mut fingerprint = [0u8; 32];
        reader
            .read_exact(&mut fingerprint)
            .map_err(|e| persist_err("Failed to read fingerprint", e))?;

        let embedder_identity = read_string(&mut reader)?;
        let num_rows = read_u64(&mut reader)? as usize;
        let dimension = read_u64(&mut reader)? as usize;
        if dimension == 0 || dimension > MAX_DIMENSION {
            tracing::warn!(
                path = %path.display(),
                dimension,
                "Cache declares an implausible dimension, ignoring"
            );
            return Ok(None);
        }

        let mut names = Vec::with_capacity(num_rows.min(1 << 16));
        for _ in 0..num_rows {
            names.push(read_string(&mut reader)?);
        }

        let total_floats = num_rows
            .checked_mul(dimension)
            .ok_or_else(|| AppError::PersistenceError("Cache dimensions overflow".into()))?;
        let position = reader
            .stream_position()
            .map_err(|e| persist_err("Failed to locate embedding data", e))?;
        let declared_bytes = (total_floats as u64).saturating_mul(4);
        if declared_bytes > file_len.saturating_sub(position) {
            return Err(AppError::PersistenceError(format!(
                "Cache declares {} bytes of embeddings but only {} remain",
                declared_bytes,
                file_len.saturating_sub(position)
            )));
        }
        let mut data = vec![0f32; total_floats];
        for val in &mut data {
            let mut bytes = [0u8; 4];
            reader
                .read_exact(&mut bytes)
                .map_err(|e| persist_err("Failed to read embedding data", e))?;
            *val = f32::from_le_bytes(bytes);
        }

        let embeddings = Array2::from_shape_vec((num_rows, dimension), data)
            .map_err(|e| persist_err("Failed to reshape embeddings", e))?;

        tracing::info!(
            path = %path.display(),
            num_rows,
            dimension,
            "Index cache loaded"
        );

        Ok(Some(Self {
            version,
            fingerprint,
            embedder_identity,
            names,
            embeddings,
        }))
    }

    /// Whether this cache was built from exactly this catalogue and embedder.
    pub fn is_valid_for(
        &self,
        fingerprint: &[u8; 32],
        embedder_identity: &str,
        names: &[String],
    ) -> bool {
        &self.fingerprint == fingerprint
            && self.embedder_identity == embedder_identity
            && self.names == names
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_all(writer: &mut impl Write, bytes: &[u8]) -> Result<()> {
    writer
        .write_all(bytes)
        .map_err(|e| persist_err("Failed to write cache", e))
}

fn read_u32(reader: &mut impl Read) -> Result<u32> {
    let mut bytes = [0u8; 4];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| persist_err("Failed to read cache header", e))?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(reader: &mut impl Read) -> Result<u64> {
    let mut bytes = [0u8; 8];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| persist_err("Failed to read cache header", e))?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_string(reader: &mut impl Read) -> Result<String> {
    let len = read_u32(reader)? as usize;
    if len > MAX_STRING_LEN {
        return Err(AppError::PersistenceError(format!(
            "Cache string length {} exceeds limit",
            len
        )));
    }
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .map_err(|e| persist_err("Failed to read cache string", e))?;
    String::from_utf8(buf).map_err(|e| persist_err("Cache string is not UTF-8", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> IndexCache {
        let embeddings =
            Array2::from_shape_vec((2, 3), vec![0.1, -2.5, 3.0, f32::MIN_POSITIVE, 5.0, 6.0])
                .unwrap();
        IndexCache::new(
            [7u8; 32],
            "hashing-sha256-v1/3",
            vec!["alpha".into(), "beta".into()],
            embeddings,
        )
    }

    #[test]
    fn test_save_and_load_is_lossless() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("index.bin");

        let cache = sample();
        cache.save(&path).unwrap();
        let loaded = IndexCache::load(&path).unwrap().unwrap();

        assert_eq!(loaded, cache);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_validity_requires_all_keys() {
        let cache = sample();
        let names = vec!["alpha".to_string(), "beta".to_string()];

        assert!(cache.is_valid_for(&[7u8; 32], "hashing-sha256-v1/3", &names));
        assert!(!cache.is_valid_for(&[8u8; 32], "hashing-sha256-v1/3", &names));
        assert!(!cache.is_valid_for(&[7u8; 32], "onnx/model", &names));
        assert!(!cache.is_valid_for(&[7u8; 32], "hashing-sha256-v1/3", &names[..1]));
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempdir().unwrap();
        assert!(IndexCache::load(&dir.path().join("absent.bin"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_foreign_file_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.bin");
        fs::write(&path, b"not an index at all").unwrap();

        assert!(IndexCache::load(&path).unwrap().is_none());
    }

    #[test]
    fn test_truncated_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.bin");
        sample().save(&path).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

        assert!(IndexCache::load(&path).is_err());
    }

    /// Header fields up to and including the row count and dimension.
    fn header(num_rows: u64, dimension: u64) -> Vec<u8> {
        let identity = b"hashing-sha256-v1/4096";
        let mut bytes = Vec::new();
        bytes.extend_from_slice(CACHE_MAGIC);
        bytes.extend_from_slice(&CACHE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&[7u8; 32]);
        bytes.extend_from_slice(&(identity.len() as u32).to_le_bytes());
        bytes.extend_from_slice(identity);
        bytes.extend_from_slice(&num_rows.to_le_bytes());
        bytes.extend_from_slice(&dimension.to_le_bytes());
        bytes
    }

    fn push_name(bytes: &mut Vec<u8>, name: &str) {
        bytes.extend_from_slice(&(name.len() as u32).to_le_bytes());
        bytes.extend_from_slice(name.as_bytes());
    }

    #[test]
    fn test_huge_dimension_is_ignored_without_allocating() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.bin");
        let mut bytes = header(1, 1 << 62);
        push_name(&mut bytes, "alpha");
        fs::write(&path, bytes).unwrap();

        assert!(IndexCache::load(&path).unwrap().is_none());
    }

    #[test]
    fn test_zero_dimension_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.bin");
        let mut bytes = header(1, 0);
        push_name(&mut bytes, "alpha");
        fs::write(&path, bytes).unwrap();

        assert!(IndexCache::load(&path).unwrap().is_none());
    }

    #[test]
    fn test_declared_data_longer_than_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.bin");
        let mut bytes = header(2, 4096);
        push_name(&mut bytes, "alpha");
        push_name(&mut bytes, "beta");
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        fs::write(&path, bytes).unwrap();

        let err = IndexCache::load(&path).unwrap_err();
        assert!(matches!(err, AppError::PersistenceError(_)));
    }
}
