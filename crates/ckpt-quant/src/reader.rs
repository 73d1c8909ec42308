//! SafeTensors checkpoint reading.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use safetensors::SafeTensors;

use crate::error::{LoaderError, Result};
use crate::tensor::TensorData;

/// A checkpoint tensor decoded to f32.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    pub name: String,
    pub data: TensorData,
}

/// Source of named tensors for the loader.
pub trait TensorSource {
    /// All tensors in the checkpoint, in no particular order.
    fn read_tensors(&self) -> Result<Vec<NamedTensor>>;
}

/// Reads a `.safetensors` file fully into memory.
#[derive(Debug, Clone)]
pub struct SafeTensorsReader {
    path: PathBuf,
}

impl SafeTensorsReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_bytes(&self) -> Result<Vec<u8>> {
        if !self.path.is_file() {
            return Err(LoaderError::CheckpointNotFound { path: self.path.clone() });
        }
        let unreadable = |source: std::io::Error| LoaderError::CheckpointUnreadable {
            path: self.path.clone(),
            source,
        };

        let mut file = fs::File::open(&self.path).map_err(unreadable)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer).map_err(unreadable)?;
        Ok(buffer)
    }

    fn deserialize<'a>(&self, buffer: &'a [u8]) -> Result<SafeTensors<'a>> {
        SafeTensors::deserialize(buffer).map_err(|e| LoaderError::InvalidCheckpoint {
            path: self.path.clone(),
            detail: e.to_string(),
        })
    }

    /// Tensor names stored in the checkpoint, sorted lexicographically.
    pub fn tensor_names(&self) -> Result<Vec<String>> {
        let buffer = self.read_bytes()?;
        let st = self.deserialize(&buffer)?;
        let mut names: Vec<String> = st.names().into_iter().cloned().collect();
        names.sort();
        Ok(names)
    }
}

impl TensorSource for SafeTensorsReader {
    fn read_tensors(&self) -> Result<Vec<NamedTensor>> {
        tracing::debug!("Reading SafeTensors file: {}", self.path.display());
        let buffer = self.read_bytes()?;
        let st = self.deserialize(&buffer)?;

        let views = st.tensors();
        let mut tensors = Vec::with_capacity(views.len());
        for (name, view) in views {
            let data = TensorData::from_view(&name, &view)?;
            tensors.push(NamedTensor { name, data });
        }
        tracing::debug!("Decoded {} tensors ({} bytes)", tensors.len(), buffer.len());
        Ok(tensors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Minimal SafeTensors buffer: header_size (u64 le) | header_json | data.
    fn write_f32_checkpoint(path: &Path, name: &str, values: &[f32]) {
        let json = format!(
            r#"{{"{name}":{{"dtype":"F32","shape":[{}],"data_offsets":[0,{}]}}}}"#,
            values.len(),
            values.len() * 4
        );
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(json.len() as u64).to_le_bytes());
        buffer.extend_from_slice(json.as_bytes());
        for &v in values {
            buffer.extend_from_slice(&v.to_le_bytes());
        }
        fs::write(path, buffer).unwrap();
    }

    #[test]
    fn test_read_tensors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        write_f32_checkpoint(&path, "lm_head.weight", &[1.0, -2.0, 3.5]);

        let tensors = SafeTensorsReader::new(&path).read_tensors().unwrap();
        assert_eq!(tensors.len(), 1);
        assert_eq!(tensors[0].name, "lm_head.weight");
        assert_eq!(tensors[0].data.shape, vec![3]);
        assert_eq!(tensors[0].data.values, vec![1.0, -2.0, 3.5]);
    }

    #[test]
    fn test_tensor_names() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        write_f32_checkpoint(&path, "a.weight", &[0.0]);

        let names = SafeTensorsReader::new(&path).tensor_names().unwrap();
        assert_eq!(names, vec!["a.weight".to_string()]);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = SafeTensorsReader::new(dir.path().join("nope.safetensors"))
            .read_tensors()
            .unwrap_err();
        assert!(matches!(err, LoaderError::CheckpointNotFound { .. }));
    }

    #[test]
    fn test_directory_is_not_a_checkpoint() {
        let dir = TempDir::new().unwrap();
        let err = SafeTensorsReader::new(dir.path()).read_tensors().unwrap_err();
        assert!(matches!(err, LoaderError::CheckpointNotFound { .. }));
    }

    // A regular file whose first read fails with EIO.
    #[cfg(target_os = "linux")]
    #[test]
    fn test_read_error_is_unreadable() {
        let path = Path::new("/proc/self/mem");
        assert!(path.is_file());
        let err = SafeTensorsReader::new(path).read_tensors().unwrap_err();
        assert!(err.to_string().starts_with("failed to read checkpoint /proc/self/mem"));
        match err {
            LoaderError::CheckpointUnreadable { path: p, .. } => assert_eq!(p, path),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_garbage_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        fs::write(&path, b"dummy").unwrap();

        let err = SafeTensorsReader::new(&path).read_tensors().unwrap_err();
        assert!(matches!(err, LoaderError::InvalidCheckpoint { .. }));
    }
}
