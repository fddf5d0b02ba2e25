/// Reference spectrum storage
///
/// One `.npy` file per reference sound; the file stem is the display name.
/// Files hold a 1-D little-endian float array, so samples saved by numpy
/// load unchanged.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::spectrum::Spectrum;

/// File extension of stored references
pub const REFERENCE_EXTENSION: &str = "npy";

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Header alignment used by numpy
const NPY_ALIGN: usize = 64;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid reference file {path}: {reason}")]
    Format { path: PathBuf, reason: String },

    #[error("Invalid reference name: {0:?}")]
    InvalidName(String),
}

/// A named, immutable, normalized spectrum
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSpectrum {
    name: String,
    values: Spectrum,
}

impl ReferenceSpectrum {
    pub fn new(name: impl Into<String>, values: Spectrum) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Directory of `.npy` reference files
#[derive(Debug, Clone)]
pub struct ReferenceStore {
    dir: PathBuf,
}

impl ReferenceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path a reference named `name` is stored at
    pub fn path_for(&self, name: &str) -> Result<PathBuf, StorageError> {
        if name.trim().is_empty() {
            return Err(StorageError::InvalidName(name.to_string()));
        }

        let path = self.dir.join(name);
        if path.extension().and_then(|e| e.to_str()) == Some(REFERENCE_EXTENSION) {
            Ok(path)
        } else {
            Ok(self.dir.join(format!("{}.{}", name, REFERENCE_EXTENSION)))
        }
    }

    /// Persist `values` under `name`, returning the written path
    pub fn save(&self, name: &str, values: &[f64]) -> Result<PathBuf, StorageError> {
        let path = self.path_for(name)?;
        let bytes = encode_npy(values);
        fs::write(&path, bytes).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;

        info!("Saved reference '{}' ({} bins) to {}", name, values.len(), path.display());
        Ok(path)
    }

    /// Load a single reference file
    pub fn load(&self, path: &Path) -> Result<ReferenceSpectrum, StorageError> {
        let bytes = fs::read(path).map_err(|source| StorageError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let values = decode_npy(&bytes).map_err(|reason| StorageError::Format {
            path: path.to_path_buf(),
            reason,
        })?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        debug!("Loaded reference '{}' ({} bins)", name, values.len());
        Ok(ReferenceSpectrum::new(name, values))
    }

    /// Load every `.npy` file in the directory, sorted by file name
    pub fn load_all(&self) -> Result<Vec<ReferenceSpectrum>, StorageError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| StorageError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StorageError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(REFERENCE_EXTENSION)
            {
                paths.push(path);
            }
        }
        paths.sort();

        if paths.is_empty() {
            warn!("No reference files found in {}", self.dir.display());
        }

        paths.iter().map(|p| self.load(p)).collect()
    }
}

/// Encode a 1-D `<f8` array in `.npy` format version 1.0
pub fn encode_npy(values: &[f64]) -> Vec<u8> {
    let dict = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': ({},), }}",
        values.len()
    );

    // magic + version + u16 header length + dict + trailing newline
    let unpadded = NPY_MAGIC.len() + 2 + 2 + dict.len() + 1;
    let padding = (NPY_ALIGN - unpadded % NPY_ALIGN) % NPY_ALIGN;
    let header_len = dict.len() + padding + 1;

    let mut out = Vec::with_capacity(unpadded + padding + values.len() * 8);
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header_len as u16).to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    out.extend(std::iter::repeat(b' ').take(padding));
    out.push(b'\n');
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode a 1-D little-endian float array from `.npy` bytes
pub fn decode_npy(bytes: &[u8]) -> Result<Vec<f64>, String> {
    if bytes.len() < NPY_MAGIC.len() + 2 || &bytes[..NPY_MAGIC.len()] != NPY_MAGIC {
        return Err("missing .npy magic".to_string());
    }

    let major = bytes[NPY_MAGIC.len()];
    let prelude = NPY_MAGIC.len() + 2;
    let (header_len, header_start) = match major {
        1 => {
            let raw = bytes
                .get(prelude..prelude + 2)
                .ok_or("truncated header length")?;
            (u16::from_le_bytes([raw[0], raw[1]]) as usize, prelude + 2)
        }
        2 | 3 => {
            let raw = bytes
                .get(prelude..prelude + 4)
                .ok_or("truncated header length")?;
            (
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize,
                prelude + 4,
            )
        }
        v => return Err(format!("unsupported format version {}", v)),
    };

    let header_end = header_start + header_len;
    let header = bytes
        .get(header_start..header_end)
        .ok_or("truncated header")?;
    let header = std::str::from_utf8(header).map_err(|_| "header is not valid text")?;

    let descr = header_value(header, "descr").ok_or("missing 'descr'")?;
    let descr = descr
        .strip_prefix('\'')
        .and_then(|d| d.split('\'').next())
        .ok_or("malformed 'descr'")?;

    let fortran = header_value(header, "fortran_order").ok_or("missing 'fortran_order'")?;
    if !fortran.starts_with("False") {
        return Err("fortran-ordered arrays are not supported".to_string());
    }

    let shape = header_value(header, "shape").ok_or("missing 'shape'")?;
    let shape = shape
        .strip_prefix('(')
        .and_then(|s| s.split(')').next())
        .ok_or("malformed 'shape'")?;
    let dims: Vec<&str> = shape
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .collect();
    let len: usize = match dims.as_slice() {
        [n] => n.parse().map_err(|_| format!("invalid dimension {:?}", n))?,
        _ => return Err(format!("expected a 1-D array, got shape ({})", shape)),
    };

    let data = &bytes[header_end..];
    match descr {
        "<f8" => {
            let expected = len.checked_mul(8).ok_or("shape too large")?;
            if data.len() != expected {
                return Err(format!("expected {} bytes of data, found {}", expected, data.len()));
            }
            Ok(data
                .chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect())
        }
        "<f4" => {
            let expected = len.checked_mul(4).ok_or("shape too large")?;
            if data.len() != expected {
                return Err(format!("expected {} bytes of data, found {}", expected, data.len()));
            }
            Ok(data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect())
        }
        other => Err(format!("unsupported dtype {:?}", other)),
    }
}

/// Text following `'key':` in a header dict
fn header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("'{}':", key);
    let start = header.find(&needle)? + needle.len();
    Some(header[start..].trim_start())
}
