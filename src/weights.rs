//! Weight artifact parsing for model loading.
//!
//! Model weights ship in the safetensors layout:
//! - 8-byte little-endian header size
//! - JSON header with tensor metadata (name, dtype, shape, data offsets)
//! - Raw tensor data
//!
//! The file is memory-mapped; tensor reads copy out of the mapping one
//! element at a time, so unaligned data offsets are safe.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use memmap2::Mmap;
use serde::Deserialize;

use crate::error::{Result, VlmError};

/// A memory-mapped weight file.
pub struct MappedArtifact {
    mmap: Mmap,
}

impl MappedArtifact {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            VlmError::InvalidModelPath(format!("cannot open {}: {e}", path.display()))
        })?;
        // Safety: the mapping is read-only and the file is not mutated
        // while the handle holds it.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| {
                VlmError::InvalidModelPath(format!("cannot map {}: {e}", path.display()))
            })?
        };
        Ok(MappedArtifact { mmap })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }
}

/// Metadata for a single tensor in the artifact.
#[derive(Debug, Clone, Deserialize)]
pub struct TensorInfo {
    /// Data type string (the runtime requires "F32" for its tensors).
    pub dtype: String,

    /// Tensor shape.
    pub shape: Vec<usize>,

    /// Byte offset range `[start, end)` within the data section.
    pub data_offsets: [usize; 2],
}

impl TensorInfo {
    pub fn byte_size(&self) -> usize {
        self.data_offsets[1].saturating_sub(self.data_offsets[0])
    }

    /// Total element count, or `None` when the declared shape overflows.
    pub fn element_count(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
    }
}

/// Parsed weight-file header.
#[derive(Debug)]
pub struct WeightTable {
    /// Map from tensor name to metadata.
    pub tensors: HashMap<String, TensorInfo>,

    /// Optional flat string metadata.
    pub metadata: HashMap<String, String>,

    /// Byte offset where the data section begins.
    pub data_offset: usize,
}

impl WeightTable {
    /// Look up a required tensor by name.
    pub fn require(&self, name: &str) -> Result<&TensorInfo> {
        self.tensors
            .get(name)
            .ok_or_else(|| VlmError::ModelLoad(format!("missing required tensor {name:?}")))
    }
}

/// Parse the weight-table header out of a raw artifact.
pub fn parse_table(bytes: &[u8]) -> Result<WeightTable> {
    if bytes.len() < 8 {
        return Err(VlmError::ModelLoad(
            "file too small for weight header".into(),
        ));
    }

    let header_size = (&bytes[..8])
        .read_u64::<LittleEndian>()
        .map_err(|e| VlmError::ModelLoad(format!("failed to read header size: {e}")))?;

    // The length field is attacker-controlled; checked math keeps a
    // corrupt file an error instead of an overflow.
    let header_end = header_size
        .checked_add(8)
        .filter(|&end| end <= bytes.len() as u64)
        .ok_or_else(|| {
            VlmError::ModelLoad(format!(
                "header size {header_size} exceeds file size {}",
                bytes.len()
            ))
        })? as usize;

    let header_str = std::str::from_utf8(&bytes[8..header_end])
        .map_err(|e| VlmError::ModelLoad(format!("invalid UTF-8 in header: {e}")))?;

    // The header is a map of tensor_name -> TensorInfo, with an optional
    // "__metadata__" key holding flat string pairs.
    let raw: HashMap<String, serde_json::Value> = serde_json::from_str(header_str)
        .map_err(|e| VlmError::ModelLoad(format!("corrupt weight header: {e}")))?;

    let mut tensors = HashMap::new();
    let mut metadata = HashMap::new();

    for (key, value) in raw {
        if key == "__metadata__" {
            if let Some(obj) = value.as_object() {
                for (mk, mv) in obj {
                    if let Some(s) = mv.as_str() {
                        metadata.insert(mk.clone(), s.to_string());
                    }
                }
            }
            continue;
        }

        let info: TensorInfo = serde_json::from_value(value)
            .map_err(|e| VlmError::ModelLoad(format!("bad metadata for tensor {key:?}: {e}")))?;
        tensors.insert(key, info);
    }

    Ok(WeightTable {
        tensors,
        metadata,
        data_offset: header_end,
    })
}

/// Copy a named F32 tensor out of the artifact.
///
/// Validates dtype, offset bounds, and that the byte span matches the
/// declared shape.
pub fn tensor_f32(bytes: &[u8], table: &WeightTable, name: &str) -> Result<Vec<f32>> {
    let info = table.require(name)?;

    if info.dtype != "F32" {
        return Err(VlmError::ModelLoad(format!(
            "tensor {name:?} has dtype {:?}, expected F32",
            info.dtype
        )));
    }

    let expected_bytes = info
        .element_count()
        .and_then(|count| count.checked_mul(std::mem::size_of::<f32>()))
        .ok_or_else(|| {
            VlmError::ModelLoad(format!(
                "tensor {name:?} shape {:?} overflows the addressable range",
                info.shape
            ))
        })?;
    if info.byte_size() != expected_bytes {
        return Err(VlmError::ModelLoad(format!(
            "tensor {name:?} spans {} bytes but shape {:?} needs {expected_bytes}",
            info.byte_size(),
            info.shape
        )));
    }

    let (Some(start), Some(end)) = (
        table.data_offset.checked_add(info.data_offsets[0]),
        table.data_offset.checked_add(info.data_offsets[1]),
    ) else {
        return Err(VlmError::ModelLoad(format!(
            "tensor {name:?} data offsets {:?} overflow the addressable range",
            info.data_offsets
        )));
    };
    if end > bytes.len() || start > end {
        return Err(VlmError::ModelLoad(format!(
            "tensor {name:?} data range {start}..{end} outside file of {} bytes",
            bytes.len()
        )));
    }

    // Element-wise copy tolerates unaligned data offsets.
    let data = &bytes[start..end];
    let values = data
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok(values)
}
