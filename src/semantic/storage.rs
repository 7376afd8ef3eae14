//! Binary storage for a replica's vector index.
//!
//! File format: vectors.bin
//!
//! Header (51 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - body_checksum: u32 (CRC32 of every entry byte)
//! - header_checksum: u32 (CRC32 of header fields before it)
//!
//! Entries (repeated):
//! - id_len: u32, chunk id (utf-8)
//! - record_len: u32, chunk record (JSON)
//! - embedding: [f32; dimensions] (little-endian)

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::content::Chunk;
use crate::semantic::index::VectorIndex;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

const HEADER_SIZE: usize = 51;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: file uses different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Storage manager for vector embeddings.
pub struct VectorStorage {
    path: PathBuf,
}

#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
    body_checksum: u32,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the index, validating model, dimensions and both checksums.
    pub fn load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<VectorIndex, VectorStorageError> {
        let mut file = File::open(&self.path)?;

        let mut header_bytes = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_bytes).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                VectorStorageError::InvalidFormat("truncated header".to_string())
            }
            _ => VectorStorageError::Io(e),
        })?;
        let header = Self::parse_header(&header_bytes)?;
        Self::validate_header(&header, expected_model_id, expected_dimensions)?;

        let mut body = Vec::new();
        file.read_to_end(&mut body)?;
        if crc32fast::hash(&body) != header.body_checksum {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let dimensions = header.dimensions as usize;
        let mut index = VectorIndex::with_capacity(dimensions, header.entry_count as usize);
        let mut cursor = Cursor::new(&body);

        for _ in 0..header.entry_count {
            let id = cursor.string()?;
            let record = cursor.bytes()?;
            let chunk: Chunk = serde_json::from_slice(record).map_err(|e| {
                VectorStorageError::InvalidFormat(format!("chunk record {id}: {e}"))
            })?;
            if chunk.id != id {
                return Err(VectorStorageError::InvalidFormat(format!(
                    "entry {id} holds record for {}",
                    chunk.id
                )));
            }
            let embedding = cursor.floats(dimensions)?;

            index
                .insert(chunk, embedding)
                .map_err(|e| VectorStorageError::InvalidFormat(format!("entry {id}: {e}")))?;
        }

        if !cursor.is_at_end() {
            return Err(VectorStorageError::InvalidFormat(
                "trailing bytes after last entry".to_string(),
            ));
        }

        Ok(index)
    }

    /// Save the vector index to storage.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let temp_path = self.path.with_extension("tmp");

        let result = self.write_to_file(&temp_path, index, model_id);

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    fn write_to_file(
        &self,
        path: &Path,
        index: &VectorIndex,
        model_id: &[u8; 32],
    ) -> Result<(), VectorStorageError> {
        let dimensions = u16::try_from(index.dimensions()).map_err(|_| {
            VectorStorageError::InvalidFormat(format!(
                "{} dimensions do not fit the format",
                index.dimensions()
            ))
        })?;

        // entries sorted by id so identical indexes produce identical files
        let mut entries: Vec<_> = index.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        let mut body = Vec::new();
        for (id, entry) in entries {
            let record = serde_json::to_vec(&entry.chunk)
                .map_err(|e| VectorStorageError::InvalidFormat(e.to_string()))?;
            write_bytes(&mut body, id.as_bytes())?;
            write_bytes(&mut body, &record)?;
            for &value in &entry.embedding {
                body.extend_from_slice(&value.to_le_bytes());
            }
        }

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions,
            entry_count: index.len() as u64,
            body_checksum: crc32fast::hash(&body),
        };

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&Self::encode_header(&header))?;
        writer.write_all(&body)?;

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(())
    }

    fn encode_header(header: &Header) -> [u8; HEADER_SIZE] {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0] = header.version;
        header_bytes[1..33].copy_from_slice(&header.model_id);
        header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
        header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());
        header_bytes[43..47].copy_from_slice(&header.body_checksum.to_le_bytes());

        let checksum = crc32fast::hash(&header_bytes[0..47]);
        header_bytes[47..51].copy_from_slice(&checksum.to_le_bytes());

        header_bytes
    }

    fn parse_header(header_bytes: &[u8; HEADER_SIZE]) -> Result<Header, VectorStorageError> {
        let version = header_bytes[0];

        if version > FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes(le_array(&header_bytes[47..51]));
        if stored_checksum != crc32fast::hash(&header_bytes[0..47]) {
            return Err(VectorStorageError::ChecksumMismatch);
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&header_bytes[1..33]);

        Ok(Header {
            version,
            model_id,
            dimensions: u16::from_le_bytes(le_array(&header_bytes[33..35])),
            entry_count: u64::from_le_bytes(le_array(&header_bytes[35..43])),
            body_checksum: u32::from_le_bytes(le_array(&header_bytes[43..47])),
        })
    }

    fn validate_header(
        header: &Header,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<(), VectorStorageError> {
        if header.model_id != *expected_model_id {
            return Err(VectorStorageError::ModelMismatch);
        }

        if header.dimensions as usize != expected_dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        log::debug!(
            "vectors.bin v{} with {} entries",
            header.version,
            header.entry_count
        );
        Ok(())
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

fn write_bytes(body: &mut Vec<u8>, bytes: &[u8]) -> Result<(), VectorStorageError> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| VectorStorageError::InvalidFormat("entry too large".to_string()))?;
    body.extend_from_slice(&len.to_le_bytes());
    body.extend_from_slice(bytes);
    Ok(())
}

/// Bounds-checked reader over the entry section.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], VectorStorageError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| VectorStorageError::InvalidFormat("unexpected end of entries".to_string()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn bytes(&mut self) -> Result<&'a [u8], VectorStorageError> {
        let len = u32::from_le_bytes(le_array(self.take(4)?)) as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, VectorStorageError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| VectorStorageError::InvalidFormat("chunk id is not utf-8".to_string()))
    }

    fn floats(&mut self, n: usize) -> Result<Vec<f32>, VectorStorageError> {
        let raw = self.take(n * 4)?;
        Ok(raw
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    fn is_at_end(&self) -> bool {
        self.pos == self.data.len()
    }
}
