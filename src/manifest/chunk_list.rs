use std::collections::HashMap;

use crate::errors::{EngineError, Result};
use crate::manifest::reader::{guid_hex, ByteReader, ByteWriter};

/// Metadata for one chunk in the manifest's chunk directory.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkInfo {
    pub guid: [u32; 4],
    pub hash: u64,
    pub sha_hash: [u8; 20],
    pub group_num: u8,
    pub window_size: u32,
    pub file_size: i64,
}

impl ChunkInfo {
    /// Record for a freshly produced chunk; the storage group is derived
    /// from the guid rather than read from a manifest.
    pub fn new(guid: [u32; 4], hash: u64, sha_hash: [u8; 20]) -> Self {
        Self {
            guid,
            hash,
            sha_hash,
            group_num: guid_group_num(&guid),
            window_size: 1024 * 1024,
            file_size: -1,
        }
    }

    pub fn guid_hex(&self) -> String {
        guid_hex(&self.guid)
    }

    /// Canonical remote storage path, a pure function of the manifest
    /// feature level, group number, hash and guid.
    pub fn path(&self, feature_level: u32) -> String {
        let dir = if feature_level >= 15 {
            "ChunksV4"
        } else if feature_level >= 6 {
            "ChunksV3"
        } else if feature_level >= 3 {
            "ChunksV2"
        } else {
            "Chunks"
        };
        format!(
            "{}/{:02}/{:016X}_{}.chunk",
            dir,
            self.group_num,
            self.hash,
            self.guid_hex()
        )
    }
}

/// Group number derivation used when a manifest predates stored groups.
pub fn guid_group_num(guid: &[u32; 4]) -> u8 {
    let mut bytes = [0_u8; 16];
    for (i, word) in guid.iter().enumerate() {
        bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    (crc32fast::hash(&bytes) % 100) as u8
}

/// The manifest's chunk list. Fields are stored column-wise across all
/// chunks (the upstream format is optimized for compression), so each field
/// array is read to completion before the next one starts.
pub struct ChunkDirectory {
    pub version: u8,
    pub size: u32,
    pub chunks: Vec<ChunkInfo>,
    index: HashMap<[u32; 4], usize>,
}

impl ChunkDirectory {
    pub fn parse(reader: &mut ByteReader<'_>) -> Result<Self> {
        let start = reader.position();
        let size = reader.read_u32()?;
        let mut version = reader.read_u8()?;
        let count = reader.read_u32()? as usize;
        // guid(16) + hash(8) + sha(20) + group(1) + window(4) + file_size(8)
        reader.check_count(count, 57)?;

        let mut chunks = vec![
            ChunkInfo {
                guid: [0; 4],
                hash: 0,
                sha_hash: [0; 20],
                group_num: 0,
                window_size: 0,
                file_size: 0,
            };
            count
        ];

        for chunk in chunks.iter_mut() {
            chunk.guid = reader.read_guid()?;
        }
        for chunk in chunks.iter_mut() {
            chunk.hash = reader.read_u64()?;
        }
        for chunk in chunks.iter_mut() {
            chunk.sha_hash = reader.read_sha1()?;
        }
        for chunk in chunks.iter_mut() {
            chunk.group_num = reader.read_u8()?;
        }
        for chunk in chunks.iter_mut() {
            chunk.window_size = reader.read_u32()?;
        }
        for chunk in chunks.iter_mut() {
            chunk.file_size = reader.read_i64()?;
        }

        let consumed = reader.position() - start;
        if consumed != size as usize {
            tracing::warn!(
                "chunk directory size mismatch: declared={} consumed={}, downgrading version {} -> 0",
                size,
                consumed,
                version
            );
            version = 0;
            reader.seek(start + size as usize);
        }

        let index = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| (chunk.guid, i))
            .collect();

        Ok(Self {
            version,
            size,
            chunks,
            index,
        })
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn resolve(&self, guid: &[u32; 4]) -> Result<&ChunkInfo> {
        self.index
            .get(guid)
            .map(|i| &self.chunks[*i])
            .ok_or_else(|| EngineError::UnknownChunk(guid_hex(guid)))
    }

    pub fn new(chunks: Vec<ChunkInfo>) -> Self {
        let index = chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| (chunk.guid, i))
            .collect();
        Self {
            version: 1,
            size: 0,
            chunks,
            index,
        }
    }

    /// Write the block back out, column-wise, with a patched size prefix.
    pub fn serialize(&self, writer: &mut ByteWriter) {
        let start = writer.len();
        writer.write_u32(0);
        writer.write_u8(self.version);
        writer.write_u32(self.chunks.len() as u32);
        for chunk in &self.chunks {
            writer.write_guid(&chunk.guid);
        }
        for chunk in &self.chunks {
            writer.write_u64(chunk.hash);
        }
        for chunk in &self.chunks {
            writer.write_bytes(&chunk.sha_hash);
        }
        for chunk in &self.chunks {
            writer.write_u8(chunk.group_num);
        }
        for chunk in &self.chunks {
            writer.write_u32(chunk.window_size);
        }
        for chunk in &self.chunks {
            writer.write_i64(chunk.file_size);
        }
        let size = (writer.len() - start) as u32;
        writer.patch_u32(start, size);
    }
}
