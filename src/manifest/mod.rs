pub mod chunk;
pub mod chunk_list;
pub mod file_list;
pub mod reader;

use std::collections::HashMap;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;

use crate::errors::{EngineError, Result};
use crate::manifest::chunk_list::ChunkDirectory;
use crate::manifest::file_list::FileManifestList;
use crate::manifest::reader::{inflate, sha1_digest, ByteReader, ByteWriter};

pub const MANIFEST_MAGIC: u32 = 0x44BE_C00C;

const STORED_COMPRESSED: u8 = 0x1;

/// Metadata block: app identity, build version and launcher wiring.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManifestMeta {
    pub version: u8,
    pub feature_level: u32,
    pub is_file_data: bool,
    pub app_id: u32,
    pub app_name: String,
    pub build_version: String,
    pub launch_exe: String,
    pub launch_command: String,
    pub prereq_ids: Vec<String>,
    pub prereq_name: String,
    pub prereq_path: String,
    pub prereq_args: String,
    pub build_id: String,
}

impl ManifestMeta {
    pub fn parse(reader: &mut ByteReader<'_>) -> Result<Self> {
        let start = reader.position();
        let size = reader.read_u32()?;
        let mut version = reader.read_u8()?;

        let feature_level = reader.read_u32()?;
        let is_file_data = reader.read_u8()? != 0;
        let app_id = reader.read_u32()?;
        let app_name = reader.read_fstring()?;
        let build_version = reader.read_fstring()?;
        let launch_exe = reader.read_fstring()?;
        let launch_command = reader.read_fstring()?;
        let prereq_count = reader.read_u32()? as usize;
        reader.check_count(prereq_count, 4)?;
        let mut prereq_ids = Vec::with_capacity(prereq_count);
        for _ in 0..prereq_count {
            prereq_ids.push(reader.read_fstring()?);
        }
        let prereq_name = reader.read_fstring()?;
        let prereq_path = reader.read_fstring()?;
        let prereq_args = reader.read_fstring()?;

        let mut build_id = String::new();
        if version >= 1 {
            build_id = reader.read_fstring()?;
        }

        let consumed = reader.position() - start;
        if consumed != size as usize {
            tracing::warn!(
                "manifest meta size mismatch: declared={} consumed={}, downgrading version {} -> 0",
                size,
                consumed,
                version
            );
            version = 0;
            reader.seek(start + size as usize);
        }

        Ok(Self {
            version,
            feature_level,
            is_file_data,
            app_id,
            app_name,
            build_version,
            launch_exe,
            launch_command,
            prereq_ids,
            prereq_name,
            prereq_path,
            prereq_args,
            build_id,
        })
    }

    pub fn serialize(&self, writer: &mut ByteWriter) {
        let start = writer.len();
        writer.write_u32(0);
        writer.write_u8(self.version);
        writer.write_u32(self.feature_level);
        writer.write_u8(self.is_file_data as u8);
        writer.write_u32(self.app_id);
        writer.write_fstring(&self.app_name);
        writer.write_fstring(&self.build_version);
        writer.write_fstring(&self.launch_exe);
        writer.write_fstring(&self.launch_command);
        writer.write_u32(self.prereq_ids.len() as u32);
        for id in &self.prereq_ids {
            writer.write_fstring(id);
        }
        writer.write_fstring(&self.prereq_name);
        writer.write_fstring(&self.prereq_path);
        writer.write_fstring(&self.prereq_args);
        if self.version >= 1 {
            writer.write_fstring(&self.build_id);
        }
        let size = (writer.len() - start) as u32;
        writer.patch_u32(start, size);
    }
}

/// Free-form key/value trailer, stored as two FString columns.
#[derive(Clone, Debug, Default)]
pub struct CustomFields {
    pub version: u8,
    fields: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl CustomFields {
    pub fn parse(reader: &mut ByteReader<'_>) -> Result<Self> {
        let start = reader.position();
        let size = reader.read_u32()?;
        let mut version = reader.read_u8()?;
        let count = reader.read_u32()? as usize;
        // a key and value FString are 4 bytes each at minimum
        reader.check_count(count, 8)?;

        let mut keys = Vec::with_capacity(count);
        for _ in 0..count {
            keys.push(reader.read_fstring()?);
        }
        let mut fields = Vec::with_capacity(count);
        for key in keys {
            let value = reader.read_fstring()?;
            fields.push((key, value));
        }

        let consumed = reader.position() - start;
        if consumed != size as usize {
            tracing::warn!(
                "custom fields size mismatch: declared={} consumed={}, downgrading version {} -> 0",
                size,
                consumed,
                version
            );
            version = 0;
            reader.seek(start + size as usize);
        }

        let index = fields
            .iter()
            .enumerate()
            .map(|(i, (key, _))| (key.clone(), i))
            .collect();

        Ok(Self {
            version,
            fields,
            index,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.index
            .get(key)
            .map(|i| self.fields[*i].1.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        if let Some(i) = self.index.get(key) {
            self.fields[*i].1 = value.to_string();
            return;
        }
        self.index.insert(key.to_string(), self.fields.len());
        self.fields.push((key.to_string(), value.to_string()));
    }

    pub fn serialize(&self, writer: &mut ByteWriter) {
        let start = writer.len();
        writer.write_u32(0);
        writer.write_u8(self.version);
        writer.write_u32(self.fields.len() as u32);
        for (key, _) in &self.fields {
            writer.write_fstring(key);
        }
        for (_, value) in &self.fields {
            writer.write_fstring(value);
        }
        let size = (writer.len() - start) as u32;
        writer.patch_u32(start, size);
    }
}

/// Parsed manifest: envelope header fields plus the four decomposed body
/// blocks. The decompressed body buffer only lives for the duration of
/// `parse`.
pub struct Manifest {
    pub header_size: u32,
    pub size_compressed: u32,
    pub size_uncompressed: u32,
    pub sha_hash: [u8; 20],
    pub stored_as: u8,
    pub version: u32,
    pub meta: ManifestMeta,
    pub chunks: ChunkDirectory,
    pub files: FileManifestList,
    pub custom_fields: CustomFields,
}

impl Manifest {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let magic = reader.read_u32()?;
        if magic != MANIFEST_MAGIC {
            return Err(EngineError::Format(format!(
                "manifest magic mismatch: expected {MANIFEST_MAGIC:#010X}, got {magic:#010X}"
            )));
        }

        let header_size = reader.read_u32()?;
        let size_uncompressed = reader.read_u32()?;
        let size_compressed = reader.read_u32()?;
        let sha_hash = reader.read_sha1()?;
        let stored_as = reader.read_u8()?;
        let version = reader.read_u32()?;
        reader.seek(header_size as usize);

        let body = if stored_as & STORED_COMPRESSED != 0 {
            let compressed = reader.read_bytes(size_compressed as usize)?;
            let inflated = inflate(compressed)?;
            if sha1_digest(&inflated) != sha_hash {
                return Err(EngineError::Integrity(
                    "manifest body SHA-1 does not match header hash".to_string(),
                ));
            }
            inflated
        } else {
            reader.read_bytes(size_uncompressed as usize)?.to_vec()
        };

        if body.len() != size_uncompressed as usize {
            return Err(EngineError::Format(format!(
                "manifest body size mismatch: declared {}, got {}",
                size_uncompressed,
                body.len()
            )));
        }

        let mut body_reader = ByteReader::new(&body);
        let meta = ManifestMeta::parse(&mut body_reader)?;
        let chunks = ChunkDirectory::parse(&mut body_reader)?;
        let files = FileManifestList::parse(&mut body_reader)?;
        let custom_fields = CustomFields::parse(&mut body_reader)?;

        Ok(Self {
            header_size,
            size_compressed,
            size_uncompressed,
            sha_hash,
            stored_as,
            version,
            meta,
            chunks,
            files,
            custom_fields,
        })
    }

    /// Serialize with an uncompressed body. Used by tests and by tools that
    /// rewrite manifests after a version downgrade.
    pub fn serialize(&self) -> Vec<u8> {
        let mut body = ByteWriter::new();
        self.meta.serialize(&mut body);
        self.chunks.serialize(&mut body);
        self.files.serialize(&mut body);
        self.custom_fields.serialize(&mut body);
        let body = body.into_inner();

        let mut writer = ByteWriter::new();
        writer.write_u32(MANIFEST_MAGIC);
        let header_size_at = writer.len();
        writer.write_u32(0);
        writer.write_u32(body.len() as u32);
        writer.write_u32(body.len() as u32);
        writer.write_bytes(&sha1_digest(&body));
        writer.write_u8(0);
        writer.write_u32(self.version);
        let header_size = writer.len() as u32;
        writer.patch_u32(header_size_at, header_size);
        writer.write_bytes(&body);
        writer.into_inner()
    }
}

/// Compress a serialized manifest body into the zlib envelope. Test and
/// tooling helper for producing `stored_as = 1` manifests.
pub fn compress_manifest(manifest: &Manifest) -> Result<Vec<u8>> {
    let mut body = ByteWriter::new();
    manifest.meta.serialize(&mut body);
    manifest.chunks.serialize(&mut body);
    manifest.files.serialize(&mut body);
    manifest.custom_fields.serialize(&mut body);
    let body = body.into_inner();

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&body)?;
    let compressed = encoder.finish()?;

    let mut writer = ByteWriter::new();
    writer.write_u32(MANIFEST_MAGIC);
    let header_size_at = writer.len();
    writer.write_u32(0);
    writer.write_u32(body.len() as u32);
    writer.write_u32(compressed.len() as u32);
    writer.write_bytes(&sha1_digest(&body));
    writer.write_u8(STORED_COMPRESSED);
    writer.write_u32(manifest.version);
    let header_size = writer.len() as u32;
    writer.patch_u32(header_size_at, header_size);
    writer.write_bytes(&compressed);
    Ok(writer.into_inner())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::manifest::chunk_list::ChunkInfo;
    use crate::manifest::file_list::{ChunkPart, FileManifest};

    pub fn manifest_with(chunks: Vec<ChunkInfo>, files: Vec<FileManifest>) -> Manifest {
        let meta = ManifestMeta {
            version: 1,
            feature_level: 18,
            app_id: 42,
            app_name: "sampleapp".to_string(),
            build_version: "1.0.3+build7".to_string(),
            launch_exe: "bin/sample".to_string(),
            build_id: "build-7".to_string(),
            ..ManifestMeta::default()
        };
        Manifest {
            header_size: 0,
            size_compressed: 0,
            size_uncompressed: 0,
            sha_hash: [0; 20],
            stored_as: 0,
            version: 18,
            meta,
            chunks: ChunkDirectory::new(chunks),
            files: FileManifestList::new(files),
            custom_fields: CustomFields::default(),
        }
    }

    pub fn chunk_info(seed: u32, file_size: i64) -> ChunkInfo {
        ChunkInfo {
            guid: [seed, seed ^ 0xFFFF, seed.rotate_left(8), seed + 99],
            hash: (seed as u64).wrapping_mul(0x0101_0101_0101_0101),
            sha_hash: [seed as u8; 20],
            group_num: (seed % 100) as u8,
            window_size: 1024 * 1024,
            file_size,
        }
    }

    pub fn file_of_parts(name: &str, parts: Vec<ChunkPart>) -> FileManifest {
        FileManifest {
            filename: name.to_string(),
            symlink_target: String::new(),
            hash: [0; 20],
            flags: 0,
            install_tags: Vec::new(),
            chunk_parts: parts,
            md5: None,
            mime_type: None,
            sha256: None,
        }
    }
}
