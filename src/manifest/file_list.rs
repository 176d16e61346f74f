use crate::errors::Result;
use crate::manifest::reader::{ByteReader, ByteWriter};

pub const FLAG_READ_ONLY: u8 = 0x1;
pub const FLAG_COMPRESSED: u8 = 0x2;
pub const FLAG_EXECUTABLE: u8 = 0x4;

/// Byte-range reference from a file into one chunk. Pure locator; never
/// owns chunk bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkPart {
    pub guid: [u32; 4],
    /// Offset into the chunk's decompressed payload.
    pub offset: u32,
    pub size: u32,
    /// Destination offset within the owning file, computed as a running sum
    /// at parse time.
    pub file_offset: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FileManifest {
    pub filename: String,
    pub symlink_target: String,
    pub hash: [u8; 20],
    pub flags: u8,
    pub install_tags: Vec<String>,
    pub chunk_parts: Vec<ChunkPart>,
    pub md5: Option<[u8; 16]>,
    pub mime_type: Option<String>,
    pub sha256: Option<[u8; 32]>,
}

impl FileManifest {
    pub fn file_size(&self) -> u64 {
        self.chunk_parts.iter().map(|part| part.size as u64).sum()
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & FLAG_READ_ONLY != 0
    }

    pub fn is_executable(&self) -> bool {
        self.flags & FLAG_EXECUTABLE != 0
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Ordered list of target files. Stored column-wise like the chunk
/// directory; trailing MD5 / MIME / SHA-256 columns are gated by the block's
/// sub-version and their absence is not an error.
pub struct FileManifestList {
    pub version: u8,
    pub size: u32,
    pub files: Vec<FileManifest>,
}

impl FileManifestList {
    pub fn parse(reader: &mut ByteReader<'_>) -> Result<Self> {
        let start = reader.position();
        let size = reader.read_u32()?;
        let mut version = reader.read_u8()?;
        let count = reader.read_u32()? as usize;
        // filename(4) + symlink(4) + sha(20) + flags(1) + tag count(4) +
        // part count(4) is the smallest possible file record
        reader.check_count(count, 37)?;

        let mut files = vec![
            FileManifest {
                filename: String::new(),
                symlink_target: String::new(),
                hash: [0; 20],
                flags: 0,
                install_tags: Vec::new(),
                chunk_parts: Vec::new(),
                md5: None,
                mime_type: None,
                sha256: None,
            };
            count
        ];

        for file in files.iter_mut() {
            file.filename = reader.read_fstring()?;
        }
        for file in files.iter_mut() {
            file.symlink_target = reader.read_fstring()?;
        }
        for file in files.iter_mut() {
            file.hash = reader.read_sha1()?;
        }
        for file in files.iter_mut() {
            file.flags = reader.read_u8()?;
        }
        for file in files.iter_mut() {
            let tag_count = reader.read_u32()? as usize;
            reader.check_count(tag_count, 4)?;
            let mut tags = Vec::with_capacity(tag_count);
            for _ in 0..tag_count {
                tags.push(reader.read_fstring()?);
            }
            file.install_tags = tags;
        }
        for file in files.iter_mut() {
            let part_count = reader.read_u32()? as usize;
            // struct_size(4) + guid(16) + offset(4) + size(4) per part
            reader.check_count(part_count, 28)?;
            let mut parts = Vec::with_capacity(part_count);
            let mut file_offset = 0_u64;
            for _ in 0..part_count {
                let entry_start = reader.position();
                let entry_size = reader.read_u32()? as usize;
                let guid = reader.read_guid()?;
                let offset = reader.read_u32()?;
                let part_size = reader.read_u32()?;
                // Skip fields added by future part revisions.
                reader.seek(entry_start + entry_size);
                parts.push(ChunkPart {
                    guid,
                    offset,
                    size: part_size,
                    file_offset,
                });
                file_offset += part_size as u64;
            }
            file.chunk_parts = parts;
        }

        if version >= 1 {
            for file in files.iter_mut() {
                let has_md5 = reader.read_u32()?;
                if has_md5 != 0 {
                    let raw = reader.read_bytes(16)?;
                    let mut md5 = [0_u8; 16];
                    md5.copy_from_slice(raw);
                    file.md5 = Some(md5);
                }
            }
            for file in files.iter_mut() {
                file.mime_type = Some(reader.read_fstring()?);
            }
        }
        if version >= 2 {
            for file in files.iter_mut() {
                let raw = reader.read_bytes(32)?;
                let mut sha256 = [0_u8; 32];
                sha256.copy_from_slice(raw);
                file.sha256 = Some(sha256);
            }
        }

        let consumed = reader.position() - start;
        if consumed != size as usize {
            tracing::warn!(
                "file manifest list size mismatch: declared={} consumed={}, downgrading version {} -> 0",
                size,
                consumed,
                version
            );
            version = 0;
            reader.seek(start + size as usize);
        }

        Ok(Self {
            version,
            size,
            files,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(FileManifest::file_size).sum()
    }

    pub fn new(files: Vec<FileManifest>) -> Self {
        Self {
            version: 0,
            size: 0,
            files,
        }
    }

    pub fn serialize(&self, writer: &mut ByteWriter) {
        let start = writer.len();
        writer.write_u32(0);
        writer.write_u8(self.version);
        writer.write_u32(self.files.len() as u32);
        for file in &self.files {
            writer.write_fstring(&file.filename);
        }
        for file in &self.files {
            writer.write_fstring(&file.symlink_target);
        }
        for file in &self.files {
            writer.write_bytes(&file.hash);
        }
        for file in &self.files {
            writer.write_u8(file.flags);
        }
        for file in &self.files {
            writer.write_u32(file.install_tags.len() as u32);
            for tag in &file.install_tags {
                writer.write_fstring(tag);
            }
        }
        for file in &self.files {
            writer.write_u32(file.chunk_parts.len() as u32);
            for part in &file.chunk_parts {
                // struct_size(4) + guid(16) + offset(4) + size(4)
                writer.write_u32(28);
                writer.write_guid(&part.guid);
                writer.write_u32(part.offset);
                writer.write_u32(part.size);
            }
        }
        if self.version >= 1 {
            for file in &self.files {
                match &file.md5 {
                    Some(md5) => {
                        writer.write_u32(1);
                        writer.write_bytes(md5);
                    }
                    None => writer.write_u32(0),
                }
            }
            for file in &self.files {
                writer.write_fstring(file.mime_type.as_deref().unwrap_or(""));
            }
        }
        if self.version >= 2 {
            for file in &self.files {
                writer.write_bytes(&file.sha256.unwrap_or([0_u8; 32]));
            }
        }
        let size = (writer.len() - start) as u32;
        writer.patch_u32(start, size);
    }
}
