use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use once_cell::sync::{Lazy, OnceCell};

use crate::errors::{EngineError, Result};
use crate::manifest::reader::{guid_hex, inflate, sha1_digest, ByteReader, ByteWriter};

pub const CHUNK_MAGIC: u32 = 0xB1FE_3AA2;
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

const STORED_COMPRESSED: u8 = 0x1;
const HASH_TYPE_BOTH: u8 = 0x3;

/// 256-entry table for the 64-bit rotate-and-xor rolling hash. Generated
/// once from a fixed splitmix64 sequence so the hash is stable across runs.
static HASH_TABLE: Lazy<[u64; 256]> = Lazy::new(|| {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    let mut table = [0_u64; 256];
    for entry in table.iter_mut() {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        *entry = z ^ (z >> 31);
    }
    table
});

pub fn rolling_hash(data: &[u8]) -> u64 {
    let mut hash: u64 = 0;
    for byte in data {
        hash = hash.rotate_left(1) ^ HASH_TABLE[*byte as usize];
    }
    hash
}

/// One content-addressed chunk as it appears on the wire: versioned header
/// plus an optionally zlib-compressed payload of at most 1 MiB.
pub struct Chunk {
    pub version: u32,
    pub header_size: u32,
    pub size_compressed: u32,
    pub size_uncompressed: u32,
    pub guid: [u32; 4],
    pub hash: u64,
    pub sha_hash: [u8; 20],
    pub stored_as: u8,
    pub hash_type: u8,
    data: Vec<u8>,
    decompressed: OnceCell<Vec<u8>>,
}

impl Chunk {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let magic = reader.read_u32()?;
        if magic != CHUNK_MAGIC {
            return Err(EngineError::Format(format!(
                "chunk magic mismatch: expected {CHUNK_MAGIC:#010X}, got {magic:#010X}"
            )));
        }

        let version = reader.read_u32()?;
        let header_size = reader.read_u32()?;
        let size_compressed = reader.read_u32()?;
        let guid = reader.read_guid()?;
        let hash = reader.read_u64()?;
        let stored_as = reader.read_u8()?;

        let mut sha_hash = [0_u8; 20];
        let mut hash_type = 0_u8;
        if version >= 2 {
            sha_hash = reader.read_sha1()?;
            hash_type = reader.read_u8()?;
        }

        let mut size_uncompressed = MAX_PAYLOAD_SIZE as u32;
        if version >= 3 {
            size_uncompressed = reader.read_u32()?;
        }

        if reader.position() != header_size as usize {
            return Err(EngineError::Format(format!(
                "chunk header size mismatch: declared {}, consumed {}",
                header_size,
                reader.position()
            )));
        }

        let data = reader.read_bytes(size_compressed as usize)?.to_vec();

        Ok(Self {
            version,
            header_size,
            size_compressed,
            size_uncompressed,
            guid,
            hash,
            sha_hash,
            stored_as,
            hash_type,
            data,
            decompressed: OnceCell::new(),
        })
    }

    pub fn guid_hex(&self) -> String {
        guid_hex(&self.guid)
    }

    pub fn is_compressed(&self) -> bool {
        self.stored_as & STORED_COMPRESSED != 0
    }

    /// Decompressed payload, inflated on first access and cached.
    pub fn payload(&self) -> Result<&[u8]> {
        if !self.is_compressed() {
            return Ok(&self.data);
        }
        let inflated = self.decompressed.get_or_try_init(|| inflate(&self.data))?;
        Ok(inflated)
    }

    /// Replace the payload on the encode path. The staging buffer is padded
    /// to exactly 1 MiB before hashing, then zlib-deflated; the uncompressed
    /// form is kept only when deflation does not shrink it.
    pub fn set_payload(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(EngineError::Format(format!(
                "chunk payload too large: {} bytes (max {})",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let mut padded = payload.to_vec();
        padded.resize(MAX_PAYLOAD_SIZE, 0);
        self.hash = rolling_hash(&padded);
        self.sha_hash = sha1_digest(&padded);
        self.hash_type = HASH_TYPE_BOTH;
        self.size_uncompressed = MAX_PAYLOAD_SIZE as u32;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&padded)?;
        let compressed = encoder.finish()?;
        if compressed.len() < padded.len() {
            self.stored_as = STORED_COMPRESSED;
            self.data = compressed;
        } else {
            self.stored_as = 0;
            self.data = padded;
        }
        self.size_compressed = self.data.len() as u32;
        self.decompressed = OnceCell::new();
        Ok(())
    }

    /// Serialize as a version-3 chunk. The stored payload is written as-is.
    pub fn serialize(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write_u32(CHUNK_MAGIC);
        writer.write_u32(3);
        let header_size_at = writer.len();
        writer.write_u32(0);
        writer.write_u32(self.data.len() as u32);
        writer.write_guid(&self.guid);
        writer.write_u64(self.hash);
        writer.write_u8(self.stored_as);
        writer.write_bytes(&self.sha_hash);
        writer.write_u8(self.hash_type);
        writer.write_u32(self.size_uncompressed);
        let header_size = writer.len() as u32;
        writer.patch_u32(header_size_at, header_size);
        writer.write_bytes(&self.data);
        writer.into_inner()
    }

    pub fn new(guid: [u32; 4]) -> Self {
        Self {
            version: 3,
            header_size: 0,
            size_compressed: 0,
            size_uncompressed: MAX_PAYLOAD_SIZE as u32,
            guid,
            hash: 0,
            sha_hash: [0_u8; 20],
            stored_as: 0,
            hash_type: 0,
            data: Vec::new(),
            decompressed: OnceCell::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_guid() -> [u32; 4] {
        [0xDEADBEEF, 0x01020304, 0xCAFEBABE, 0x0A0B0C0D]
    }

    #[test]
    fn encode_then_parse_round_trips_payload() {
        let payload = b"reconstructable chunk contents".to_vec();
        let mut chunk = Chunk::new(sample_guid());
        chunk.set_payload(&payload).unwrap();
        let wire = chunk.serialize();

        let parsed = Chunk::parse(&wire).unwrap();
        assert_eq!(parsed.guid, sample_guid());
        assert_eq!(parsed.hash, chunk.hash);
        assert_eq!(parsed.sha_hash, chunk.sha_hash);
        assert_eq!(&parsed.payload().unwrap()[..payload.len()], &payload[..]);
        assert_eq!(parsed.payload().unwrap().len(), MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut chunk = Chunk::new(sample_guid());
        chunk.set_payload(b"x").unwrap();
        let mut wire = chunk.serialize();
        wire[0] ^= 0xFF;
        assert!(matches!(Chunk::parse(&wire), Err(EngineError::Format(_))));
    }

    #[test]
    fn rejects_header_size_mismatch() {
        let mut chunk = Chunk::new(sample_guid());
        chunk.set_payload(b"x").unwrap();
        let mut wire = chunk.serialize();
        // header_size field sits right after magic + version
        wire[8] = wire[8].wrapping_add(1);
        assert!(matches!(Chunk::parse(&wire), Err(EngineError::Format(_))));
    }

    #[test]
    fn rejects_oversized_payload() {
        let mut chunk = Chunk::new(sample_guid());
        let oversized = vec![0_u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            chunk.set_payload(&oversized),
            Err(EngineError::Format(_))
        ));
    }

    #[test]
    fn compressed_payload_inflates_once() {
        use flate2::write::ZlibEncoder;
        use flate2::Compression;
        use std::io::Write;

        let payload = vec![7_u8; 4096];
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut chunk = Chunk::new(sample_guid());
        chunk.data = compressed.clone();
        chunk.size_compressed = compressed.len() as u32;
        chunk.size_uncompressed = payload.len() as u32;
        chunk.stored_as = STORED_COMPRESSED;

        let first = chunk.payload().unwrap().to_vec();
        let second = chunk.payload().unwrap().to_vec();
        assert_eq!(first, payload);
        assert_eq!(second, payload);
    }

    #[test]
    fn corrupt_compressed_payload_is_decompression_error() {
        let mut chunk = Chunk::new(sample_guid());
        chunk.data = vec![0xAB; 64];
        chunk.size_compressed = 64;
        chunk.stored_as = STORED_COMPRESSED;
        assert!(matches!(
            chunk.payload(),
            Err(EngineError::Decompression(_))
        ));
    }

    #[test]
    fn incompressible_payload_survives_the_wire() {
        use rand::RngCore;

        // Random bytes barely compress; exercises the large-blob path.
        let mut payload = vec![0_u8; 256 * 1024];
        rand::thread_rng().fill_bytes(&mut payload);

        let mut chunk = Chunk::new(sample_guid());
        chunk.set_payload(&payload).unwrap();
        let parsed = Chunk::parse(&chunk.serialize()).unwrap();
        assert_eq!(&parsed.payload().unwrap()[..payload.len()], &payload[..]);
    }

    #[test]
    fn rolling_hash_is_input_sensitive() {
        let a = rolling_hash(b"aaaa");
        let b = rolling_hash(b"aaab");
        assert_ne!(a, b);
        assert_eq!(a, rolling_hash(b"aaaa"));
    }
}
