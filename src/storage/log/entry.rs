use anyhow::{Result, anyhow};
use bincode::{Decode, Encode};
use tracing::warn;

pub const ENTRY_MAGIC_NUM: u32 = 0x_1234_5678;
pub const ENTRY_HEADER_SIZE: u32 = 16; // 4 + 4 + 4 + 4 = 16 bytes

fn encode<T: Encode>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::encode_to_vec(value, bincode::config::standard())?)
}

fn decode<T: Decode<()>>(data: &[u8], what: &str) -> Result<T> {
    let (value, _) = bincode::decode_from_slice(data, bincode::config::standard()).map_err(|e| {
        warn!("Failed to deserialize {}: {}", what, e);
        e
    })?;
    Ok(value)
}

/// Location and term of one stored entry inside a segment file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryMeta {
    pub log_index: u64,
    pub term: u64,
    /// Offset of the entry payload (just past its frame header).
    pub offset: u64,
    /// Payload size in bytes.
    pub size: u64,
}

/// Closes one atomic append. Entry frames that are not followed by their
/// commit record are discarded on replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Decode, Encode)]
pub struct CommitRecord {
    pub first_index: u64,
    pub last_index: u64,
}

impl CommitRecord {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        decode(data, "commit record")
    }
}

/// Represents a truncate operation record stored in the log segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Decode, Encode)]
pub struct TruncateRecord {
    pub truncate_index: u64,
}

impl TruncateRecord {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        decode(data, "truncate record")
    }
}

/// One key/value update of the metadata file.
#[derive(Debug, Clone, PartialEq, Eq, Decode, Encode)]
pub struct MetaRecord {
    pub key: String,
    pub value: u64,
}

impl MetaRecord {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        decode(data, "meta record")
    }
}

pub(crate) fn serialize_log_entry(entry: &crate::message::LogEntry) -> Result<Vec<u8>> {
    encode(entry)
}

pub(crate) fn deserialize_log_entry(data: &[u8]) -> Result<crate::message::LogEntry> {
    decode(data, "log entry")
}

/// Valid entries of the log. `entries[i]` holds log index `i + 1`.
#[derive(Debug, Clone, Default)]
pub struct EntryIndex {
    pub entries: Vec<EntryMeta>,
}

impl EntryIndex {
    pub fn last_log_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_entry(&self) -> Option<&EntryMeta> {
        self.entries.last()
    }

    /// Check if a log index is valid (not truncated)
    pub fn is_valid_index(&self, log_index: u64) -> bool {
        log_index >= 1 && log_index <= self.last_log_index()
    }

    /// Get entry meta for a given log index
    pub fn get_entry(&self, log_index: u64) -> Option<&EntryMeta> {
        if !self.is_valid_index(log_index) {
            return None;
        }
        self.entries.get((log_index - 1) as usize)
    }

    /// Metas for `[low, high)` clamped to the valid range.
    pub fn range(&self, low: u64, high: u64) -> &[EntryMeta] {
        let low = low.max(1);
        let high = high.min(self.last_log_index() + 1);
        if low >= high {
            return &[];
        }
        &self.entries[(low - 1) as usize..(high - 1) as usize]
    }

    /// Truncate entries after the given index (exclusive - keeps the index)
    pub fn truncate_suffix(&mut self, index: u64) {
        if index >= self.last_log_index() {
            return;
        }
        self.entries.truncate(index as usize);
    }

    /// Append metas that continue the log. The caller has already checked
    /// contiguity.
    pub fn extend(&mut self, metas: impl IntoIterator<Item = EntryMeta>) {
        self.entries.extend(metas);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Entry,
    Commit,
    TruncateSuffix,
    Meta,
}

impl RecordType {
    fn code(self) -> u32 {
        match self {
            RecordType::Entry => 1,
            RecordType::Commit => 2,
            RecordType::TruncateSuffix => 3,
            RecordType::Meta => 4,
        }
    }

    fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(RecordType::Entry),
            2 => Ok(RecordType::Commit),
            3 => Ok(RecordType::TruncateSuffix),
            4 => Ok(RecordType::Meta),
            _ => Err(anyhow!("Invalid record type {}", code)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    /// Frame size, header included.
    pub size: u32,
    pub record_type: RecordType,
    pub magic_num: u32,
    pub crc: u32,
}

impl EntryHeader {
    pub fn new(record_type: RecordType, payload: &[u8]) -> Self {
        Self {
            size: payload.len() as u32 + ENTRY_HEADER_SIZE,
            record_type,
            magic_num: ENTRY_MAGIC_NUM,
            crc: crc32fast::hash(payload),
        }
    }

    pub fn payload_size(&self) -> u64 {
        (self.size - ENTRY_HEADER_SIZE) as u64
    }

    pub fn serialize(&self) -> [u8; ENTRY_HEADER_SIZE as usize] {
        let mut buf = [0u8; ENTRY_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.record_type.code().to_le_bytes());
        buf[8..12].copy_from_slice(&self.magic_num.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < ENTRY_HEADER_SIZE as usize {
            return Err(anyhow!("Invalid length"));
        }

        let read_u32 = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&data[at..at + 4]);
            u32::from_le_bytes(bytes)
        };

        let size = read_u32(0);
        let type_code = read_u32(4);
        let magic_num = read_u32(8);
        let crc = read_u32(12);

        if magic_num != ENTRY_MAGIC_NUM {
            return Err(anyhow!("Invalid magic number"));
        }
        if size < ENTRY_HEADER_SIZE {
            return Err(anyhow!("Invalid frame size {}", size));
        }

        Ok(Self {
            size,
            record_type: RecordType::from_code(type_code)?,
            magic_num,
            crc,
        })
    }

    /// Header bytes followed by the payload.
    pub fn frame(record_type: RecordType, payload: &[u8]) -> Vec<u8> {
        let header = Self::new(record_type, payload);
        let mut buf = Vec::with_capacity(header.size as usize);
        buf.extend_from_slice(&header.serialize());
        buf.extend_from_slice(payload);
        buf
    }
}
