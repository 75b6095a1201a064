use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{PatchError, Result};

/// Size of one on-disk segment record. The first record starts right after
/// the 16-byte magic/version/flags block, so this doubles as its offset.
pub const SEGMENT_HEADER_SIZE: usize = 0x10;

pub const NSO_FLAGS_OFFSET: usize = 0x0C;
pub const TEXT_HEADER_OFFSET: usize = SEGMENT_HEADER_SIZE;
pub const RODATA_HEADER_OFFSET: usize = SEGMENT_HEADER_SIZE * 2;
pub const DATA_HEADER_OFFSET: usize = SEGMENT_HEADER_SIZE * 3;
/// The `.bss` size lives in the auxiliary word of the data record.
pub const BSS_SIZE_OFFSET: usize = DATA_HEADER_OFFSET + 0xC;
/// Three consecutive little-endian compressed sizes (text, rodata, data).
pub const COMPRESSED_SEGMENT_NSO_OFFSET: usize = 0x60;
pub const NSO_HEADER_SIZE: usize = 0x100;

/// All three segments compressed, no segment hash checks.
pub const NSO_PATCHED_FLAGS: u8 = 0x07;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Segment {
    Text,
    Rodata,
    Data,
}

impl Segment {
    pub const ALL: [Segment; 3] = [Segment::Text, Segment::Rodata, Segment::Data];

    pub fn index(self) -> usize {
        match self {
            Segment::Text => 0,
            Segment::Rodata => 1,
            Segment::Data => 2,
        }
    }

    pub fn header_offset(self) -> usize {
        match self {
            Segment::Text => TEXT_HEADER_OFFSET,
            Segment::Rodata => RODATA_HEADER_OFFSET,
            Segment::Data => DATA_HEADER_OFFSET,
        }
    }

    pub fn compressed_size_offset(self) -> usize {
        COMPRESSED_SEGMENT_NSO_OFFSET + self.index() * 4
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Segment::Text => ".text",
            Segment::Rodata => ".rodata",
            Segment::Data => ".data",
        };
        f.write_str(name)
    }
}

/// One segment record from the NSO header.
///
/// `other` is the word following the size: the module name offset for text,
/// the module name size for rodata and the `.bss` size for data.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SegmentHeader {
    pub file_offset: u32,
    pub memory_offset: u32,
    pub decompressed_size: u32,
    pub other: u32,
}

impl SegmentHeader {
    pub fn from_bytes(raw: &[u8; SEGMENT_HEADER_SIZE]) -> Self {
        Self {
            file_offset: read_u32_le(raw, 0),
            memory_offset: read_u32_le(raw, 4),
            decompressed_size: read_u32_le(raw, 8),
            other: read_u32_le(raw, 12),
        }
    }

    pub fn to_bytes(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut out = [0u8; SEGMENT_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.file_offset.to_le_bytes());
        out[4..8].copy_from_slice(&self.memory_offset.to_le_bytes());
        out[8..12].copy_from_slice(&self.decompressed_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.other.to_le_bytes());
        out
    }
}

/// Snapshot of the three segment records. Taken fresh from the buffer every
/// time the header may have changed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SegmentHeaders {
    pub text: SegmentHeader,
    pub rodata: SegmentHeader,
    pub data: SegmentHeader,
}

impl SegmentHeaders {
    pub fn read(nso: &[u8]) -> Result<Self> {
        if nso.len() < NSO_HEADER_SIZE {
            return Err(PatchError::MalformedImage(format!(
                "image is {} bytes, smaller than the {:#X}-byte NSO header",
                nso.len(),
                NSO_HEADER_SIZE
            )));
        }

        let record = |segment: Segment| {
            let start = segment.header_offset();
            let mut raw = [0u8; SEGMENT_HEADER_SIZE];
            raw.copy_from_slice(&nso[start..start + SEGMENT_HEADER_SIZE]);
            SegmentHeader::from_bytes(&raw)
        };

        Ok(Self {
            text: record(Segment::Text),
            rodata: record(Segment::Rodata),
            data: record(Segment::Data),
        })
    }

    pub fn get(&self, segment: Segment) -> &SegmentHeader {
        match segment {
            Segment::Text => &self.text,
            Segment::Rodata => &self.rodata,
            Segment::Data => &self.data,
        }
    }

    /// Byte ranges of the compressed payloads. Each segment runs up to the
    /// next one's file offset and the data segment runs to end of file.
    pub fn compressed_ranges(&self, file_len: usize) -> Result<[(usize, usize); 3]> {
        let text = self.text.file_offset as usize;
        let rodata = self.rodata.file_offset as usize;
        let data = self.data.file_offset as usize;

        if text < NSO_HEADER_SIZE || rodata < text || data < rodata || data > file_len {
            return Err(PatchError::MalformedImage(format!(
                "segment file offsets out of order or beyond the image: text={:#X} rodata={:#X} data={:#X} len={:#X}",
                text, rodata, data, file_len
            )));
        }

        Ok([(text, rodata), (rodata, data), (data, file_len)])
    }
}

pub fn read_u32_le(raw: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([raw[pos], raw[pos + 1], raw[pos + 2], raw[pos + 3]])
}

pub fn write_u32_le(raw: &mut [u8], pos: usize, value: u32) {
    raw[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
}

/// Virtual base address of each segment of one executable. Diff addresses
/// are routed to a segment by these half-open ranges.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NsoOffsets {
    pub text: u64,
    pub rodata: u64,
    pub data: u64,
}

impl NsoOffsets {
    pub const fn new(text: u64, rodata: u64, data: u64) -> Self {
        Self { text, rodata, data }
    }

    /// Anything at or above the data base, and anything the table does not
    /// otherwise cover, lands in the data segment.
    pub fn classify(&self, address: u64) -> Segment {
        if address < self.rodata {
            Segment::Text
        } else if address < self.data {
            Segment::Rodata
        } else {
            Segment::Data
        }
    }

    pub fn base(&self, segment: Segment) -> u64 {
        match segment {
            Segment::Text => self.text,
            Segment::Rodata => self.rodata,
            Segment::Data => self.data,
        }
    }
}

pub const MAIN_NSO_OFFSETS: NsoOffsets =
    NsoOffsets::new(0x71_0000_0000, 0x71_012C_0000, 0x71_01A0_8000);

pub const SUBSDK_NSO_OFFSETS: NsoOffsets =
    NsoOffsets::new(0x71_0320_0000, 0x71_0324_0000, 0x71_0325_0000);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_header_round_trips() {
        let raw: [u8; SEGMENT_HEADER_SIZE] = [
            0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x12, 0x00, 0x00, 0x20, 0x00,
            0x00, 0x00,
        ];
        let header = SegmentHeader::from_bytes(&raw);
        assert_eq!(header.file_offset, 0x100);
        assert_eq!(header.memory_offset, 0);
        assert_eq!(header.decompressed_size, 0x1240);
        assert_eq!(header.other, 0x20);
        assert_eq!(header.to_bytes(), raw);
    }

    #[test]
    fn classifies_half_open_ranges() {
        let offsets = NsoOffsets::new(0x1000, 0x2000, 0x3000);
        assert_eq!(offsets.classify(0x1000), Segment::Text);
        assert_eq!(offsets.classify(0x1FFF), Segment::Text);
        assert_eq!(offsets.classify(0x2000), Segment::Rodata);
        assert_eq!(offsets.classify(0x2FFF), Segment::Rodata);
        assert_eq!(offsets.classify(0x3000), Segment::Data);
    }

    #[test]
    fn unmapped_high_addresses_fall_through_to_data() {
        let offsets = NsoOffsets::new(0x1000, 0x2000, 0x3000);
        assert_eq!(offsets.classify(0xFFFF_FFFF_0000), Segment::Data);
    }

    #[test]
    fn rejects_truncated_header() {
        let err = SegmentHeaders::read(&[0u8; 0x40]).unwrap_err();
        assert!(matches!(err, PatchError::MalformedImage(_)));
    }

    #[test]
    fn rejects_unordered_segments() {
        let mut nso = vec![0u8; NSO_HEADER_SIZE + 0x30];
        write_u32_le(&mut nso, TEXT_HEADER_OFFSET, 0x120);
        write_u32_le(&mut nso, RODATA_HEADER_OFFSET, 0x110);
        write_u32_le(&mut nso, DATA_HEADER_OFFSET, 0x128);
        let headers = SegmentHeaders::read(&nso).unwrap();
        assert!(headers.compressed_ranges(nso.len()).is_err());
    }
}
