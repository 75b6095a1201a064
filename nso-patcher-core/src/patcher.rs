//! Applies offset diffs to the three LZ4-compressed segments of an NSO image
//! and keeps the header's offsets and sizes consistent with the new payloads.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::diff::{Diff, DiffFile};
use crate::nso::{
    read_u32_le, write_u32_le, NsoOffsets, Segment, SegmentHeaders, BSS_SIZE_OFFSET,
    DATA_HEADER_OFFSET, NSO_FLAGS_OFFSET, NSO_PATCHED_FLAGS, RODATA_HEADER_OFFSET,
};
use crate::{PatchError, Result};

/// LZ4 block without the 4-byte size prefix; the NSO header carries sizes.
pub fn compress_segment(data: &[u8]) -> Result<Vec<u8>> {
    Ok(lz4::block::compress(data, None, false)?)
}

pub fn decompress_segment(segment: Segment, data: &[u8], size: u32) -> Result<Vec<u8>> {
    let expected = size as usize;
    let declared = i32::try_from(size).map_err(|_| {
        PatchError::MalformedImage(format!("{segment} declares {size} bytes, too large"))
    })?;

    let out = lz4::block::decompress(data, Some(declared)).map_err(|e| PatchError::Decompress {
        segment,
        detail: e.to_string(),
    })?;

    if out.len() != expected {
        return Err(PatchError::DecompressedSize {
            segment,
            expected,
            actual: out.len(),
        });
    }
    Ok(out)
}

/// How one segment's compressed payload changed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SegmentChange {
    pub segment: Segment,
    pub old_compressed_size: usize,
    pub new_compressed_size: usize,
    pub file_offset: u32,
}

#[derive(Debug)]
pub struct PatchedImage {
    pub bytes: Vec<u8>,
    pub segments: [SegmentChange; 3],
}

/// Loads the image and every diff file not rejected by `skip`, then patches.
pub fn apply_patches<F>(
    nso_path: &Path,
    diff_paths: &[PathBuf],
    offsets: &NsoOffsets,
    mut skip: F,
) -> Result<PatchedImage>
where
    F: FnMut(&str) -> Result<bool>,
{
    let nso = fs::read(nso_path).map_err(|source| PatchError::Read {
        path: nso_path.to_path_buf(),
        source,
    })?;

    let mut diff_files = Vec::with_capacity(diff_paths.len());
    for path in diff_paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if skip(&name)? {
            debug!("skipping {name}");
            continue;
        }
        diff_files.push(DiffFile::load(path)?);
    }

    patch_image(nso, &diff_files, offsets)
}

pub fn patch_image(
    mut nso: Vec<u8>,
    diff_files: &[DiffFile],
    offsets: &NsoOffsets,
) -> Result<PatchedImage> {
    let original = SegmentHeaders::read(&nso)?;
    let ranges = original.compressed_ranges(nso.len())?;

    let mut buffers: [Vec<u8>; 3] = Default::default();
    for segment in Segment::ALL {
        let (start, end) = ranges[segment.index()];
        buffers[segment.index()] = decompress_segment(
            segment,
            &nso[start..end],
            original.get(segment).decompressed_size,
        )?;
    }

    for file in diff_files {
        debug!("applying {} ({} diffs)", file.name, file.diffs.len());
        for diff in &file.diffs {
            apply_diff(&mut buffers, offsets, &file.name, diff)?;
        }
    }

    let mut compressed: [Vec<u8>; 3] = Default::default();
    for segment in Segment::ALL {
        compressed[segment.index()] = compress_segment(&buffers[segment.index()])?;
    }

    let old_size = |segment: Segment| {
        let (start, end) = ranges[segment.index()];
        end - start
    };
    let growth = |segment: Segment| {
        let new = compressed[segment.index()].len();
        let old = old_size(segment);
        if new > old {
            u32::try_from(new - old).ok()
        } else {
            None
        }
    };

    // Offsets only ever move forward. A segment that shrank keeps its slot.
    if let Some(delta) = growth(Segment::Text) {
        debug!("{} grew by {delta:#X} bytes", Segment::Text);
        let headers = SegmentHeaders::read(&nso)?;
        let rodata = shifted(headers.rodata.file_offset, delta)?;
        let data = shifted(headers.data.file_offset, delta)?;
        write_u32_le(&mut nso, RODATA_HEADER_OFFSET, rodata);
        write_u32_le(&mut nso, DATA_HEADER_OFFSET, data);
    }

    if let Some(delta) = growth(Segment::Rodata) {
        debug!("{} grew by {delta:#X} bytes", Segment::Rodata);
        let headers = SegmentHeaders::read(&nso)?;
        let data = shifted(headers.data.file_offset, delta)?;
        write_u32_le(&mut nso, DATA_HEADER_OFFSET, data);
    }

    if let Some(delta) = growth(Segment::Data) {
        debug!("{} grew by {delta:#X} bytes", Segment::Data);
        let headers = SegmentHeaders::read(&nso)?;
        let bss = shifted(headers.data.other, delta)?;
        write_u32_le(&mut nso, BSS_SIZE_OFFSET, bss);
    }

    let headers = SegmentHeaders::read(&nso)?;
    for segment in Segment::ALL {
        let start = headers.get(segment).file_offset as usize;
        write_bytes(&mut nso, start, &compressed[segment.index()]);
    }

    for segment in Segment::ALL {
        let size = u32::try_from(compressed[segment.index()].len()).map_err(|_| {
            PatchError::MalformedImage(format!("compressed {segment} exceeds 4 GiB"))
        })?;
        write_u32_le(&mut nso, segment.compressed_size_offset(), size);
    }

    nso[NSO_FLAGS_OFFSET] = NSO_PATCHED_FLAGS;

    let change = |segment: Segment| SegmentChange {
        segment,
        old_compressed_size: old_size(segment),
        new_compressed_size: compressed[segment.index()].len(),
        file_offset: headers.get(segment).file_offset,
    };
    let segments = [
        change(Segment::Text),
        change(Segment::Rodata),
        change(Segment::Data),
    ];

    Ok(PatchedImage {
        bytes: nso,
        segments,
    })
}

fn apply_diff(
    buffers: &mut [Vec<u8>; 3],
    offsets: &NsoOffsets,
    file_name: &str,
    diff: &Diff,
) -> Result<()> {
    let segment = offsets.classify(diff.address);
    let buffer = &mut buffers[segment.index()];
    let segment_len = buffer.len();

    let range = diff
        .address
        .checked_sub(offsets.base(segment))
        .and_then(|rel| usize::try_from(rel).ok())
        .and_then(|start| Some((start, start.checked_add(diff.bytes.len())?)))
        .filter(|&(_, end)| end <= segment_len);

    let (start, end) = range.ok_or_else(|| PatchError::DiffOutOfRange {
        file: file_name.to_string(),
        address: diff.address,
        len: diff.bytes.len(),
        segment,
        segment_len,
    })?;

    buffer[start..end].copy_from_slice(&diff.bytes);
    Ok(())
}

fn shifted(value: u32, delta: u32) -> Result<u32> {
    value.checked_add(delta).ok_or_else(|| {
        PatchError::MalformedImage(format!("header field {value:#X} overflows when grown by {delta:#X}"))
    })
}

/// Writes `data` at `pos`, growing the buffer when the write runs past its end.
fn write_bytes(buf: &mut Vec<u8>, pos: usize, data: &[u8]) {
    let end = pos + data.len();
    if buf.len() < end {
        buf.resize(end, 0);
    }
    buf[pos..end].copy_from_slice(data);
}

/// Reads a segment back out of a patched image using the recorded sizes.
pub fn extract_segment(nso: &[u8], segment: Segment) -> Result<Vec<u8>> {
    let headers = SegmentHeaders::read(nso)?;
    let header = headers.get(segment);
    let start = header.file_offset as usize;
    let len = read_u32_le(nso, segment.compressed_size_offset()) as usize;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= nso.len())
        .ok_or_else(|| {
            PatchError::MalformedImage(format!("{segment} payload runs past the end of the image"))
        })?;
    decompress_segment(segment, &nso[start..end], header.decompressed_size)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::nso::{SegmentHeader, NSO_HEADER_SIZE, SEGMENT_HEADER_SIZE};

    pub(crate) const BSS_SIZE: u32 = 0x40;

    /// Builds a minimal NSO whose segments hold the given decompressed bytes.
    pub(crate) fn build_nso(segments: [&[u8]; 3]) -> Vec<u8> {
        let mut nso = vec![0u8; NSO_HEADER_SIZE];
        nso[0..4].copy_from_slice(b"NSO0");
        nso[NSO_FLAGS_OFFSET] = 0x3F;

        let mut memory_offset = 0u32;
        for segment in Segment::ALL {
            let raw = segments[segment.index()];
            let compressed = compress_segment(raw).unwrap();
            let header = SegmentHeader {
                file_offset: nso.len() as u32,
                memory_offset,
                decompressed_size: raw.len() as u32,
                other: if segment == Segment::Data { BSS_SIZE } else { 0 },
            };
            let at = segment.header_offset();
            nso[at..at + SEGMENT_HEADER_SIZE].copy_from_slice(&header.to_bytes());
            write_u32_le(&mut nso, segment.compressed_size_offset(), compressed.len() as u32);
            nso.extend_from_slice(&compressed);
            memory_offset += 0x1000;
        }
        nso
    }
}
