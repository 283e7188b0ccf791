//! Minimal NIfTI-1 header handling: just enough to write an all-zero image
//! that keeps the shape and orientation of a template image.

use std::fs;
use std::path::Path;

use crate::error::{IoContext, PipelineError, Result};

const HEADER_SIZE: usize = 348;
const DIM_OFFSET: usize = 40;
const BITPIX_OFFSET: usize = 72;
const VOX_OFFSET_OFFSET: usize = 108;
const SCL_INTER_OFFSET: usize = 116;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

struct Header<'a> {
    bytes: &'a [u8],
    endian: Endian,
}

impl<'a> Header<'a> {
    fn parse(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
        let endian = if i32::from_le_bytes(raw) == HEADER_SIZE as i32 {
            Endian::Little
        } else if i32::from_be_bytes(raw) == HEADER_SIZE as i32 {
            Endian::Big
        } else {
            return None;
        };
        Some(Self { bytes, endian })
    }

    fn i16_at(&self, offset: usize) -> i16 {
        let raw = [self.bytes[offset], self.bytes[offset + 1]];
        match self.endian {
            Endian::Little => i16::from_le_bytes(raw),
            Endian::Big => i16::from_be_bytes(raw),
        }
    }

    fn f32_at(&self, offset: usize) -> f32 {
        let raw = [
            self.bytes[offset],
            self.bytes[offset + 1],
            self.bytes[offset + 2],
            self.bytes[offset + 3],
        ];
        match self.endian {
            Endian::Little => f32::from_le_bytes(raw),
            Endian::Big => f32::from_be_bytes(raw),
        }
    }

    fn data_offset(&self) -> usize {
        let offset = self.f32_at(VOX_OFFSET_OFFSET);
        if offset.is_finite() && offset >= HEADER_SIZE as f32 {
            offset as usize
        } else {
            // Single-file images always reserve the 4-byte extension flag.
            HEADER_SIZE + 4
        }
    }

    fn data_len(&self) -> Option<usize> {
        let ndim = self.i16_at(DIM_OFFSET);
        if !(1..=7).contains(&ndim) {
            return None;
        }
        let mut voxels: usize = 1;
        for i in 1..=ndim as usize {
            let extent = self.i16_at(DIM_OFFSET + 2 * i);
            if extent < 1 {
                return None;
            }
            voxels = voxels.checked_mul(extent as usize)?;
        }
        let bitpix = self.i16_at(BITPIX_OFFSET);
        if bitpix < 1 || bitpix % 8 != 0 {
            return None;
        }
        voxels.checked_mul(bitpix as usize / 8)
    }

    fn zero_f32(&self) -> [u8; 4] {
        match self.endian {
            Endian::Little => 0f32.to_le_bytes(),
            Endian::Big => 0f32.to_be_bytes(),
        }
    }
}

pub(crate) fn is_uncompressed_nifti(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase().ends_with(".nii"))
        .unwrap_or(false)
}

/// Write an image at `out` with `template`'s header and every voxel set to 0.
pub(crate) fn write_zero_like(template: &Path, out: &Path) -> Result<()> {
    let bytes = fs::read(template).at(template)?;
    let invalid = |why: &str| {
        PipelineError::engine(
            "zero_image",
            format!("{} is not a usable NIfTI-1 image: {why}", template.display()),
        )
    };
    let header = Header::parse(&bytes).ok_or_else(|| invalid("bad header"))?;
    let offset = header.data_offset();
    let data_len = header.data_len().ok_or_else(|| invalid("bad dimensions"))?;
    if offset > bytes.len() {
        return Err(invalid("voxel offset past end of file"));
    }
    let end = match offset.checked_add(data_len) {
        Some(end) if end <= bytes.len() => end,
        _ => return Err(invalid("data past end of file")),
    };

    let mut output = Vec::with_capacity(end);
    output.extend_from_slice(&bytes[..offset]);
    // A non-zero intercept would turn stored zeros into non-zero values.
    output[SCL_INTER_OFFSET..SCL_INTER_OFFSET + 4].copy_from_slice(&header.zero_f32());
    output.resize(end, 0);
    fs::write(out, &output).at(out)?;
    Ok(())
}
