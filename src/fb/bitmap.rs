//! Background bitmap decoding
//!
//! Only uncompressed 24-bit bitmaps are accepted. The header is read at fixed
//! little-endian offsets:
//!
//! | offset | size | field             |
//! |--------|------|-------------------|
//! | 10     | 4    | pixel data offset |
//! | 18     | 4    | width             |
//! | 22     | 4    | height            |
//! | 28     | 2    | bits per pixel    |
//!
//! Rows are stored bottom-up, each padded to a multiple of 4 bytes.

use thiserror::Error;

/// The one supported bit depth
pub const BITMAP_DEPTH: u16 = 24;

const DATA_OFFSET_AT: usize = 10;
const WIDTH_AT: usize = 18;
const HEIGHT_AT: usize = 22;
const DEPTH_AT: usize = 28;
const HEADER_LEN: usize = DEPTH_AT + 2;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BitmapError {
    #[error("bitmap header truncated ({0} bytes)")]
    TruncatedHeader(usize),
    #[error("unsupported bitmap depth {0}, only 24 bits per pixel is supported")]
    UnsupportedDepth(u16),
    #[error("unsupported bitmap dimensions {width}x{height}")]
    Dimensions { width: i32, height: i32 },
    #[error("bitmap pixel data truncated: need {needed} bytes, have {have}")]
    TruncatedData { needed: usize, have: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapHeader {
    pub data_offset: usize,
    pub width: usize,
    pub height: usize,
    pub depth: u16,
}

impl BitmapHeader {
    /// Bytes per stored row, rounded up to a 4-byte boundary; `None` if
    /// that does not fit in a `usize`
    pub fn row_stride(&self) -> Option<usize> {
        row_stride(self.depth as usize, self.width)
    }
}

fn row_stride(depth: usize, width: usize) -> Option<usize> {
    let bits = depth.checked_mul(width)?;
    Some(bits.div_ceil(32) * 4)
}

/// A validated bitmap borrowing the file contents
#[derive(Debug)]
pub struct Bitmap<'a> {
    pub header: BitmapHeader,
    stride: usize,
    data: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pixel {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Read one 3-byte source pixel
pub fn pixel_at(src: &[u8]) -> Pixel {
    Pixel {
        r: src[0],
        g: src[1],
        b: src[2],
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

/// Validate the header of a whole bitmap file
pub fn decode(data: &[u8]) -> Result<Bitmap<'_>, BitmapError> {
    if data.len() < HEADER_LEN {
        return Err(BitmapError::TruncatedHeader(data.len()));
    }

    let depth = read_u16(data, DEPTH_AT);
    if depth != BITMAP_DEPTH {
        return Err(BitmapError::UnsupportedDepth(depth));
    }

    let width = read_u32(data, WIDTH_AT) as i32;
    let height = read_u32(data, HEIGHT_AT) as i32;
    // negative heights mark top-down bitmaps, which we do not handle
    if width <= 0 || height <= 0 {
        return Err(BitmapError::Dimensions { width, height });
    }

    let header = BitmapHeader {
        data_offset: read_u32(data, DATA_OFFSET_AT) as usize,
        width: width as usize,
        height: height as usize,
        depth,
    };

    // sizes must not wrap on 32-bit targets
    let dimensions = BitmapError::Dimensions { width, height };
    let stride = header.row_stride().ok_or_else(|| dimensions.clone())?;
    header.width.checked_mul(3).ok_or_else(|| dimensions.clone())?;
    let needed = stride
        .checked_mul(header.height)
        .and_then(|n| n.checked_add(header.data_offset))
        .ok_or(dimensions)?;
    if needed > data.len() {
        return Err(BitmapError::TruncatedData {
            needed,
            have: data.len(),
        });
    }

    Ok(Bitmap {
        header,
        stride,
        data,
    })
}

impl<'a> Bitmap<'a> {
    /// Pixel bytes of image row `y`, counted from the top
    pub fn row(&self, y: usize) -> &'a [u8] {
        let start = self.header.data_offset + (self.header.height - 1 - y) * self.stride;
        &self.data[start..start + self.header.width * 3]
    }

    /// Pixels of image row `y`, counted from the top
    pub fn pixels(&self, y: usize) -> impl Iterator<Item = Pixel> + 'a {
        self.row(y).chunks_exact(3).map(pixel_at)
    }
}

/// Build a bitmap file in memory, rows given top-down
#[cfg(test)]
pub fn encode(width: usize, rows: &[Vec<[u8; 3]>]) -> Vec<u8> {
    let height = rows.len();
    let stride = (24 * width).div_ceil(32) * 4;
    let data_offset = 54;

    let mut out = vec![0u8; data_offset];
    out[0] = b'B';
    out[1] = b'M';
    out[DATA_OFFSET_AT..DATA_OFFSET_AT + 4].copy_from_slice(&(data_offset as u32).to_le_bytes());
    out[WIDTH_AT..WIDTH_AT + 4].copy_from_slice(&(width as u32).to_le_bytes());
    out[HEIGHT_AT..HEIGHT_AT + 4].copy_from_slice(&(height as u32).to_le_bytes());
    out[DEPTH_AT..DEPTH_AT + 2].copy_from_slice(&BITMAP_DEPTH.to_le_bytes());

    for row in rows.iter().rev() {
        let mut line = vec![0u8; stride];
        for (x, px) in row.iter().enumerate() {
            line[x * 3..x * 3 + 3].copy_from_slice(px);
        }
        out.extend_from_slice(&line);
    }
    out
}
