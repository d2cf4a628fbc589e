//! Framebuffer output
//!
//! The kernel console draws menu text onto the framebuffer over black. The
//! [`Compositor`] keeps a decoded copy of the background image and, after
//! each line of text, swaps the untouched black pixels back to background.

pub mod bitmap;
pub mod compositor;
pub mod device;

pub use compositor::Compositor;
pub use device::Framebuffer;

/// Glyph cell width of the console font, in pixels
pub const CHAR_WIDTH: usize = 8;

/// Glyph cell height of the console font, in pixels
pub const CHAR_HEIGHT: usize = 16;

/// Screen geometry as reported by the framebuffer driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Visible width in pixels
    pub width: usize,
    /// Visible height in pixels
    pub height: usize,
    pub bits_per_pixel: usize,
    /// Bytes per scanline, may exceed `width * bytes_per_pixel`
    pub line_length: usize,
    pub xoffset: usize,
    pub yoffset: usize,
}

impl Geometry {
    pub fn bytes_per_pixel(&self) -> usize {
        self.bits_per_pixel / 8
    }

    /// Bytes covered by the visible screen, the size of the mapping
    pub fn screen_size(&self) -> usize {
        self.width * self.height * self.bits_per_pixel / 8
    }

    /// Byte offset of pixel (x, y) after applying the display offsets
    pub fn offset(&self, x: usize, y: usize) -> usize {
        (x + self.xoffset) * self.bytes_per_pixel() + (y + self.yoffset) * self.line_length
    }

    /// Text columns that fit on one line
    pub fn columns(&self) -> usize {
        self.width / CHAR_WIDTH
    }
}

/// Byte-addressed pixel memory with a known geometry
pub trait Surface {
    fn geometry(&self) -> Geometry;
    fn pixels(&self) -> &[u8];
    fn pixels_mut(&mut self) -> &mut [u8];
}

/// Heap-backed surface standing in for the device
#[cfg(test)]
pub struct MemorySurface {
    pub geometry: Geometry,
    pub pixels: Vec<u8>,
}

#[cfg(test)]
impl MemorySurface {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            pixels: vec![0; geometry.screen_size()],
        }
    }
}

#[cfg(test)]
impl Surface for MemorySurface {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }
}
