//! Background compositing
//!
//! Text is drawn by the kernel console on a black canvas. Pure black
//! (`[0, 0, 0, 0]`) is therefore the transparency key: after a region has
//! been drawn, every black pixel in it is replaced with the background
//! snapshot, everything else is left as drawn.

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

use super::bitmap::{self, Bitmap};
use super::{Geometry, Surface, CHAR_HEIGHT, CHAR_WIDTH};

/// Pixel value treated as transparent
const BLACK_PIXEL: [u8; 4] = [0, 0, 0, 0];

/// Bytes per framebuffer pixel the background can be composited onto
const PIXEL_BYTES: usize = BLACK_PIXEL.len();

#[derive(Debug, Error)]
pub enum CompositorError {
    #[error("cannot allocate {0} bytes for the background snapshot")]
    SnapshotAlloc(usize),
    #[error("cannot allocate {0} bytes for a redraw")]
    ScratchAlloc(usize),
}

fn alloc(len: usize) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).ok()?;
    buf.resize(len, 0);
    Some(buf)
}

/// Owns the display surface and the decoded background
pub struct Compositor<S> {
    surface: S,
    snapshot: Option<Vec<u8>>,
}

impl<S: Surface> Compositor<S> {
    pub fn new(surface: S) -> Self {
        Self {
            surface,
            snapshot: None,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn has_background(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Load the bitmap at `path` and paint it as the background.
    ///
    /// A missing or unusable image only leaves the screen without a
    /// background; allocation failures are returned.
    pub fn load_background(&mut self, path: &Path) -> Result<(), CompositorError> {
        // read it once
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!("cannot open \"{}\" - no background", path.display());
                return Ok(());
            }
            Err(e) => {
                log::warn!("cannot read \"{}\" - {}", path.display(), e);
                return Ok(());
            }
        };

        match bitmap::decode(&data) {
            Ok(bmp) => self.set_background(&bmp),
            Err(e) => {
                log::warn!("{}: {}", path.display(), e);
                self.snapshot = None;
                Ok(())
            }
        }
    }

    /// Decode `bmp` into the snapshot and copy it to the screen
    pub fn set_background(&mut self, bmp: &Bitmap<'_>) -> Result<(), CompositorError> {
        let geometry = self.surface.geometry();
        if geometry.bytes_per_pixel() != PIXEL_BYTES {
            log::warn!(
                "background needs a 32bpp framebuffer, have {}bpp",
                geometry.bits_per_pixel
            );
            self.snapshot = None;
            return Ok(());
        }

        let len = self.surface.pixels().len();
        let mut snapshot = alloc(len).ok_or(CompositorError::SnapshotAlloc(len))?;

        let rows = bmp.header.height.min(geometry.height);
        let cols = bmp.header.width.min(geometry.width);
        for y in 0..rows {
            let start = geometry.offset(0, y);
            let Some(dest) = snapshot.get_mut(start..) else {
                break;
            };
            for (px, out) in bmp
                .pixels(y)
                .take(cols)
                .zip(dest.chunks_exact_mut(PIXEL_BYTES))
            {
                out.copy_from_slice(&[px.r, px.g, px.b, 0]);
            }
        }

        // the only full screen write
        self.surface.pixels_mut().copy_from_slice(&snapshot);
        self.snapshot = Some(snapshot);
        Ok(())
    }

    /// Restore the background under every black pixel of a rectangle.
    ///
    /// The rectangle is in pixels and is clipped to the visible screen.
    pub fn refresh(
        &mut self,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    ) -> Result<(), CompositorError> {
        let Some(snapshot) = self.snapshot.as_ref() else {
            return Ok(());
        };
        let geometry = self.surface.geometry();
        let Some((offset, width, height)) = clip(&geometry, x, y, width, height) else {
            return Ok(());
        };

        let span = (height - 1) * geometry.line_length + width * PIXEL_BYTES;
        let screen = self.surface.pixels_mut();
        let end = offset + span;
        if end > screen.len() || end > snapshot.len() {
            return Ok(());
        }

        // save our affected area
        let mut scratch = Vec::new();
        scratch
            .try_reserve_exact(span)
            .map_err(|_| CompositorError::ScratchAlloc(span))?;
        scratch.extend_from_slice(&screen[offset..end]);

        let background = &snapshot[offset..end];
        for row in 0..height {
            let start = row * geometry.line_length;
            let line = start..start + width * PIXEL_BYTES;
            for (px, bg) in scratch[line.clone()]
                .chunks_exact_mut(PIXEL_BYTES)
                .zip(background[line].chunks_exact(PIXEL_BYTES))
            {
                if *px == BLACK_PIXEL {
                    px.copy_from_slice(bg);
                }
            }
        }

        // write once
        screen[offset..end].copy_from_slice(&scratch);
        Ok(())
    }

    /// [`refresh`](Self::refresh) in text cells instead of pixels
    pub fn refresh_cells(
        &mut self,
        col: usize,
        row: usize,
        width: usize,
        height: usize,
    ) -> Result<(), CompositorError> {
        self.refresh(
            col * CHAR_WIDTH,
            row * CHAR_HEIGHT,
            width * CHAR_WIDTH,
            height * CHAR_HEIGHT,
        )
    }
}

/// Clip a pixel rectangle to the screen, returning its byte offset and size
fn clip(
    geometry: &Geometry,
    x: usize,
    y: usize,
    width: usize,
    height: usize,
) -> Option<(usize, usize, usize)> {
    if x >= geometry.width || y >= geometry.height {
        return None;
    }
    let width = width.min(geometry.width - x);
    let height = height.min(geometry.height - y);
    if width == 0 || height == 0 {
        return None;
    }
    Some((geometry.offset(x, y), width, height))
}
