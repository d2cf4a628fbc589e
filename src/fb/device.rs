//! Framebuffer device
//!
//! Opens the display node, queries its geometry and maps the visible screen
//! read-write. The mapping lives as long as the [`Framebuffer`].

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;

use anyhow::{Context, Result};

use super::{Geometry, Surface};

/// Variable screen info (`struct fb_var_screeninfo`)
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FbVarScreenInfo {
    xres: u32,
    yres: u32,
    xres_virtual: u32,
    yres_virtual: u32,
    xoffset: u32,
    yoffset: u32,
    bits_per_pixel: u32,
    grayscale: u32,
    red: FbBitField,
    green: FbBitField,
    blue: FbBitField,
    transp: FbBitField,
    nonstd: u32,
    activate: u32,
    height: u32,
    width: u32,
    accel_flags: u32,
    pixclock: u32,
    left_margin: u32,
    right_margin: u32,
    upper_margin: u32,
    lower_margin: u32,
    hsync_len: u32,
    vsync_len: u32,
    sync: u32,
    vmode: u32,
    rotate: u32,
    colorspace: u32,
    reserved: [u32; 4],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FbBitField {
    offset: u32,
    length: u32,
    msb_right: u32,
}

/// Fixed screen info (`struct fb_fix_screeninfo`)
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct FbFixScreenInfo {
    id: [u8; 16],
    smem_start: libc::c_ulong,
    smem_len: u32,
    fb_type: u32,
    type_aux: u32,
    visual: u32,
    xpanstep: u16,
    ypanstep: u16,
    ywrapstep: u16,
    line_length: u32,
    mmio_start: libc::c_ulong,
    mmio_len: u32,
    accel: u32,
    capabilities: u16,
    reserved: [u16; 2],
}

nix::ioctl_read_bad!(fbioget_vscreeninfo, 0x4600, FbVarScreenInfo);
nix::ioctl_read_bad!(fbioget_fscreeninfo, 0x4602, FbFixScreenInfo);

/// The mapped display
pub struct Framebuffer {
    _file: File,
    mmap: *mut u8,
    mmap_len: usize,
    geometry: Geometry,
}

impl Framebuffer {
    /// Open and map the framebuffer device
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("cannot open framebuffer device ({})", path))?;

        let fd = file.as_raw_fd();

        let mut fix_info = FbFixScreenInfo::default();
        unsafe { fbioget_fscreeninfo(fd, &mut fix_info) }.context("cannot get screen info")?;

        let mut var_info = FbVarScreenInfo::default();
        unsafe { fbioget_vscreeninfo(fd, &mut var_info) }
            .context("cannot get variable screen info")?;

        let geometry = Geometry {
            width: var_info.xres as usize,
            height: var_info.yres as usize,
            bits_per_pixel: var_info.bits_per_pixel as usize,
            line_length: fix_info.line_length as usize,
            xoffset: var_info.xoffset as usize,
            yoffset: var_info.yoffset as usize,
        };
        let mmap_len = geometry.screen_size();
        if mmap_len == 0 {
            anyhow::bail!("framebuffer reports an empty screen ({:?})", geometry);
        }

        log::info!(
            "Framebuffer {}x{} {}bpp stride {}",
            geometry.width,
            geometry.height,
            geometry.bits_per_pixel,
            geometry.line_length
        );

        let mmap = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        if mmap == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error())
                .context("failed to map framebuffer device to memory");
        }

        Ok(Self {
            _file: file,
            mmap: mmap as *mut u8,
            mmap_len,
            geometry,
        })
    }
}

impl Surface for Framebuffer {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn pixels(&self) -> &[u8] {
        // SAFETY: the mapping is mmap_len bytes long and lives until drop
        unsafe { std::slice::from_raw_parts(self.mmap, self.mmap_len) }
    }

    fn pixels_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; &mut self makes this the only live view
        unsafe { std::slice::from_raw_parts_mut(self.mmap, self.mmap_len) }
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mmap as *mut libc::c_void, self.mmap_len);
        }
    }
}
