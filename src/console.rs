//! Console ownership and text output
//!
//! All interaction happens on one console device. Reads take `&mut self`, so
//! only one read can own the keyboard at a time, and raw mode is held by a
//! guard that restores the terminal however the read ends.

use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices, Termios};

use crate::config::PathsConfig;
use crate::fb::{Compositor, Framebuffer, Surface};

nix::ioctl_write_int_bad!(tiocsctty, libc::TIOCSCTTY);

/// What the chooser needs from the screen and keyboard
pub trait Terminal {
    /// Make the console our controlling terminal and standard streams
    fn acquire(&mut self) -> Result<()>;

    /// Clear the screen and home the cursor
    fn clear(&mut self) -> Result<()>;

    /// Print one line of text
    fn print(&mut self, line: &str) -> Result<()>;

    /// Replace the current line without advancing
    fn status(&mut self, line: &str) -> Result<()>;

    /// Wait up to `timeout` for a single keystroke
    fn wait_key(&mut self, timeout: Duration) -> Result<Option<u8>>;

    /// Read one line of input, without the trailing newline
    fn read_line(&mut self) -> Result<String>;

    /// Block until the user acknowledges a message
    fn press_enter(&mut self) -> Result<()> {
        self.status("press <ENTER> to continue...")?;
        self.read_line().map(|_| ())
    }
}

/// The physical console with the framebuffer behind it
pub struct Console {
    device: String,
    framebuffer: String,
    background: PathBuf,
    display: Option<Compositor<Framebuffer>>,
    /// Text row the cursor is on
    row: usize,
    /// Rows written since the last clear
    used_rows: usize,
}

impl Console {
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            device: paths.console.clone(),
            framebuffer: paths.framebuffer.clone(),
            background: PathBuf::from(&paths.background),
            display: None,
            row: 0,
            used_rows: 0,
        }
    }

    fn open_display(&mut self) -> Result<()> {
        let fb = Framebuffer::open(&self.framebuffer)?;
        let mut display = Compositor::new(fb);
        display.load_background(&self.background)?;
        if !display.has_background() {
            log::info!("no background, using the plain console");
        }
        self.display = Some(display);
        Ok(())
    }

    /// Put the background back around whatever was drawn on `rows`
    fn refresh_rows(&mut self, first: usize, count: usize) -> Result<()> {
        if let Some(display) = self.display.as_mut() {
            let columns = display.surface().geometry().columns();
            display.refresh_cells(0, first, columns, count)?;
        }
        Ok(())
    }

    fn rows_for(&self, text: &str) -> usize {
        let columns = self
            .display
            .as_ref()
            .map(|d| d.surface().geometry().columns())
            .unwrap_or(80)
            .max(1);
        text.chars().count().max(1).div_ceil(columns)
    }

    fn advance(&mut self, text: &str) -> Result<()> {
        let rows = self.rows_for(text);
        self.refresh_rows(self.row, rows)?;
        self.row += rows;
        self.used_rows = self.used_rows.max(self.row);
        Ok(())
    }
}

fn take_console_control(device: &str) -> Result<()> {
    // fails when we already lead a session, which is fine
    let _ = nix::unistd::setsid();

    let console = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(device)
        .with_context(|| format!("cannot open console {}", device))?;
    let fd = console.as_raw_fd();

    if let Err(e) = unsafe { tiocsctty(fd, 1) } {
        log::debug!("TIOCSCTTY on {} failed: {}", device, e);
    }

    io::stdout().flush().ok();
    for target in 0..=2 {
        if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("cannot attach {} to fd {}", device, target));
        }
    }
    Ok(())
}

/// Wait until `fd` has input or `timeout` has passed, resuming after signals
fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let millis = left
            .as_micros()
            .div_ceil(1000)
            .min(libc::c_int::MAX as u128) as libc::c_int;

        let mut fds = [libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        }];
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), 1, millis) };
        if ready >= 0 {
            return Ok(ready > 0);
        }

        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
        log::debug!("poll interrupted, {:?} left", left);
    }
}

/// Non-canonical, no-echo mode on stdin until dropped
struct RawMode {
    saved: Termios,
}

impl RawMode {
    fn enter() -> Result<Self> {
        let stdin = io::stdin();
        let saved = termios::tcgetattr(&stdin).context("tcgetattr")?;

        let mut raw = saved.clone();
        raw.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw).context("tcsetattr")?;

        Ok(Self { saved })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = termios::tcsetattr(&io::stdin(), SetArg::TCSADRAIN, &self.saved) {
            log::warn!("cannot restore terminal mode: {}", e);
        }
    }
}

impl Terminal for Console {
    fn acquire(&mut self) -> Result<()> {
        take_console_control(&self.device)?;
        if self.display.is_none() {
            self.open_display()?;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        let mut out = io::stdout().lock();
        write!(out, "\x1b[2J\x1b[H")?;
        out.flush()?;
        drop(out);

        // the console blanked those rows to black
        let used = self.used_rows.max(1);
        self.refresh_rows(0, used)?;
        self.row = 0;
        self.used_rows = 0;
        Ok(())
    }

    fn print(&mut self, line: &str) -> Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{}", line)?;
        out.flush()?;
        drop(out);
        self.advance(line)
    }

    fn status(&mut self, line: &str) -> Result<()> {
        let mut out = io::stdout().lock();
        write!(out, "\r\x1b[2K{}", line)?;
        out.flush()?;
        drop(out);
        self.refresh_rows(self.row, 1)?;
        self.used_rows = self.used_rows.max(self.row + 1);
        Ok(())
    }

    fn wait_key(&mut self, timeout: Duration) -> Result<Option<u8>> {
        let _raw = RawMode::enter()?;

        if !wait_readable(libc::STDIN_FILENO, timeout).context("poll on console")? {
            return Ok(None);
        }

        let mut key = 0u8;
        let n = unsafe { libc::read(libc::STDIN_FILENO, &mut key as *mut u8 as *mut libc::c_void, 1) };
        if n < 0 {
            return Err(io::Error::last_os_error()).context("read from console");
        }
        Ok((n == 1).then_some(key))
    }

    fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = io::stdin()
            .lock()
            .read_line(&mut line)
            .context("read from console")?;
        if n == 0 {
            anyhow::bail!("console closed");
        }

        // the echoed input sits on the current row
        let typed = line.trim_end_matches(['\n', '\r']).to_string();
        self.advance(&typed)?;
        Ok(typed)
    }
}
