//! Operating system services used by the chooser
//!
//! Everything that mounts, reboots, execs or otherwise leaves the process
//! goes through [`System`], so the state machine can be driven without a
//! real device.

use std::convert::Infallible;
use std::env;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use nix::mount::{mount, umount, MsFlags};
use nix::sys::reboot::{reboot, RebootMode};
use nix::unistd::{access, AccessFlags};

use crate::config::ChooserConfig;
use crate::entry::BootTarget;

/// Message the bootloader looks for on the misc partition
const RECOVERY_COMMAND: &str = "boot-recovery";

/// Terminal power actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Reboot,
    Halt,
    /// Reboot into the recovery partition
    Recovery,
}

pub trait System {
    /// Mount `source` on `target`. `Ok(false)` means something was already
    /// mounted there and nothing was done.
    fn mount(&mut self, source: &str, target: &str, fstype: &str) -> Result<bool>;
    fn umount(&mut self, target: &str) -> Result<()>;
    /// Whether `path` exists and is readable
    fn exists(&self, path: &str) -> bool;
    /// Whether `path` can be opened read-write
    fn writable(&self, path: &str) -> bool;
    /// Create device nodes for everything the kernel knows about
    fn populate_dev(&mut self);
    fn sleep(&mut self, duration: Duration);
    /// Stage a kernel for [`exec_kernel`](Self::exec_kernel)
    fn load_kernel(&mut self, target: &BootTarget, hardboot: bool) -> Result<()>;
    /// Jump into the staged kernel; only returns on failure
    fn exec_kernel(&mut self) -> Result<Infallible>;
    fn power(&mut self, action: PowerAction) -> Result<Infallible>;
    /// Run an interactive shell and wait for it
    fn run_shell(&mut self) -> Result<()>;
    /// Replace this process with the primary OS init inside `root`
    fn exec_primary(&mut self, root: &str) -> Result<Infallible>;
}

/// The real thing
pub struct LinuxSystem {
    busybox: String,
    kexec: String,
    misc_partition: String,
}

impl LinuxSystem {
    pub fn new(config: &ChooserConfig) -> Self {
        Self {
            busybox: config.paths.busybox.clone(),
            kexec: config.paths.kexec.clone(),
            misc_partition: config.paths.misc_partition.clone(),
        }
    }

    fn write_misc(&self) -> Result<()> {
        let mut misc = File::options()
            .write(true)
            .open(&self.misc_partition)
            .with_context(|| format!("cannot open {}", self.misc_partition))?;
        misc.write_all(RECOVERY_COMMAND.as_bytes())?;
        misc.sync_all()?;
        Ok(())
    }
}

impl System for LinuxSystem {
    fn mount(&mut self, source: &str, target: &str, fstype: &str) -> Result<bool> {
        fs::create_dir_all(target).ok();

        if is_mounted(target) {
            log::debug!("{} already mounted", target);
            return Ok(false);
        }

        let flags = match fstype {
            "sysfs" | "proc" => MsFlags::MS_RELATIME,
            _ => MsFlags::empty(),
        };
        mount(Some(source), target, Some(fstype), flags, None::<&str>)
            .with_context(|| format!("Failed to mount {} on {}", source, target))?;

        log::debug!("Mounted {} on {}", source, target);
        Ok(true)
    }

    fn umount(&mut self, target: &str) -> Result<()> {
        umount(target).with_context(|| format!("Failed to unmount {}", target))?;
        log::debug!("Unmounted {}", target);
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        access(path, AccessFlags::R_OK).is_ok()
    }

    fn writable(&self, path: &str) -> bool {
        access(path, AccessFlags::R_OK | AccessFlags::W_OK).is_ok()
    }

    fn populate_dev(&mut self) {
        match Command::new(&self.busybox).args(["mdev", "-s"]).status() {
            Ok(status) if !status.success() => log::debug!("mdev exited with {}", status),
            Ok(_) => {}
            Err(e) => log::warn!("cannot run mdev: {}", e),
        }
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn load_kernel(&mut self, target: &BootTarget, hardboot: bool) -> Result<()> {
        let mut cmd = Command::new(&self.kexec);
        cmd.arg(if hardboot { "--load-hardboot" } else { "-l" });
        cmd.arg(&target.kernel);
        if let Some(initrd) = &target.initrd {
            cmd.arg(format!("--initrd={}", initrd));
        }
        cmd.arg(format!("--command-line={}", target.cmdline));

        log::debug!("loading kernel: {:?}", cmd);
        let status = cmd
            .status()
            .with_context(|| format!("Failed to run {}", self.kexec))?;
        if !status.success() {
            anyhow::bail!("kexec load of {} failed ({})", target.kernel, status);
        }
        Ok(())
    }

    fn exec_kernel(&mut self) -> Result<Infallible> {
        sync_filesystems();
        let status = Command::new(&self.kexec)
            .arg("-e")
            .status()
            .with_context(|| format!("Failed to run {}", self.kexec))?;
        anyhow::bail!("kexec returned ({})", status)
    }

    fn power(&mut self, action: PowerAction) -> Result<Infallible> {
        let mode = match action {
            PowerAction::Reboot => RebootMode::RB_AUTOBOOT,
            PowerAction::Halt => RebootMode::RB_HALT_SYSTEM,
            PowerAction::Recovery => {
                if let Err(e) = self.write_misc() {
                    log::warn!("cannot request recovery: {:#}", e);
                }
                RebootMode::RB_AUTOBOOT
            }
        };

        log::info!("{:?}...", action);
        sync_filesystems();
        reboot(mode).context("cannot reboot/shutdown")
    }

    fn run_shell(&mut self) -> Result<()> {
        let status = Command::new(&self.busybox)
            .arg("sh")
            .status()
            .with_context(|| format!("Failed to start {} sh", self.busybox))?;
        log::debug!("shell exited with {}", status);
        Ok(())
    }

    fn exec_primary(&mut self, root: &str) -> Result<Infallible> {
        nix::unistd::chdir(root).with_context(|| format!("cannot chdir to {}", root))?;
        nix::unistd::chroot(root).with_context(|| format!("cannot chroot to {}", root))?;

        let mut args = env::args_os();
        let mut init = Command::new("/init");
        if let Some(arg0) = args.next() {
            init.arg0(arg0);
        }
        init.args(args);

        Err(init.exec()).context("cannot exec /init")
    }
}

fn is_mounted(path: &str) -> bool {
    let path = path.trim_end_matches('/');
    if let Ok(file) = File::open("/proc/mounts") {
        let reader = BufReader::new(file);
        for line in reader.lines().map_while(|l| l.ok()) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 && parts[1] == path {
                return true;
            }
        }
    }
    false
}

fn sync_filesystems() {
    log::info!("Syncing filesystems...");
    unsafe {
        libc::sync();
    }
}
