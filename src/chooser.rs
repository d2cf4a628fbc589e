//! Boot menu state machine
//!
//! ```text
//! MountingSystem -> AcquireConsole -> Discover -> Countdown -> Dispatch
//!                                                    |           ^  |
//!                                                    +-> Menu ---+  +-> Fallback
//! ```
//!
//! Any failure while the fatal flag is set ends in [`State::Fallback`], which
//! boots the primary OS. Everything else is reported on the console and the
//! menu is shown again.

use std::convert::Infallible;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};

use crate::cmdline::CmdlineBuilder;
use crate::config::ChooserConfig;
use crate::console::Terminal;
use crate::entry::{BootEntry, BootTarget, EntryList, Parser};
use crate::system::{PowerAction, System};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const SYSFS: &str = "/sys";
const PROCFS: &str = "/proc";

/// What the user (or the countdown) asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Boot the primary OS
    Primary,
    Default,
    Reboot,
    Halt,
    Recovery,
    Shell,
    /// Menu number of a discovered entry
    Entry(usize),
    Invalid,
}

impl Selection {
    /// Map a shortcut key, `None` if `key` is not one
    pub fn from_shortcut(key: u8, shell: bool) -> Option<Self> {
        match key.to_ascii_lowercase() {
            b'a' => Some(Selection::Primary),
            b'd' => Some(Selection::Default),
            b'r' => Some(Selection::Reboot),
            b'h' => Some(Selection::Halt),
            b'c' => Some(Selection::Recovery),
            b's' if shell => Some(Selection::Shell),
            _ => None,
        }
    }

    /// Map a typed menu line: a shortcut letter or an entry number
    pub fn from_input(line: &str, shell: bool) -> Self {
        let line = line.trim_start();
        if let Some(sel) = line
            .bytes()
            .next()
            .and_then(|key| Self::from_shortcut(key, shell))
        {
            return sel;
        }

        let end = line
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(line.len());
        match line[..end].parse::<usize>() {
            Ok(id) if id > 0 => Selection::Entry(id),
            _ => Selection::Invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    MountingSystem,
    AcquireConsole,
    Discover,
    Countdown,
    Menu,
    Dispatch(Selection),
    Fallback,
}

#[derive(Debug, Default)]
struct Context {
    /// Errors can no longer return to the menu
    fatal: bool,
    /// The console is ours and can show messages
    console: bool,
}

pub struct Chooser<S, T> {
    config: ChooserConfig,
    system: S,
    term: T,
    ctx: Context,
    entries: EntryList,
    default_entry: Option<BootEntry>,
    /// Mount points we own, in mount order
    mounts: Vec<String>,
}

impl<S: System, T: Terminal> Chooser<S, T> {
    pub fn new(config: ChooserConfig, system: S, term: T) -> Self {
        Self {
            config,
            system,
            term,
            ctx: Context::default(),
            entries: EntryList::default(),
            default_entry: None,
            mounts: Vec::new(),
        }
    }

    /// Drive the menu until a kernel or the primary OS takes over.
    ///
    /// Only returns if the primary OS could not be started either.
    pub fn run(&mut self) -> Result<Infallible> {
        let mut state = State::MountingSystem;
        loop {
            log::debug!("state: {:?}", state);
            let step = match state {
                State::MountingSystem => self.mount_system(),
                State::AcquireConsole => self.acquire_console(),
                State::Discover => self.discover(),
                State::Countdown => self.countdown(),
                State::Menu => self.menu(),
                State::Dispatch(selection) => self.dispatch(selection),
                State::Fallback => return self.fallback(),
            };

            state = match step {
                Ok(next) => next,
                Err(e) => self.fatal(e),
            };
        }
    }

    fn mount_system(&mut self) -> Result<State> {
        // nothing to show errors on yet
        self.ctx.fatal = true;
        self.mount("sysfs", SYSFS, "sysfs")?;
        Ok(State::AcquireConsole)
    }

    fn acquire_console(&mut self) -> Result<State> {
        let console = self.config.paths.console.clone();
        if !self.wait_for_node(&console, true) {
            anyhow::bail!("console {} did not appear", console);
        }

        self.term.acquire()?;
        self.ctx.console = true;

        self.umount(SYSFS);
        self.ctx.fatal = false;
        Ok(State::Discover)
    }

    fn discover(&mut self) -> Result<State> {
        let paths = self.config.paths.clone();

        self.print_header()?;

        self.ctx.fatal = true;
        self.mount("proc", PROCFS, "proc").context("cannot mount proc")?;
        self.term.print(&format!("mounting {}", paths.data_mount))?;
        self.mount(&paths.data_device, &paths.data_mount, &paths.data_fstype)?;
        let cmdline = CmdlineBuilder::from_file(&paths.proc_cmdline)?;
        self.ctx.fatal = false;

        self.config.apply_cmdline_overrides(cmdline.live());

        let parser = Parser::new(&paths.new_root, &cmdline);
        match parser.parse_default(Path::new(&paths.default_entry)) {
            Ok(Some(entry)) => self.default_entry = Some(entry),
            Ok(None) => log::info!("no default config found"),
            Err(e) => {
                self.term.print(&format!("ERROR: {}", e))?;
                self.term.press_enter()?;
            }
        }

        let term = &mut self.term;
        let entries = parser.scan_dir(Path::new(&paths.entries_dir), |_, err| {
            term.print(&format!("ERROR: {}", err))?;
            term.press_enter()
        });
        match entries {
            Ok(entries) => self.entries = entries,
            Err(e) => {
                self.ctx.fatal = true;
                return Err(e);
            }
        }
        log::info!("found {} boot entries", self.entries.len());

        self.umount(&paths.data_mount);
        Ok(State::Countdown)
    }

    fn countdown(&mut self) -> Result<State> {
        self.term.clear()?;

        let shell = self.config.boot.shell;
        for remaining in (1..=self.config.boot.timeout).rev() {
            self.term
                .status(&format!("Automatic boot in {:2} seconds...", remaining))?;
            if let Some(key) = self.term.wait_key(Duration::from_secs(1))? {
                self.term.status("")?;
                return Ok(match Selection::from_shortcut(key, shell) {
                    Some(selection) => State::Dispatch(selection),
                    None => State::Menu,
                });
            }
        }
        self.term.status("")?;

        if self.default_entry.is_some() {
            Ok(State::Dispatch(Selection::Default))
        } else {
            log::info!("no default entry, booting the primary OS");
            Ok(State::Dispatch(Selection::Primary))
        }
    }

    fn menu(&mut self) -> Result<State> {
        self.print_menu()?;
        self.term.status("enter a number and press <ENTER>: ")?;
        let line = self.term.read_line()?;

        let selection = Selection::from_input(&line, self.config.boot.shell);
        log::debug!("user chose {:?}", selection);
        Ok(State::Dispatch(selection))
    }

    fn dispatch(&mut self, selection: Selection) -> Result<State> {
        match selection {
            Selection::Primary => {
                log::info!("booting the primary OS");
                self.ctx.fatal = true;
                Ok(State::Fallback)
            }
            Selection::Default => match self.default_entry.clone() {
                Some(entry) => self.boot(entry),
                None => self.soft_error(anyhow!("invalid choice")),
            },
            Selection::Reboot => self.power(PowerAction::Reboot),
            Selection::Halt => self.power(PowerAction::Halt),
            Selection::Recovery => self.power(PowerAction::Recovery),
            Selection::Shell => {
                self.term.clear()?;
                if let Err(e) = self.system.run_shell() {
                    return self.soft_error(e);
                }
                self.term.acquire()?;
                Ok(State::Menu)
            }
            Selection::Entry(id) => match self.entries.get(id).cloned() {
                Some(entry) => self.boot(entry),
                None => self.soft_error(anyhow!("invalid choice")),
            },
            Selection::Invalid => self.soft_error(anyhow!("invalid choice")),
        }
    }

    fn boot(&mut self, entry: BootEntry) -> Result<State> {
        let new_root = self.config.paths.new_root.clone();
        let fstype = self.config.boot.rootfs_type.clone();

        if !self.wait_for_device(&entry.block_device)? {
            return self.soft_error(anyhow!("device \"{}\" not found", entry.block_device));
        }

        match self.mount(&entry.block_device, &new_root, &fstype) {
            Ok(true) => {}
            // whatever sits there is not the device we were asked to boot
            Ok(false) => {
                return self.soft_error(anyhow!(
                    "unable to mount \"{}\" on {}: already in use",
                    entry.block_device,
                    new_root
                ))
            }
            Err(e) => {
                return self.soft_error(e.context(format!(
                    "unable to mount \"{}\" on {}",
                    entry.block_device, new_root
                )))
            }
        }

        let name = entry.name.clone();
        let target = BootTarget::from(entry);
        if let Err(e) = self.system.load_kernel(&target, self.config.boot.hardboot) {
            self.umount(&new_root);
            return self.soft_error(e.context("unable to load guest kernel"));
        }

        log::debug!("mounted \"{}\" on \"{}\"", target.block_device, new_root);
        self.term.print(&format!("booting \"{}\"", name))?;

        // nothing to go back to from here
        self.release_entries();
        self.ctx.fatal = true;

        match self.system.exec_kernel() {
            Ok(never) => match never {},
            Err(e) => Err(e.context("failed to kexec")),
        }
    }

    fn power(&mut self, action: PowerAction) -> Result<State> {
        self.release_mounts();
        self.ctx.fatal = true;
        match self.system.power(action) {
            Ok(never) => match never {},
            Err(e) => Err(e),
        }
    }

    fn fallback(&mut self) -> Result<Infallible> {
        self.release_entries();
        self.release_mounts();

        let root = self.config.paths.primary_root.clone();
        log::info!("starting the primary OS from {}", root);
        let e = match self.system.exec_primary(&root) {
            Ok(never) => match never {},
            Err(e) => e,
        };

        log::error!("{:#}", e);
        if self.ctx.console {
            let shown = self
                .term
                .print(&format!("FATAL: {:#}", e))
                .and_then(|_| self.term.press_enter());
            if let Err(err) = shown {
                log::debug!("cannot report on console: {:#}", err);
            }
        }
        Err(e)
    }

    /// Report a fatal error and head for the fallback
    fn fatal(&mut self, err: anyhow::Error) -> State {
        self.ctx.fatal = true;
        log::error!("{:#}", err);

        if self.ctx.console {
            let shown = self
                .term
                .print(&format!("FATAL: {:#}", err))
                .and_then(|_| self.term.press_enter());
            if let Err(e) = shown {
                log::debug!("cannot report on console: {:#}", e);
            }
        }
        State::Fallback
    }

    /// Show an error, wait for the user and go back to the menu
    fn soft_error(&mut self, err: anyhow::Error) -> Result<State> {
        log::debug!("{:#}", err);
        self.term.print(&format!("ERROR: {:#}", err))?;
        self.term.press_enter()?;

        Ok(if self.ctx.fatal {
            State::Fallback
        } else {
            State::Menu
        })
    }

    /// Mount and take ownership; `Ok(false)` if `target` was already taken
    fn mount(&mut self, source: &str, target: &str, fstype: &str) -> Result<bool> {
        let mounted = self.system.mount(source, target, fstype)?;
        if mounted {
            self.mounts.push(target.to_string());
        } else {
            log::debug!("{} was already mounted, leaving it alone", target);
        }
        Ok(mounted)
    }

    /// Unmount `target` if we mounted it
    fn umount(&mut self, target: &str) {
        let Some(pos) = self.mounts.iter().rposition(|m| m == target) else {
            return;
        };
        if let Err(e) = self.system.umount(target) {
            log::warn!("{:#}", e);
            return;
        }
        self.mounts.remove(pos);
    }

    fn release_mounts(&mut self) {
        while let Some(target) = self.mounts.pop() {
            if let Err(e) = self.system.umount(&target) {
                log::warn!("{:#}", e);
            }
        }
    }

    fn release_entries(&mut self) {
        self.entries = EntryList::default();
        self.default_entry = None;
    }

    /// Poll for a device node, repopulating /dev once a second.
    ///
    /// With `write` the node must also be writable.
    fn wait_for_node(&mut self, path: &str, write: bool) -> bool {
        let ready = |system: &S| {
            if write {
                system.writable(path)
            } else {
                system.exists(path)
            }
        };

        self.system.populate_dev();
        for _ in 0..self.config.boot.device_timeout {
            if ready(&self.system) {
                return true;
            }
            self.system.sleep(Duration::from_secs(1));
            self.system.populate_dev();
        }
        ready(&self.system)
    }

    fn wait_for_device(&mut self, device: &str) -> Result<bool> {
        if self.system.exists(device) {
            return Ok(true);
        }

        log::debug!("block device \"{}\" not found", device);
        // mdev needs sysfs
        if let Err(e) = self.mount("sysfs", SYSFS, "sysfs") {
            log::warn!("{:#}", e);
            return Ok(false);
        }
        self.term.print("waiting for device...")?;
        let found = self.wait_for_node(device, false);
        self.umount(SYSFS);
        Ok(found)
    }

    fn print_header(&mut self) -> Result<()> {
        self.term.print("")?;
        self.term.print("  +-------------------------------+")?;
        self.term.print("  |   R O O T   C H O O S E R     |")?;
        self.term.print("  +-------------------------------+")?;
        self.term.print(&format!("              v{}", VERSION))?;
        self.term.print("")
    }

    fn print_menu(&mut self) -> Result<()> {
        self.term.clear()?;
        self.print_header()?;

        self.term.print("  Select a system to boot:")?;
        self.term.print("")?;
        if self.entries.is_empty() {
            self.term.print("  (no entries found)")?;
        }
        let lines: Vec<String> = self
            .entries
            .iter()
            .map(|(id, entry)| format!("  {}) {}", id, entry.name))
            .collect();
        for line in &lines {
            self.term.print(line)?;
        }

        let default = match &self.default_entry {
            Some(entry) => format!("  d) default ({})", entry.name),
            None => "  d) default (none)".to_string(),
        };
        self.term.print("")?;
        self.term.print("  -----------------------------------")?;
        self.term.print("  a) primary OS")?;
        self.term.print(&default)?;
        self.term.print("  r) reboot    h) halt    c) recovery")?;
        if self.config.boot.shell {
            self.term.print("  s) shell")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::fs;

    use tempfile::TempDir;

    #[derive(Default)]
    struct MockSystem {
        calls: Vec<String>,
        /// Paths `exists` reports as absent
        missing: Vec<String>,
        /// Paths that exist but cannot be written
        read_only: Vec<String>,
        /// Mount targets that fail
        fail_mount: Vec<String>,
        /// Unmount targets that fail
        fail_umount: Vec<String>,
        /// Targets currently mounted, by us or anyone else
        mounted: Vec<String>,
        fail_load: bool,
        loaded: Option<BootTarget>,
    }

    impl System for MockSystem {
        fn mount(&mut self, source: &str, target: &str, fstype: &str) -> Result<bool> {
            self.calls
                .push(format!("mount {} {} {}", source, target, fstype));
            if self.fail_mount.iter().any(|t| t == target) {
                anyhow::bail!("mount of {} failed", target);
            }
            if self.mounted.iter().any(|t| t == target) {
                return Ok(false);
            }
            self.mounted.push(target.to_string());
            Ok(true)
        }

        fn umount(&mut self, target: &str) -> Result<()> {
            self.calls.push(format!("umount {}", target));
            if self.fail_umount.iter().any(|t| t == target) {
                anyhow::bail!("{} is busy", target);
            }
            self.mounted.retain(|t| t != target);
            Ok(())
        }

        fn exists(&self, path: &str) -> bool {
            !self.missing.iter().any(|p| p == path)
        }

        fn writable(&self, path: &str) -> bool {
            self.exists(path) && !self.read_only.iter().any(|p| p == path)
        }

        fn populate_dev(&mut self) {
            self.calls.push("mdev".to_string());
        }

        fn sleep(&mut self, _duration: Duration) {
            self.calls.push("sleep".to_string());
        }

        fn load_kernel(&mut self, target: &BootTarget, _hardboot: bool) -> Result<()> {
            self.calls.push(format!("load {}", target.kernel));
            if self.fail_load {
                anyhow::bail!("kexec load failed");
            }
            self.loaded = Some(target.clone());
            Ok(())
        }

        fn exec_kernel(&mut self) -> Result<Infallible> {
            self.calls.push("exec_kernel".to_string());
            anyhow::bail!("kexec returned")
        }

        fn power(&mut self, action: PowerAction) -> Result<Infallible> {
            self.calls.push(format!("power {:?}", action));
            anyhow::bail!("still running")
        }

        fn run_shell(&mut self) -> Result<()> {
            self.calls.push("shell".to_string());
            Ok(())
        }

        fn exec_primary(&mut self, root: &str) -> Result<Infallible> {
            self.calls.push(format!("exec_primary {}", root));
            anyhow::bail!("no /init")
        }
    }

    #[derive(Default)]
    struct MockTerminal {
        /// Results of successive `wait_key` calls; `None` once drained
        keys: VecDeque<u8>,
        /// Typed lines; reading past the end fails like a closed console
        lines: VecDeque<String>,
        output: Vec<String>,
        statuses: Vec<String>,
        acquired: usize,
    }

    impl MockTerminal {
        fn with_input(keys: &[u8], lines: &[&str]) -> Self {
            Self {
                keys: keys.iter().copied().collect(),
                lines: lines.iter().map(|l| l.to_string()).collect(),
                ..Default::default()
            }
        }

        fn printed(&self, text: &str) -> bool {
            self.output.iter().any(|l| l.contains(text))
        }
    }

    impl Terminal for MockTerminal {
        fn acquire(&mut self) -> Result<()> {
            self.acquired += 1;
            Ok(())
        }

        fn clear(&mut self) -> Result<()> {
            Ok(())
        }

        fn print(&mut self, line: &str) -> Result<()> {
            self.output.push(line.to_string());
            Ok(())
        }

        fn status(&mut self, line: &str) -> Result<()> {
            self.statuses.push(line.to_string());
            Ok(())
        }

        fn wait_key(&mut self, _timeout: Duration) -> Result<Option<u8>> {
            Ok(self.keys.pop_front())
        }

        fn read_line(&mut self) -> Result<String> {
            self.lines
                .pop_front()
                .ok_or_else(|| anyhow!("console closed"))
        }
    }

    const ARCH: &str = "Arch\n/dev/sda1:/boot/vmlinuz:/boot/initramfs.img\n+rw\n";
    const UBUNTU: &str = "Ubuntu\n/dev/sda2:/vmlinuz\n";

    /// Config pointing at descriptors and a command line inside a tempdir
    fn setup(default: Option<&str>, entries: &[(&str, &str)]) -> (TempDir, ChooserConfig) {
        let dir = tempfile::tempdir().unwrap();
        let entries_dir = dir.path().join("root.d");
        fs::create_dir(&entries_dir).unwrap();
        for (name, body) in entries {
            fs::write(entries_dir.join(name), body).unwrap();
        }
        let default_path = dir.path().join("root.default");
        if let Some(body) = default {
            fs::write(&default_path, body).unwrap();
        }
        let cmdline = dir.path().join("cmdline");
        fs::write(&cmdline, "console=tty0 quiet\n").unwrap();

        let mut config = ChooserConfig::default();
        config.paths.entries_dir = entries_dir.display().to_string();
        config.paths.default_entry = default_path.display().to_string();
        config.paths.proc_cmdline = cmdline.display().to_string();
        config.boot.timeout = 3;
        config.boot.device_timeout = 2;
        (dir, config)
    }

    fn run(
        config: ChooserConfig,
        system: MockSystem,
        term: MockTerminal,
    ) -> Chooser<MockSystem, MockTerminal> {
        let mut chooser = Chooser::new(config, system, term);
        assert!(chooser.run().is_err());
        chooser
    }

    fn count(calls: &[String], call: &str) -> usize {
        calls.iter().filter(|c| *c == call).count()
    }

    #[test]
    fn timeout_boots_the_default_entry() {
        let (_dir, config) = setup(Some(ARCH), &[("ubuntu", UBUNTU)]);
        let chooser = run(config, MockSystem::default(), MockTerminal::default());

        assert_eq!(
            chooser.system.calls,
            vec![
                "mount sysfs /sys sysfs",
                "mdev",
                "umount /sys",
                "mount proc /proc proc",
                "mount /dev/block/mmcblk0p8 /data ext4",
                "umount /data",
                "mount /dev/sda1 /newroot/ ext4",
                "load /newroot/boot/vmlinuz",
                "exec_kernel",
                "umount /newroot/",
                "umount /proc",
                "exec_primary /newroot/",
            ]
        );
        assert_eq!(
            chooser.system.loaded,
            Some(BootTarget {
                block_device: "/dev/sda1".to_string(),
                kernel: "/newroot/boot/vmlinuz".to_string(),
                initrd: Some("/newroot/boot/initramfs.img".to_string()),
                cmdline: "console=tty0 quiet rw".to_string(),
            })
        );
        assert!(chooser.term.printed("booting \"Arch\""));
        assert!(chooser.term.printed("failed to kexec"));
    }

    #[test]
    fn countdown_counts_down_to_one() {
        let (_dir, config) = setup(Some(ARCH), &[]);
        let chooser = run(config, MockSystem::default(), MockTerminal::default());

        let countdown: Vec<&str> = chooser
            .term
            .statuses
            .iter()
            .filter(|s| s.starts_with("Automatic"))
            .map(|s| s.as_str())
            .collect();
        assert_eq!(
            countdown,
            vec![
                "Automatic boot in  3 seconds...",
                "Automatic boot in  2 seconds...",
                "Automatic boot in  1 seconds...",
            ]
        );
    }

    #[test]
    fn timeout_without_default_boots_primary() {
        let (_dir, config) = setup(None, &[("arch", ARCH)]);
        let chooser = run(config, MockSystem::default(), MockTerminal::default());

        let calls = &chooser.system.calls;
        assert!(!calls.iter().any(|c| c.starts_with("load")));
        assert_eq!(
            &calls[calls.len() - 2..],
            ["umount /proc", "exec_primary /newroot/"]
        );
    }

    #[test]
    fn default_choice_without_default_reprompts() {
        let (_dir, config) = setup(None, &[("arch", ARCH)]);
        let term = MockTerminal::with_input(b"x", &["d", "", "a"]);
        let chooser = run(config, MockSystem::default(), term);

        assert!(chooser.term.printed("ERROR: invalid choice"));
        let prompts = chooser
            .term
            .statuses
            .iter()
            .filter(|s| s.starts_with("enter a number"))
            .count();
        assert_eq!(prompts, 2);
        assert_eq!(count(&chooser.system.calls, "exec_primary /newroot/"), 1);
        assert!(chooser.system.loaded.is_none());
    }

    #[test]
    fn data_mount_failure_goes_straight_to_fallback() {
        let (_dir, config) = setup(Some(ARCH), &[("arch", ARCH)]);
        let system = MockSystem {
            fail_mount: vec!["/data".to_string()],
            ..Default::default()
        };
        let chooser = run(config, system, MockTerminal::default());

        let calls = &chooser.system.calls;
        assert_eq!(count(calls, "exec_primary /newroot/"), 1);
        assert!(chooser.system.loaded.is_none());
        assert_eq!(
            &calls[calls.len() - 2..],
            ["umount /proc", "exec_primary /newroot/"]
        );
        assert!(chooser.term.printed("FATAL"));
        assert!(chooser.term.statuses.iter().all(|s| !s.starts_with("Automatic")));
    }

    #[test]
    fn missing_console_falls_back_without_prompting() {
        let (_dir, config) = setup(Some(ARCH), &[]);
        let system = MockSystem {
            missing: vec!["/dev/tty0".to_string()],
            ..Default::default()
        };
        let chooser = run(config, system, MockTerminal::default());

        assert_eq!(
            chooser.system.calls,
            vec![
                "mount sysfs /sys sysfs",
                "mdev",
                "sleep",
                "mdev",
                "sleep",
                "mdev",
                "umount /sys",
                "exec_primary /newroot/",
            ]
        );
        assert_eq!(chooser.term.acquired, 0);
        assert!(chooser.term.output.is_empty());
    }

    #[test]
    fn reboot_shortcut_unmounts_first() {
        let (_dir, config) = setup(Some(ARCH), &[]);
        let term = MockTerminal::with_input(b"R", &[]);
        let chooser = run(config, MockSystem::default(), term);

        let calls = &chooser.system.calls;
        let proc_at = calls.iter().position(|c| c == "umount /proc").unwrap();
        let reboot_at = calls.iter().position(|c| c == "power Reboot").unwrap();
        assert!(proc_at < reboot_at);
        assert!(chooser.system.loaded.is_none());
        assert_eq!(calls.last().map(String::as_str), Some("exec_primary /newroot/"));
    }

    #[test]
    fn menu_boots_the_picked_entry() {
        let (_dir, config) = setup(Some(ARCH), &[("a-arch", ARCH), ("b-ubuntu", UBUNTU)]);
        let term = MockTerminal::with_input(b"\n", &[" 2"]);
        let chooser = run(config, MockSystem::default(), term);

        assert!(chooser.term.printed("  1) Arch"));
        assert!(chooser.term.printed("  2) Ubuntu"));
        assert!(chooser.term.printed("  d) default (Arch)"));
        assert_eq!(
            chooser.system.loaded,
            Some(BootTarget {
                block_device: "/dev/sda2".to_string(),
                kernel: "/newroot/vmlinuz".to_string(),
                initrd: None,
                cmdline: "console=tty0 quiet".to_string(),
            })
        );
    }

    #[test]
    fn missing_block_device_returns_to_menu() {
        let (_dir, config) = setup(None, &[("arch", ARCH)]);
        let system = MockSystem {
            missing: vec!["/dev/sda1".to_string()],
            ..Default::default()
        };
        let term = MockTerminal::with_input(b" ", &["1", "", "a"]);
        let chooser = run(config, system, term);

        let calls = &chooser.system.calls;
        assert!(chooser.term.printed("waiting for device..."));
        assert!(chooser.term.printed("device \"/dev/sda1\" not found"));
        assert!(!calls.iter().any(|c| c.starts_with("mount /dev/sda1")));
        assert!(!calls.iter().any(|c| c.starts_with("load")));
        // sysfs is mounted for the wait and released afterwards
        assert_eq!(count(calls, "mount sysfs /sys sysfs"), 2);
        assert_eq!(count(calls, "umount /sys"), 2);
        assert_eq!(count(calls, "exec_primary /newroot/"), 1);
    }

    #[test]
    fn load_failure_unmounts_new_root() {
        let (_dir, config) = setup(None, &[("arch", ARCH)]);
        let system = MockSystem {
            fail_load: true,
            ..Default::default()
        };
        let term = MockTerminal::with_input(b" ", &["1", "", "a"]);
        let chooser = run(config, system, term);

        let calls = &chooser.system.calls;
        let load_at = calls
            .iter()
            .position(|c| c == "load /newroot/boot/vmlinuz")
            .unwrap();
        assert_eq!(calls[load_at + 1], "umount /newroot/");
        assert_eq!(count(calls, "umount /newroot/"), 1);
        assert!(!calls.contains(&"exec_kernel".to_string()));
        assert!(chooser.term.printed("unable to load guest kernel"));
        assert_eq!(calls.last().map(String::as_str), Some("exec_primary /newroot/"));
    }

    #[test]
    fn shell_returns_to_the_menu() {
        let (_dir, config) = setup(None, &[("arch", ARCH)]);
        let term = MockTerminal::with_input(b"s", &["a"]);
        let chooser = run(config, MockSystem::default(), term);

        assert_eq!(count(&chooser.system.calls, "shell"), 1);
        assert_eq!(chooser.term.acquired, 2);
        assert_eq!(count(&chooser.system.calls, "exec_primary /newroot/"), 1);
    }

    #[test]
    fn disabled_shell_is_an_invalid_choice() {
        let (_dir, mut config) = setup(None, &[("arch", ARCH)]);
        config.boot.shell = false;
        let term = MockTerminal::with_input(b"s", &["s", "", "a"]);
        let chooser = run(config, MockSystem::default(), term);

        assert_eq!(count(&chooser.system.calls, "shell"), 0);
        assert!(chooser.term.printed("ERROR: invalid choice"));
        assert!(!chooser.term.printed("  s) shell"));
    }

    #[test]
    fn malformed_descriptor_is_acknowledged_and_skipped() {
        let (_dir, config) = setup(None, &[("a-broken", "Broken\n:/vmlinuz\n"), ("b-ubuntu", UBUNTU)]);
        let term = MockTerminal::with_input(b"x", &["", "1"]);
        let chooser = run(config, MockSystem::default(), term);

        assert!(chooser.term.printed("ERROR: missing block device"));
        assert!(chooser.term.printed("  1) Ubuntu"));
        assert_eq!(
            chooser.system.loaded.map(|t| t.block_device),
            Some("/dev/sda2".to_string())
        );
    }

    #[test]
    fn kernel_command_line_overrides_apply() {
        let (dir, mut config) = setup(Some(ARCH), &[]);
        let cmdline = dir.path().join("cmdline");
        fs::write(&cmdline, "console=tty0 chooser.timeout=0\n").unwrap();
        config.paths.proc_cmdline = cmdline.display().to_string();

        let chooser = run(config, MockSystem::default(), MockTerminal::default());

        assert!(chooser.term.statuses.iter().all(|s| !s.starts_with("Automatic")));
        assert_eq!(
            chooser.system.loaded.map(|t| t.cmdline),
            Some("console=tty0 chooser.timeout=0 rw".to_string())
        );
    }

    #[test]
    fn busy_new_root_is_never_booted() {
        let (_dir, config) = setup(None, &[("a-arch", ARCH), ("b-ubuntu", UBUNTU)]);
        let system = MockSystem {
            fail_load: true,
            fail_umount: vec!["/newroot/".to_string()],
            ..Default::default()
        };
        let term = MockTerminal::with_input(b" ", &["1", "", "2", "", "a"]);
        let chooser = run(config, system, term);

        let calls = &chooser.system.calls;
        // Arch stays mounted, so Ubuntu must not be loaded from it
        assert_eq!(calls.iter().filter(|c| c.starts_with("load")).count(), 1);
        assert!(chooser.term.printed("already in use"));
        assert!(chooser.system.loaded.is_none());
        assert_eq!(count(calls, "exec_primary /newroot/"), 1);
    }

    #[test]
    fn foreign_mounts_are_left_alone() {
        let (_dir, config) = setup(None, &[("arch", ARCH)]);
        let system = MockSystem {
            mounted: vec!["/sys".to_string(), "/proc".to_string()],
            ..Default::default()
        };
        let chooser = run(config, system, MockTerminal::default());

        let calls = &chooser.system.calls;
        assert_eq!(count(calls, "umount /sys"), 0);
        assert_eq!(count(calls, "umount /proc"), 0);
        assert_eq!(count(calls, "umount /data"), 1);
        assert_eq!(calls.last().map(String::as_str), Some("exec_primary /newroot/"));
    }

    #[test]
    fn unreadable_cmdline_falls_back() {
        let (dir, mut config) = setup(Some(ARCH), &[("arch", ARCH)]);
        config.paths.proc_cmdline = dir.path().join("nope").display().to_string();
        let chooser = run(config, MockSystem::default(), MockTerminal::default());

        let calls = &chooser.system.calls;
        assert_eq!(count(calls, "exec_primary /newroot/"), 1);
        assert!(chooser.system.loaded.is_none());
        assert_eq!(
            &calls[calls.len() - 3..],
            ["umount /data", "umount /proc", "exec_primary /newroot/"]
        );
        assert!(chooser.term.printed("FATAL"));
        assert!(chooser.term.statuses.iter().all(|s| !s.starts_with("Automatic")));
    }

    #[test]
    fn proc_mount_failure_falls_back() {
        let (_dir, config) = setup(Some(ARCH), &[("arch", ARCH)]);
        let system = MockSystem {
            fail_mount: vec!["/proc".to_string()],
            ..Default::default()
        };
        let chooser = run(config, system, MockTerminal::default());

        let calls = &chooser.system.calls;
        assert_eq!(count(calls, "exec_primary /newroot/"), 1);
        assert!(chooser.system.loaded.is_none());
        assert!(!calls.iter().any(|c| c.contains("/data")));
        assert_eq!(
            &calls[calls.len() - 2..],
            ["mount proc /proc proc", "exec_primary /newroot/"]
        );
        assert!(chooser.term.printed("cannot mount proc"));
    }

    #[test]
    fn unreadable_entries_dir_falls_back() {
        let (dir, mut config) = setup(Some(ARCH), &[]);
        config.paths.entries_dir = dir.path().join("missing").display().to_string();
        let chooser = run(config, MockSystem::default(), MockTerminal::default());

        let calls = &chooser.system.calls;
        assert_eq!(count(calls, "exec_primary /newroot/"), 1);
        assert!(chooser.system.loaded.is_none());
        assert_eq!(
            &calls[calls.len() - 3..],
            ["umount /data", "umount /proc", "exec_primary /newroot/"]
        );
        assert!(chooser.term.statuses.iter().all(|s| !s.starts_with("Automatic")));
    }

    #[test]
    fn soft_errors_after_a_fatal_condition_fall_back() {
        let (_dir, config) = setup(None, &[]);
        let term = MockTerminal::with_input(b"", &["", ""]);
        let mut chooser = Chooser::new(config, MockSystem::default(), term);

        chooser.ctx.fatal = true;
        assert_eq!(chooser.dispatch(Selection::Invalid).unwrap(), State::Fallback);
        assert!(chooser.term.printed("ERROR: invalid choice"));

        chooser.ctx.fatal = false;
        assert_eq!(chooser.dispatch(Selection::Entry(7)).unwrap(), State::Menu);
    }

    #[test]
    fn read_only_console_is_not_acquired() {
        let (_dir, config) = setup(Some(ARCH), &[]);
        let system = MockSystem {
            read_only: vec!["/dev/tty0".to_string()],
            ..Default::default()
        };
        let chooser = run(config, system, MockTerminal::default());

        assert_eq!(chooser.term.acquired, 0);
        assert!(chooser.system.loaded.is_none());
        assert_eq!(
            &chooser.system.calls[chooser.system.calls.len() - 2..],
            ["umount /sys", "exec_primary /newroot/"]
        );
    }

    #[test]
    fn typed_input_maps_to_selections() {
        assert_eq!(Selection::from_input("a", true), Selection::Primary);
        assert_eq!(Selection::from_input("  D", true), Selection::Default);
        assert_eq!(Selection::from_input("r", true), Selection::Reboot);
        assert_eq!(Selection::from_input("h", true), Selection::Halt);
        assert_eq!(Selection::from_input("c", true), Selection::Recovery);
        assert_eq!(Selection::from_input("s", true), Selection::Shell);
        assert_eq!(Selection::from_input("s", false), Selection::Invalid);
        assert_eq!(Selection::from_input("12", true), Selection::Entry(12));
        assert_eq!(Selection::from_input(" 3x", true), Selection::Entry(3));
        assert_eq!(Selection::from_input("0", true), Selection::Invalid);
        assert_eq!(Selection::from_input("", true), Selection::Invalid);
        assert_eq!(Selection::from_input("zz", true), Selection::Invalid);
    }

    #[test]
    fn only_shortcut_keys_dispatch_from_the_countdown() {
        assert_eq!(Selection::from_shortcut(b'c', true), Some(Selection::Recovery));
        assert_eq!(Selection::from_shortcut(b'\n', true), None);
        assert_eq!(Selection::from_shortcut(b'1', true), None);
        assert_eq!(Selection::from_shortcut(b's', false), None);
    }
}
