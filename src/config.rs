//! Configuration structures for the root chooser

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Locations searched for a configuration file, in order
pub const CONFIG_PATHS: &[&str] = &["/etc/root-chooser.toml", "/root-chooser.toml"];

/// Main chooser configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChooserConfig {
    /// Device nodes, mount points and files
    #[serde(default)]
    pub paths: PathsConfig,

    /// Boot behaviour
    #[serde(default)]
    pub boot: BootConfig,

    /// Process-wide settings
    #[serde(default)]
    pub system: SystemConfig,
}

/// Filesystem locations used by the chooser
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Framebuffer device node
    #[serde(default = "default_framebuffer")]
    pub framebuffer: String,

    /// 24-bit bitmap painted behind the menu
    #[serde(default = "default_background")]
    pub background: String,

    /// Interactive console
    #[serde(default = "default_console")]
    pub console: String,

    /// Busybox binary providing `mdev` and `sh`
    #[serde(default = "default_busybox")]
    pub busybox: String,

    /// kexec-tools binary
    #[serde(default = "default_kexec")]
    pub kexec: String,

    /// Partition holding the boot descriptors
    #[serde(default = "default_data_device")]
    pub data_device: String,

    /// Where the data partition is mounted
    #[serde(default = "default_data_mount")]
    pub data_mount: String,

    /// Filesystem of the data partition
    #[serde(default = "default_fstype")]
    pub data_fstype: String,

    /// Directory of boot descriptors, one per file
    #[serde(default = "default_entries_dir")]
    pub entries_dir: String,

    /// Optional descriptor booted when the countdown expires
    #[serde(default = "default_default_entry")]
    pub default_entry: String,

    /// Mount point of the selected root; prefixes kernel and initrd paths
    #[serde(default = "default_new_root")]
    pub new_root: String,

    /// Root holding the primary OS `/init`
    #[serde(default = "default_new_root")]
    pub primary_root: String,

    /// Misc partition used to request a recovery boot
    #[serde(default = "default_misc_partition")]
    pub misc_partition: String,

    /// Source of the running kernel's command line
    #[serde(default = "default_proc_cmdline")]
    pub proc_cmdline: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            framebuffer: default_framebuffer(),
            background: default_background(),
            console: default_console(),
            busybox: default_busybox(),
            kexec: default_kexec(),
            data_device: default_data_device(),
            data_mount: default_data_mount(),
            data_fstype: default_fstype(),
            entries_dir: default_entries_dir(),
            default_entry: default_default_entry(),
            new_root: default_new_root(),
            primary_root: default_new_root(),
            misc_partition: default_misc_partition(),
            proc_cmdline: default_proc_cmdline(),
        }
    }
}

/// Boot behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootConfig {
    /// Seconds to wait for a key before booting the default entry
    #[serde(default = "default_timeout")]
    pub timeout: u32,

    /// Seconds to wait for the console or a block device to appear
    #[serde(default = "default_timeout")]
    pub device_timeout: u32,

    /// Filesystem of the selected root device
    #[serde(default = "default_fstype")]
    pub rootfs_type: String,

    /// Load with `--load-hardboot` instead of `-l`
    #[serde(default)]
    pub hardboot: bool,

    /// Offer the busybox shell in the menu
    #[serde(default = "default_true")]
    pub shell: bool,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            device_timeout: default_timeout(),
            rootfs_type: default_fstype(),
            hardboot: false,
            shell: true,
        }
    }
}

/// Process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_framebuffer() -> String {
    "/dev/graphics/fb0".to_string()
}

fn default_background() -> String {
    "/res/background.bmp".to_string()
}

fn default_console() -> String {
    "/dev/tty0".to_string()
}

fn default_busybox() -> String {
    "/sbin/busybox".to_string()
}

fn default_kexec() -> String {
    "/sbin/kexec".to_string()
}

fn default_data_device() -> String {
    "/dev/block/mmcblk0p8".to_string()
}

fn default_data_mount() -> String {
    "/data".to_string()
}

fn default_fstype() -> String {
    "ext4".to_string()
}

fn default_entries_dir() -> String {
    "/data/.root.d".to_string()
}

fn default_default_entry() -> String {
    "/data/.root.default".to_string()
}

fn default_new_root() -> String {
    "/newroot/".to_string()
}

fn default_misc_partition() -> String {
    "/dev/block/mmcblk0p3".to_string()
}

fn default_proc_cmdline() -> String {
    "/proc/cmdline".to_string()
}

fn default_timeout() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ChooserConfig {
    /// Load the first readable configuration file, or fall back to defaults
    pub fn load() -> Self {
        for path in CONFIG_PATHS {
            if !Path::new(path).exists() {
                continue;
            }
            match fs::read_to_string(path) {
                Ok(content) => match toml::from_str(&content) {
                    Ok(config) => {
                        log::info!("Loaded configuration from {}", path);
                        return config;
                    }
                    Err(e) => log::warn!("Ignoring {}: {}", path, e),
                },
                Err(e) => log::warn!("Cannot read {}: {}", path, e),
            }
        }

        log::info!("Using default configuration");
        Self::default()
    }

    /// Apply `chooser.*` options found on the running kernel's command line
    pub fn apply_cmdline_overrides(&mut self, cmdline: &str) {
        for arg in cmdline.split_whitespace() {
            let Some((key, value)) = arg.split_once('=') else {
                continue;
            };
            match key {
                "chooser.timeout" => match value.parse() {
                    Ok(t) => self.boot.timeout = t,
                    Err(_) => log::warn!("Bad chooser.timeout value: {}", value),
                },
                "chooser.shell" => self.boot.shell = value == "1",
                "chooser.hardboot" => self.boot.hardboot = value == "1",
                _ => {}
            }
        }
    }

    /// Max level matching `system.log_level`
    pub fn log_level(&self) -> log::LevelFilter {
        self.system
            .log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }
}
