use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::backend::BackendOptions;
use crate::operation::{DeviceTarget, FirmwareChannel, FlashParams};

pub const BOOTLOADER_ADDR: &str = "0x0000";
pub const PARTITION_TABLE_ADDR: &str = "0x8000";
pub const APP_ADDR: &str = "0x10000";

pub const BOOTLOADER_FILE: &str = "bootloader.bin";
pub const PARTITION_TABLE_FILE: &str = "partition-table.bin";

/// Share of the bar reserved before esptool starts writing.
const FLASH_BASE: f64 = 20.0;
const FLASH_SPAN: f64 = 0.75;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FirmwareError {
    #[error("{what} not found at {path}")]
    Missing { what: &'static str, path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImages {
    pub bootloader: PathBuf,
    pub partition_table: PathBuf,
    pub firmware: PathBuf,
}

pub fn firmware_file_name(device: DeviceTarget, channel: FirmwareChannel) -> String {
    let base = match device {
        DeviceTarget::Face | DeviceTarget::Custom => "face_tracker.bin",
        DeviceTarget::LeftEye => "left_eye.bin",
        DeviceTarget::RightEye => "right_eye.bin",
    };
    match channel {
        FirmwareChannel::Beta => format!("beta_{base}"),
        FirmwareChannel::Stable | FirmwareChannel::Custom => base.to_string(),
    }
}

pub fn resolve_images(assets_dir: &Path, params: &FlashParams) -> Result<FlashImages, FirmwareError> {
    let firmware = match &params.firmware_path {
        Some(p) => PathBuf::from(p),
        None => assets_dir.join(firmware_file_name(params.device_type, params.firmware_type)),
    };
    let images = FlashImages {
        bootloader: assets_dir.join(BOOTLOADER_FILE),
        partition_table: assets_dir.join(PARTITION_TABLE_FILE),
        firmware,
    };

    for (what, path) in [
        ("bootloader", &images.bootloader),
        ("partition table", &images.partition_table),
        ("firmware image", &images.firmware),
    ] {
        if !path.is_file() {
            return Err(FirmwareError::Missing {
                what,
                path: path.clone(),
            });
        }
    }

    Ok(images)
}

fn base_args(opts: &BackendOptions, port: &str) -> Vec<String> {
    vec![
        "--chip".to_string(),
        opts.chip.clone(),
        "--port".to_string(),
        port.to_string(),
        "--baud".to_string(),
        opts.baud.to_string(),
    ]
}

pub fn restart_args(opts: &BackendOptions, port: &str) -> Vec<String> {
    let mut args = base_args(opts, port);
    args.push("run".to_string());
    args
}

pub fn flash_args(opts: &BackendOptions, port: &str, images: &FlashImages) -> Vec<String> {
    let mut args = base_args(opts, port);
    args.extend(
        [
            "--before",
            "default_reset",
            "--after",
            "hard_reset",
            "write_flash",
            BOOTLOADER_ADDR,
        ]
        .map(String::from),
    );
    args.push(images.bootloader.to_string_lossy().into_owned());
    args.push(PARTITION_TABLE_ADDR.to_string());
    args.push(images.partition_table.to_string_lossy().into_owned());
    args.push(APP_ADDR.to_string());
    args.push(images.firmware.to_string_lossy().into_owned());
    args
}

static PERCENT_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(\d+) *%").ok());

/// Last `NN%` (or `NN %`) reading on an esptool output line.
pub fn parse_percent(line: &str) -> Option<u32> {
    let re = PERCENT_RE.as_ref()?;
    re.captures_iter(line)
        .filter_map(|cap| cap.get(1)?.as_str().parse::<u32>().ok())
        .last()
        .map(|v| v.min(100))
}

pub fn flash_progress(percent: u32) -> f64 {
    FLASH_BASE + f64::from(percent.min(100)) * FLASH_SPAN
}

/// Runs esptool, feeding each stdout line to `on_line`.
///
/// Output is decoded lossily and a read error only stops the line feed; the
/// child is always waited for, never dropped mid-write.
pub async fn run<F>(tool: &Path, args: &[String], mut on_line: F) -> std::io::Result<ExitStatus>
where
    F: FnMut(&str),
{
    debug!(tool = %tool.display(), ?args, "spawning esptool");
    let mut child = Command::new(tool)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut buf = Vec::new();
            while let Ok(n) = reader.read_until(b'\n', &mut buf).await {
                if n == 0 {
                    break;
                }
                debug!(target: "esptool", "{}", String::from_utf8_lossy(&buf).trim_end());
                buf.clear();
            }
        });
    }

    if let Some(stdout) = child.stdout.take() {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim();
                    if !line.is_empty() {
                        on_line(line);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "esptool stdout unreadable, waiting for exit");
                    break;
                }
            }
        }
    }

    child.wait().await
}
