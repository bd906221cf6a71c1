use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use capture_device_control::operation::{DeviceTarget, FirmwareChannel};

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum DeviceArg {
    /// Face tracking camera.
    Face,
    LeftEye,
    RightEye,
    /// Custom board (uses the face tracker image unless --firmware-path is given).
    Custom,
}

impl From<DeviceArg> for DeviceTarget {
    fn from(d: DeviceArg) -> Self {
        match d {
            DeviceArg::Face => DeviceTarget::Face,
            DeviceArg::LeftEye => DeviceTarget::LeftEye,
            DeviceArg::RightEye => DeviceTarget::RightEye,
            DeviceArg::Custom => DeviceTarget::Custom,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum FirmwareArg {
    Stable,
    Beta,
    /// Flash the image given by --firmware-path.
    Custom,
}

impl From<FirmwareArg> for FirmwareChannel {
    fn from(f: FirmwareArg) -> Self {
        match f {
            FirmwareArg::Stable => FirmwareChannel::Stable,
            FirmwareArg::Beta => FirmwareChannel::Beta,
            FirmwareArg::Custom => FirmwareChannel::Custom,
        }
    }
}

#[derive(Parser)]
#[command(name = "capture-device-control")]
#[command(about = "Restart and flash ESP32-S3 face/eye tracking cameras")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Restart the connected device.
    Restart(RestartArgs),

    /// Flash firmware to the connected device.
    Flash(FlashArgs),

    /// List detected ESP32-S3 serial ports.
    List(ListArgs),
}

#[derive(Parser, Clone)]
pub struct BackendArgs {
    /// Path to the esptool executable.
    #[arg(long, default_value = "assets/esptool")]
    pub esptool: PathBuf,

    /// Directory holding bootloader.bin, partition-table.bin and release images.
    #[arg(long, default_value = "assets")]
    pub assets_dir: PathBuf,

    /// Serial port to use (e.g. COM6 or /dev/ttyACM0). Auto-detected by default.
    #[arg(long)]
    pub port: Option<String>,

    /// Serial baud rate passed to esptool.
    #[arg(long, default_value_t = 921_600)]
    pub baud: u32,

    /// Interval of the simulated progress ramp.
    #[arg(long, default_value_t = 100)]
    pub tick_ms: u64,
}

#[derive(Parser, Clone)]
pub struct OutputArgs {
    /// Emit JSON line events to stdout.
    #[arg(long)]
    pub json: bool,

    /// Include monotonic timestamps in JSON events (milliseconds since process start).
    #[arg(long, requires = "json")]
    pub json_timestamps: bool,

    /// Reduce output (only errors).
    #[arg(long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Print device output lines.
    #[arg(long, short)]
    pub verbose: bool,
}

#[derive(Parser)]
pub struct RestartArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Parser)]
pub struct FlashArgs {
    /// Device the firmware is meant for.
    #[arg(long, value_enum, default_value_t = DeviceArg::Face)]
    pub device: DeviceArg,

    /// Firmware channel.
    #[arg(long, value_enum, default_value_t = FirmwareArg::Stable)]
    pub firmware: FirmwareArg,

    /// Firmware image for `--firmware custom`.
    #[arg(long)]
    pub firmware_path: Option<PathBuf>,

    #[command(flatten)]
    pub backend: BackendArgs,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Parser)]
pub struct ListArgs {
    /// Emit JSON line output.
    #[arg(long)]
    pub json: bool,
}
