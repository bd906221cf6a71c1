use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Remote method that restarts the device.
pub const RESTART_DEVICE: &str = "restart_device";
/// Remote method that writes a firmware image to the device.
pub const FLASH_FIRMWARE: &str = "flash_firmware";

/// Push topic carrying [`ProgressEvent`] payloads for every operation kind.
pub const DEVICE_OPERATION_TOPIC: &str = "device_operation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Restart,
    FlashFirmware,
}

impl OperationKind {
    pub fn method(self) -> &'static str {
        match self {
            OperationKind::Restart => RESTART_DEVICE,
            OperationKind::FlashFirmware => FLASH_FIRMWARE,
        }
    }

    /// A flash cannot be interrupted safely once started.
    pub fn cancellable(self) -> bool {
        match self {
            OperationKind::Restart => true,
            OperationKind::FlashFirmware => false,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Restart => "restart",
            OperationKind::FlashFirmware => "flash",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceTarget {
    Face,
    LeftEye,
    RightEye,
    Custom,
}

impl DeviceTarget {
    pub fn display_name(self) -> &'static str {
        match self {
            DeviceTarget::Face => "face tracker",
            DeviceTarget::LeftEye => "left eye",
            DeviceTarget::RightEye => "right eye",
            DeviceTarget::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareChannel {
    Stable,
    Beta,
    Custom,
}

/// Raw firmware selection as collected from the UI selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashRequest {
    pub device_target: DeviceTarget,
    pub firmware_channel: FirmwareChannel,
    /// Required for [`FirmwareChannel::Custom`], rejected otherwise.
    pub firmware_path: Option<String>,
}

impl FlashRequest {
    pub fn new(device_target: DeviceTarget, firmware_channel: FirmwareChannel) -> Self {
        Self {
            device_target,
            firmware_channel,
            firmware_path: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.firmware_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<FlashParams, ValidationError> {
        let path = self
            .firmware_path
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty());

        match (self.firmware_channel, path) {
            (FirmwareChannel::Custom, None) => Err(ValidationError::MissingFirmwarePath),
            (FirmwareChannel::Custom, Some(p)) => Ok(FlashParams {
                device_type: self.device_target,
                firmware_type: self.firmware_channel,
                firmware_path: Some(p.to_string()),
            }),
            (channel, Some(_)) => Err(ValidationError::UnexpectedFirmwarePath { channel }),
            (_, None) => Ok(FlashParams {
                device_type: self.device_target,
                firmware_type: self.firmware_channel,
                firmware_path: None,
            }),
        }
    }
}

/// Wire payload of [`FLASH_FIRMWARE`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashParams {
    pub device_type: DeviceTarget,
    pub firmware_type: FirmwareChannel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_path: Option<String>,
}

impl FlashParams {
    pub fn to_payload(&self) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "device_type": self.device_type,
            "firmware_type": self.firmware_type,
        });
        if let (Some(path), serde_json::Value::Object(obj)) = (&self.firmware_path, &mut payload) {
            obj.insert("firmware_path".to_string(), serde_json::Value::from(path.as_str()));
        }
        payload
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("custom firmware requires a firmware path")]
    MissingFirmwarePath,

    #[error("firmware path is only accepted for custom firmware (got {channel:?})")]
    UnexpectedFirmwarePath { channel: FirmwareChannel },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
    Success,
    Error,
}

/// Payload pushed on [`DEVICE_OPERATION_TOPIC`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub status: ProgressStatus,
    /// Optional routing hint. Untagged events reach every running session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<OperationKind>,
}

impl ProgressEvent {
    pub fn running(progress: f64, message: impl Into<String>) -> Self {
        Self {
            progress,
            message: Some(message.into()),
            status: ProgressStatus::Running,
            kind: None,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            progress: 100.0,
            message: Some(message.into()),
            status: ProgressStatus::Success,
            kind: None,
        }
    }

    pub fn error(progress: f64, message: impl Into<String>) -> Self {
        Self {
            progress,
            message: Some(message.into()),
            status: ProgressStatus::Error,
            kind: None,
        }
    }

    pub fn for_kind(mut self, kind: OperationKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref().filter(|m| !m.trim().is_empty())
    }

    /// Error wins over a 100% reading; the failing backend still reports 100.
    pub fn terminal(&self) -> Option<ProgressStatus> {
        match self.status {
            ProgressStatus::Error => Some(ProgressStatus::Error),
            ProgressStatus::Success => Some(ProgressStatus::Success),
            ProgressStatus::Running if self.progress >= 100.0 => Some(ProgressStatus::Success),
            ProgressStatus::Running => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureOrigin {
    /// The remote call itself rejected.
    Remote,
    /// The device reported `status=error`.
    Device,
    /// The progress subscription could not be registered.
    Bridge,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Succeeded {
        message: String,
    },
    Failed {
        message: String,
        origin: FailureOrigin,
    },
    Cancelled,
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Succeeded { .. })
    }
}
