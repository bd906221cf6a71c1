//! In-process backend: drives esptool against a USB-attached ESP32-S3 and
//! reports progress on the device operation topic.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    bridge::{BridgeError, EventBridge, Registration},
    operation::{
        FlashParams, OperationKind, ProgressEvent, DEVICE_OPERATION_TOPIC, FLASH_FIRMWARE,
        RESTART_DEVICE,
    },
    remote::{RemoteCaller, RemoteError},
};

pub mod esptool;
pub mod ports;

#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// esptool executable.
    pub esptool: PathBuf,

    /// Directory holding bootloader, partition table and release firmware images.
    pub assets_dir: PathBuf,

    /// Serial port override. Auto-detected when `None`.
    ///
    /// Example: "COM6" or "/dev/ttyACM0".
    pub port: Option<String>,

    pub chip: String,
    pub baud: u32,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            esptool: PathBuf::from("assets/esptool"),
            assets_dir: PathBuf::from("assets"),
            port: None,
            chip: "ESP32-S3".to_string(),
            baud: 921_600,
        }
    }
}

type Subscribers = HashMap<u64, (String, mpsc::UnboundedSender<serde_json::Value>)>;

/// Fan-out of JSON payloads to topic subscribers.
#[derive(Default)]
pub struct EventHub {
    next_id: AtomicU64,
    subscribers: Mutex<Subscribers>,
}

impl EventHub {
    fn subscribers(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, topic: &str, payload: serde_json::Value) {
        let mut subs = self.subscribers();
        subs.retain(|_, (t, tx)| t.as_str() != topic || tx.send(payload.clone()).is_ok());
    }

    pub fn emit(&self, event: ProgressEvent) {
        debug!(
            progress = event.progress,
            status = ?event.status,
            message = event.message.as_deref().unwrap_or(""),
            "device operation event"
        );
        match serde_json::to_value(&event) {
            Ok(v) => self.publish(DEVICE_OPERATION_TOPIC, v),
            Err(e) => warn!(error = %e, "unable to encode progress event"),
        }
    }

    fn register(&self, topic: &str) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, events) = mpsc::unbounded_channel();
        self.subscribers().insert(id, (topic.to_string(), tx));
        Registration { id, events }
    }

    fn unregister(&self, id: u64) {
        self.subscribers().remove(&id);
    }
}

pub struct LocalBackend {
    opts: BackendOptions,
    hub: Arc<EventHub>,
}

impl LocalBackend {
    pub fn new(opts: BackendOptions) -> Self {
        Self {
            opts,
            hub: Arc::new(EventHub::default()),
        }
    }

    pub fn hub(&self) -> Arc<EventHub> {
        self.hub.clone()
    }

    fn device_port(&self, kind: OperationKind) -> Result<String, RemoteError> {
        if let Some(port) = &self.opts.port {
            return Ok(port.clone());
        }
        match ports::find_device_port() {
            Ok(Some(port)) => {
                info!(%port, "found ESP32-S3 serial port");
                Ok(port)
            }
            Ok(None) => {
                self.hub
                    .emit(ProgressEvent::error(0.0, "Device not connected").for_kind(kind));
                Err(RemoteError::DeviceNotConnected)
            }
            Err(e) => Err(RemoteError::failed(kind.method(), e.to_string())),
        }
    }

    async fn restart(&self) -> Result<(), RemoteError> {
        let kind = OperationKind::Restart;
        let port = self.device_port(kind)?;
        let args = esptool::restart_args(&self.opts, &port);

        self.hub
            .emit(ProgressEvent::running(5.0, "Preparing to restart the device...").for_kind(kind));

        let hub = self.hub.clone();
        let tool = self.opts.esptool.clone();
        tokio::spawn(async move {
            hub.emit(ProgressEvent::running(30.0, "Running restart command...").for_kind(kind));
            let result = esptool::run(&tool, &args, |line| {
                hub.emit(ProgressEvent::running(50.0, format!("Device output: {line}")).for_kind(kind));
            })
            .await;
            hub.emit(finish_event(kind, result, "Device restarted"));
        });

        Ok(())
    }

    async fn flash(&self, params: FlashParams) -> Result<(), RemoteError> {
        let kind = OperationKind::FlashFirmware;
        let port = self.device_port(kind)?;
        let images = esptool::resolve_images(&self.opts.assets_dir, &params)
            .map_err(|e| RemoteError::failed(FLASH_FIRMWARE, e.to_string()))?;
        let args = esptool::flash_args(&self.opts, &port, &images);

        info!(
            %port,
            firmware = %images.firmware.display(),
            "flashing firmware"
        );
        self.hub
            .emit(ProgressEvent::running(5.0, "Preparing to flash firmware...").for_kind(kind));

        let hub = self.hub.clone();
        let tool = self.opts.esptool.clone();
        tokio::spawn(async move {
            hub.emit(ProgressEvent::running(20.0, "Writing firmware...").for_kind(kind));
            let result = esptool::run(&tool, &args, |line| {
                let ev = match esptool::parse_percent(line) {
                    Some(pct) => ProgressEvent::running(
                        esptool::flash_progress(pct),
                        format!("Flashing: {pct}%"),
                    ),
                    None => ProgressEvent::running(30.0, format!("Device output: {line}")),
                };
                hub.emit(ev.for_kind(kind));
            })
            .await;
            hub.emit(finish_event(kind, result, "Firmware flashed"));
        });

        Ok(())
    }
}

fn finish_event(
    kind: OperationKind,
    result: std::io::Result<ExitStatus>,
    success: &str,
) -> ProgressEvent {
    let ev = match result {
        Ok(status) if status.success() => ProgressEvent::success(success),
        Ok(status) => ProgressEvent::error(
            100.0,
            match status.code() {
                Some(code) => format!("{kind} failed, esptool exited with code {code}"),
                None => format!("{kind} failed, esptool was terminated"),
            },
        ),
        Err(e) => ProgressEvent::error(100.0, format!("unable to run esptool: {e}")),
    };
    ev.for_kind(kind)
}

#[async_trait]
impl RemoteCaller for LocalBackend {
    async fn call(&self, method: &str, payload: serde_json::Value) -> Result<(), RemoteError> {
        match method {
            RESTART_DEVICE => self.restart().await,
            FLASH_FIRMWARE => {
                let params: FlashParams =
                    serde_json::from_value(payload).map_err(|e| RemoteError::InvalidPayload {
                        method: method.to_string(),
                        message: e.to_string(),
                    })?;
                self.flash(params).await
            }
            other => Err(RemoteError::UnknownMethod {
                method: other.to_string(),
            }),
        }
    }
}

#[async_trait]
impl EventBridge for LocalBackend {
    async fn subscribe(&self, topic: &str) -> Result<Registration, BridgeError> {
        Ok(self.hub.register(topic))
    }

    fn unsubscribe(&self, id: u64) {
        self.hub.unregister(id);
    }
}
