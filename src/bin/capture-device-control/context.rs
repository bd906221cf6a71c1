use std::time::Duration;

use capture_device_control::backend::BackendOptions;
use capture_device_control::CoordinatorOptions;

use crate::cli;

pub fn backend_opts(args: &cli::BackendArgs) -> BackendOptions {
    BackendOptions {
        esptool: args.esptool.clone(),
        assets_dir: args.assets_dir.clone(),
        port: args.port.clone(),
        baud: args.baud,
        ..Default::default()
    }
}

pub fn coordinator_opts(args: &cli::BackendArgs) -> CoordinatorOptions {
    CoordinatorOptions::default().with_tick(Duration::from_millis(args.tick_ms.max(1)))
}
