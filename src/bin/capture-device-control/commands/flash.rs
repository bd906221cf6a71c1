use capture_device_control::FlashRequest;

use crate::cli;
use crate::commands;
use crate::context;
use crate::output::Output;

pub async fn run(args: cli::FlashArgs, out: &Output) -> i32 {
    let coordinator = commands::coordinator(
        context::backend_opts(&args.backend),
        context::coordinator_opts(&args.backend),
        out,
    );
    let started = coordinator.flash(request(&args)).await;
    commands::drive(&coordinator, started, out).await
}

fn request(args: &cli::FlashArgs) -> FlashRequest {
    let req = FlashRequest::new(args.device.into(), args.firmware.into());
    match &args.firmware_path {
        Some(path) => req.with_path(path.to_string_lossy()),
        None => req,
    }
}
