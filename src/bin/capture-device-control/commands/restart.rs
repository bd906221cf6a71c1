use crate::cli;
use crate::commands;
use crate::context;
use crate::output::Output;

pub async fn run(args: cli::RestartArgs, out: &Output) -> i32 {
    let coordinator = commands::coordinator(
        context::backend_opts(&args.backend),
        context::coordinator_opts(&args.backend),
        out,
    );
    let started = coordinator.restart().await;
    commands::drive(&coordinator, started, out).await
}
