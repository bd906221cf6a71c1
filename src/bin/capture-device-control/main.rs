use std::process;

use clap::Parser;

mod cli;
mod commands;
mod context;
mod exit_codes;
mod logging;
mod output;

#[tokio::main]
async fn main() {
    logging::init_tracing();

    let cli = cli::Cli::parse();

    let exit_code = match cli.command {
        cli::Command::Restart(args) => {
            let out = output::make(&args.output);
            let code = commands::restart::run(args, &out).await;
            out.reporter.finish();
            code
        }
        cli::Command::Flash(args) => {
            let out = output::make(&args.output);
            let code = commands::flash::run(args, &out).await;
            out.reporter.finish();
            code
        }
        cli::Command::List(args) => {
            let out = output::make_for_list(&args);
            let code = commands::list::run(args, &out);
            out.reporter.finish();
            code
        }
    };

    process::exit(exit_code);
}
