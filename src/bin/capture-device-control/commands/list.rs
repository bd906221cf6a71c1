use capture_device_control::backend::ports;

use crate::cli;
use crate::exit_codes;
use crate::output::{Event, Output};

pub fn run(_args: cli::ListArgs, out: &Output) -> i32 {
    match ports::discover_ports() {
        Ok(found) => {
            out.reporter.emit(Event::Ports(found));
            exit_codes::EXIT_OK
        }
        Err(e) => {
            out.reporter.emit(Event::Error {
                code: exit_codes::EXIT_UNEXPECTED,
                message: e.to_string(),
            });
            exit_codes::EXIT_UNEXPECTED
        }
    }
}
