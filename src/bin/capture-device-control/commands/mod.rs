use std::sync::Arc;

use capture_device_control::backend::{BackendOptions, LocalBackend};
use capture_device_control::coordinator::OperationErrorKind;
use capture_device_control::{
    Coordinator, CoordinatorOptions, OperationError, OperationOutcome, SessionHandle,
};

use crate::exit_codes;
use crate::output::{Event, Output};

pub mod flash;
pub mod list;
pub mod restart;

pub(crate) fn coordinator(
    backend: BackendOptions,
    opts: CoordinatorOptions,
    out: &Output,
) -> Coordinator {
    let backend = Arc::new(LocalBackend::new(backend));
    Coordinator::new(
        backend.clone(),
        backend,
        out.presenter.clone(),
        out.notifier.clone(),
        opts,
    )
}

/// Waits for the session, forwarding Ctrl-C as a cancel request.
pub(crate) async fn drive(
    coordinator: &Coordinator,
    started: Result<SessionHandle, OperationError>,
    out: &Output,
) -> i32 {
    let handle = match started {
        Ok(h) => h,
        Err(e) => {
            let code = map_operation_error(&e);
            out.reporter.emit(Event::Error {
                code,
                message: e.to_string(),
            });
            return code;
        }
    };

    let kind = handle.kind();
    let wait = handle.wait();
    tokio::pin!(wait);

    let outcome = loop {
        tokio::select! {
            outcome = &mut wait => break outcome,
            signal = tokio::signal::ctrl_c() => {
                if signal.is_err() {
                    break (&mut wait).await;
                }
                match coordinator.cancel(kind) {
                    Ok(()) => {}
                    Err(e) if e.kind() == OperationErrorKind::NotCancellable => {
                        out.reporter.emit(Event::Hint(format!(
                            "{kind} cannot be interrupted, waiting for it to finish"
                        )));
                    }
                    Err(e) => tracing::debug!(error = %e, "cancel ignored"),
                }
            }
        }
    };

    coordinator.shutdown().await;

    let code = outcome_exit_code(&outcome);
    out.reporter.emit(Event::Outcome { kind, outcome });
    code
}

pub(crate) fn outcome_exit_code(outcome: &OperationOutcome) -> i32 {
    match outcome {
        OperationOutcome::Succeeded { .. } => exit_codes::EXIT_OK,
        OperationOutcome::Failed { .. } => exit_codes::EXIT_OPERATION_FAILED,
        OperationOutcome::Cancelled => exit_codes::EXIT_CANCELLED,
    }
}

pub(crate) fn map_operation_error(e: &OperationError) -> i32 {
    match e.kind() {
        OperationErrorKind::Busy => exit_codes::EXIT_BUSY,
        OperationErrorKind::InvalidRequest => exit_codes::EXIT_INVALID_REQUEST,
        OperationErrorKind::NotCancellable | OperationErrorKind::NotRunning => {
            exit_codes::EXIT_UNEXPECTED
        }
    }
}
