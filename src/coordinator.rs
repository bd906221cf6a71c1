use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{
    bridge::{Dispatch, EventBridge, SubscriptionManager},
    operation::{
        FailureOrigin, FlashRequest, OperationKind, OperationOutcome, ProgressEvent,
        ProgressStatus, ValidationError, DEVICE_OPERATION_TOPIC,
    },
    presenter::{Notifier, Presenter, PresenterConfig, PresenterController},
    progress::{ProgressTrack, RampProfile},
    remote::RemoteCaller,
};

const SUCCESS_TITLE: &str = "Operation complete";
const FAILURE_TITLE: &str = "Operation failed";

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Push topic carrying progress for every operation kind.
    pub topic: String,
    pub restart_ramp: RampProfile,
    pub flash_ramp: RampProfile,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            topic: DEVICE_OPERATION_TOPIC.to_string(),
            restart_ramp: RampProfile::for_kind(OperationKind::Restart),
            flash_ramp: RampProfile::for_kind(OperationKind::FlashFirmware),
        }
    }
}

impl CoordinatorOptions {
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.restart_ramp = self.restart_ramp.with_tick(tick);
        self.flash_ramp = self.flash_ramp.with_tick(tick);
        self
    }

    pub fn ramp(&self, kind: OperationKind) -> RampProfile {
        match kind {
            OperationKind::Restart => self.restart_ramp,
            OperationKind::FlashFirmware => self.flash_ramp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Idle,
    Requested,
    Running,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperationErrorKind {
    Busy,
    InvalidRequest,
    NotCancellable,
    NotRunning,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("{kind} operation already in progress")]
    Busy { kind: OperationKind },

    #[error("invalid flash request: {0}")]
    Validation(#[from] ValidationError),

    #[error("{kind} operation cannot be cancelled")]
    NotCancellable { kind: OperationKind },

    #[error("no {kind} operation is running")]
    NotRunning { kind: OperationKind },
}

impl OperationError {
    pub fn kind(&self) -> OperationErrorKind {
        match self {
            OperationError::Busy { .. } => OperationErrorKind::Busy,
            OperationError::Validation(_) => OperationErrorKind::InvalidRequest,
            OperationError::NotCancellable { .. } => OperationErrorKind::NotCancellable,
            OperationError::NotRunning { .. } => OperationErrorKind::NotRunning,
        }
    }
}

/// Returned for an accepted request. Resolves once the session is terminal.
#[derive(Debug)]
pub struct SessionHandle {
    id: u64,
    kind: OperationKind,
    outcome: oneshot::Receiver<OperationOutcome>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub async fn wait(self) -> OperationOutcome {
        // The sender only disappears without a value when the coordinator is dropped.
        self.outcome.await.unwrap_or(OperationOutcome::Cancelled)
    }
}

struct Session {
    id: u64,
    started_at: Instant,
    phase: OperationState,
    cancellable: bool,
    controller: Arc<dyn PresenterController>,
    progress: ProgressTrack,
    ramp: RampProfile,
    ramp_task: Option<JoinHandle<()>>,
    outcome: Option<oneshot::Sender<OperationOutcome>>,
}

impl Session {
    fn resolve(&mut self, outcome: OperationOutcome) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(outcome);
        }
    }
}

#[derive(Default)]
struct Sessions {
    next_id: u64,
    active: HashMap<OperationKind, Session>,
    /// Kinds whose presenter is being opened.
    opening: HashSet<OperationKind>,
}

struct Inner {
    this: Weak<Inner>,
    remote: Arc<dyn RemoteCaller>,
    presenter: Arc<dyn Presenter>,
    notifier: Arc<dyn Notifier>,
    subscriptions: SubscriptionManager,
    opts: CoordinatorOptions,
    sessions: Mutex<Sessions>,
}

/// Runs restart and flash operations against one device, at most one of each
/// kind at a time.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(
        remote: Arc<dyn RemoteCaller>,
        bridge: Arc<dyn EventBridge>,
        presenter: Arc<dyn Presenter>,
        notifier: Arc<dyn Notifier>,
        opts: CoordinatorOptions,
    ) -> Self {
        let inner = Arc::new_cyclic(|this: &Weak<Inner>| {
            let weak = this.clone();
            let dispatch: Dispatch = Arc::new(move |topic, payload| {
                if let Some(inner) = weak.upgrade() {
                    inner.dispatch(topic, payload);
                }
            });
            Inner {
                this: this.clone(),
                remote,
                presenter,
                notifier,
                subscriptions: SubscriptionManager::new(bridge, dispatch),
                opts,
                sessions: Mutex::new(Sessions::default()),
            }
        });
        Self { inner }
    }

    pub async fn restart(&self) -> Result<SessionHandle, OperationError> {
        self.start(
            OperationKind::Restart,
            serde_json::json!({}),
            "Preparing to restart the device, please wait...".to_string(),
        )
        .await
    }

    pub async fn flash(&self, request: FlashRequest) -> Result<SessionHandle, OperationError> {
        let params = request.validate().map_err(|e| {
            warn!(error = %e, "rejected flash request");
            e
        })?;
        let message = format!(
            "Flashing {} firmware, do not disconnect the device...",
            request.device_target.display_name()
        );
        self.start(OperationKind::FlashFirmware, params.to_payload(), message)
            .await
    }

    /// Cancels through the presenter, as if the user pressed its cancel button.
    pub fn cancel(&self, kind: OperationKind) -> Result<(), OperationError> {
        let (id, controller) = {
            let sessions = self.inner.lock();
            let session = sessions
                .active
                .get(&kind)
                .ok_or(OperationError::NotRunning { kind })?;
            if !session.cancellable {
                return Err(OperationError::NotCancellable { kind });
            }
            (session.id, session.controller.clone())
        };
        controller.cancel();
        self.inner.on_presenter_cancel(kind, id);
        Ok(())
    }

    pub fn state(&self, kind: OperationKind) -> OperationState {
        let sessions = self.inner.lock();
        match sessions.active.get(&kind) {
            Some(s) => s.phase,
            None if sessions.opening.contains(&kind) => OperationState::Requested,
            None => OperationState::Idle,
        }
    }

    /// Drops the event subscription and detaches every live session.
    pub async fn shutdown(&self) {
        self.inner.subscriptions.reset().await;

        let drained: Vec<Session> = self.inner.lock().active.drain().map(|(_, s)| s).collect();
        for mut session in drained {
            if let Some(task) = session.ramp_task.take() {
                task.abort();
            }
            session.controller.cancel();
            session.resolve(OperationOutcome::Cancelled);
        }
        debug!("coordinator shut down");
    }

    async fn start(
        &self,
        kind: OperationKind,
        payload: serde_json::Value,
        message: String,
    ) -> Result<SessionHandle, OperationError> {
        let inner = &self.inner;
        let handle = inner.open_session(kind, message)?;
        let id = handle.id;

        if let Err(e) = inner
            .subscriptions
            .ensure_subscribed(&inner.opts.topic)
            .await
        {
            inner.fail(kind, id, e.to_string(), FailureOrigin::Bridge);
            return Ok(handle);
        }

        if !inner.begin_running(kind, id) {
            debug!(%kind, session = id, "session ended before the call was issued");
            return Ok(handle);
        }

        let weak = inner.this.clone();
        let remote = inner.remote.clone();
        tokio::spawn(async move {
            let result = remote.call(kind.method(), payload).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(()) => debug!(%kind, session = id, "remote call accepted"),
                Err(e) => inner.fail(
                    kind,
                    id,
                    format!("{kind} call failed: {e}"),
                    FailureOrigin::Remote,
                ),
            }
        });

        Ok(handle)
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_session(
        &self,
        kind: OperationKind,
        message: String,
    ) -> Result<SessionHandle, OperationError> {
        let id = {
            let mut sessions = self.lock();
            if sessions.active.contains_key(&kind) || sessions.opening.contains(&kind) {
                warn!(%kind, "operation already in progress");
                return Err(OperationError::Busy { kind });
            }
            sessions.opening.insert(kind);
            sessions.next_id += 1;
            sessions.next_id
        };
        let ramp = self.opts.ramp(kind);
        let cancellable = kind.cancellable();

        let weak = self.this.clone();
        let config = PresenterConfig {
            title: title_for(kind).to_string(),
            message,
            cancelable: cancellable,
            initial_progress: 0.0,
            ramp,
            on_complete: Some(Box::new(move || {
                debug!(%kind, session = id, "presenter completed");
            })),
            on_cancel: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_presenter_cancel(kind, id);
                }
            })),
        };
        // Opened without the lock; the slot is held by `opening`.
        let controller = self.presenter.open(config);

        let (tx, rx) = oneshot::channel();
        let mut sessions = self.lock();
        sessions.opening.remove(&kind);
        sessions.active.insert(
            kind,
            Session {
                id,
                started_at: Instant::now(),
                phase: OperationState::Requested,
                cancellable,
                controller,
                progress: ProgressTrack::new(0.0),
                ramp,
                ramp_task: None,
                outcome: Some(tx),
            },
        );
        info!(%kind, session = id, "operation requested");

        Ok(SessionHandle {
            id,
            kind,
            outcome: rx,
        })
    }

    fn begin_running(&self, kind: OperationKind, id: u64) -> bool {
        let mut sessions = self.lock();
        let Some(session) = sessions.active.get_mut(&kind).filter(|s| s.id == id) else {
            return false;
        };
        session.phase = OperationState::Running;
        session.ramp_task = Some(spawn_ramp(self.this.clone(), kind, id, session.ramp.tick));
        info!(%kind, session = id, "operation running");
        true
    }

    /// Returns whether the ramp can still advance.
    fn ramp_tick(&self, kind: OperationKind, id: u64) -> bool {
        let mut sessions = self.lock();
        let Some(session) = running(&mut sessions, kind, id) else {
            return false;
        };
        if let Some(value) = session.progress.tick(&session.ramp) {
            session.controller.update_progress(value);
        }
        session.ramp.next(session.progress.displayed).is_some()
    }

    fn dispatch(&self, topic: &str, payload: serde_json::Value) {
        let event: ProgressEvent = match serde_json::from_value(payload) {
            Ok(ev) => ev,
            Err(e) => {
                warn!(topic, error = %e, "dropping malformed progress event");
                return;
            }
        };

        let targets: Vec<(OperationKind, u64)> = self
            .lock()
            .active
            .iter()
            .filter(|(_, s)| s.phase == OperationState::Running)
            .filter(|(kind, _)| event.kind.map_or(true, |k| k == **kind))
            .map(|(kind, s)| (*kind, s.id))
            .collect();

        match targets.len() {
            0 => debug!(topic, progress = event.progress, "no running operation for event"),
            1 => {}
            n => warn!(
                topic,
                running = n,
                "untagged progress event delivered to several running operations"
            ),
        }

        for (kind, id) in targets {
            self.apply_event(kind, id, &event);
        }
    }

    fn apply_event(&self, kind: OperationKind, id: u64, event: &ProgressEvent) {
        match event.terminal() {
            Some(ProgressStatus::Error) => {
                let message = event
                    .message()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("device reported a {kind} error"));
                self.fail(kind, id, message, FailureOrigin::Device);
            }
            Some(_) => self.succeed(kind, id, event.message()),
            None => {
                let mut sessions = self.lock();
                let Some(session) = running(&mut sessions, kind, id) else {
                    return;
                };
                debug!(%kind, session = id, progress = event.progress, "progress event");
                if let Some(value) = session.progress.observe_real(event.progress) {
                    session.controller.update_progress(value);
                }
                if let Some(message) = event.message() {
                    session.controller.set_message(message);
                }
            }
        }
    }

    /// Removes the session so later terminal signals find nothing.
    fn take_session(&self, kind: OperationKind, id: u64) -> Option<Session> {
        let mut sessions = self.lock();
        if sessions.active.get(&kind).map(|s| s.id) != Some(id) {
            return None;
        }
        let mut session = sessions.active.remove(&kind)?;
        if let Some(task) = session.ramp_task.take() {
            task.abort();
        }
        Some(session)
    }

    fn succeed(&self, kind: OperationKind, id: u64, message: Option<&str>) {
        let Some(mut session) = self.take_session(kind, id) else {
            debug!(%kind, session = id, "ignoring success for finished session");
            return;
        };

        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| default_success_message(kind).to_string());
        session.controller.update_progress(session.progress.finish());
        session.controller.set_message(&message);
        session.controller.complete();
        self.notifier.success(&message, Some(SUCCESS_TITLE));

        info!(
            %kind,
            session = id,
            elapsed_ms = session.started_at.elapsed().as_millis() as u64,
            "operation succeeded"
        );
        session.resolve(OperationOutcome::Succeeded { message });
    }

    fn fail(&self, kind: OperationKind, id: u64, message: String, origin: FailureOrigin) {
        let Some(mut session) = self.take_session(kind, id) else {
            debug!(%kind, session = id, ?origin, "ignoring failure for finished session");
            return;
        };

        session.controller.cancel();
        self.notifier.error(&message, Some(FAILURE_TITLE));

        warn!(%kind, session = id, ?origin, error = %message, "operation failed");
        session.resolve(OperationOutcome::Failed { message, origin });
    }

    fn on_presenter_cancel(&self, kind: OperationKind, id: u64) {
        {
            let sessions = self.lock();
            match sessions.active.get(&kind) {
                Some(s) if s.id == id && !s.cancellable => {
                    warn!(%kind, session = id, "presenter closed, operation keeps running");
                    return;
                }
                Some(s) if s.id == id => {}
                _ => return,
            }
        }

        if let Some(mut session) = self.take_session(kind, id) {
            info!(%kind, session = id, "operation cancelled by user");
            session.resolve(OperationOutcome::Cancelled);
        }
    }
}

fn running(sessions: &mut Sessions, kind: OperationKind, id: u64) -> Option<&mut Session> {
    sessions
        .active
        .get_mut(&kind)
        .filter(|s| s.id == id && s.phase == OperationState::Running)
}

fn spawn_ramp(inner: Weak<Inner>, kind: OperationKind, id: u64, tick: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if !inner.ramp_tick(kind, id) {
                break;
            }
        }
    })
}

fn title_for(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Restart => "Restarting device",
        OperationKind::FlashFirmware => "Flashing firmware",
    }
}

fn default_success_message(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Restart => "Device restarted",
        OperationKind::FlashFirmware => "Firmware flashed",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::bridge::testing::FakeBridge;
    use crate::operation::{DeviceTarget, FirmwareChannel};
    use crate::presenter::{Callback, NoticeLevel};
    use crate::remote::testing::{FakeRemote, Reply};

    #[derive(Default)]
    struct RecordingController {
        updates: Mutex<Vec<f64>>,
        messages: Mutex<Vec<String>>,
        closed: AtomicBool,
        completed: AtomicBool,
        cancelled: AtomicBool,
        on_complete: Mutex<Option<Callback>>,
        on_cancel: Mutex<Option<Callback>>,
    }

    impl RecordingController {
        fn updates(&self) -> Vec<f64> {
            self.updates.lock().unwrap().clone()
        }

        fn max_update(&self) -> f64 {
            self.updates().into_iter().fold(0.0, f64::max)
        }
    }

    impl PresenterController for RecordingController {
        fn update_progress(&self, value: f64) {
            self.updates.lock().unwrap().push(value.clamp(0.0, 100.0));
        }

        fn set_message(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }

        fn complete(&self) {
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            self.completed.store(true, Ordering::SeqCst);
            let cb = self.on_complete.lock().unwrap().take();
            if let Some(cb) = cb {
                cb();
            }
        }

        fn cancel(&self) {
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            self.cancelled.store(true, Ordering::SeqCst);
            let cb = self.on_cancel.lock().unwrap().take();
            if let Some(cb) = cb {
                cb();
            }
        }
    }

    #[derive(Debug, Clone)]
    struct Opened {
        title: String,
        cancelable: bool,
        initial_progress: f64,
    }

    #[derive(Default)]
    struct RecordingPresenter {
        opened: Mutex<Vec<(Opened, Arc<RecordingController>)>>,
    }

    impl RecordingPresenter {
        fn opened(&self) -> Vec<Opened> {
            self.opened.lock().unwrap().iter().map(|(o, _)| o.clone()).collect()
        }

        fn controller(&self, i: usize) -> Arc<RecordingController> {
            self.opened.lock().unwrap()[i].1.clone()
        }
    }

    impl Presenter for RecordingPresenter {
        fn open(&self, config: PresenterConfig) -> Arc<dyn PresenterController> {
            let controller = Arc::new(RecordingController::default());
            *controller.on_complete.lock().unwrap() = config.on_complete;
            *controller.on_cancel.lock().unwrap() = config.on_cancel;
            self.opened.lock().unwrap().push((
                Opened {
                    title: config.title,
                    cancelable: config.cancelable,
                    initial_progress: config.initial_progress,
                },
                controller.clone(),
            ));
            controller
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<(NoticeLevel, String, String)>>,
    }

    impl RecordingNotifier {
        fn notices(&self) -> Vec<(NoticeLevel, String, String)> {
            self.notices.lock().unwrap().clone()
        }
    }

    impl Notifier for RecordingNotifier {
        fn show(&self, level: NoticeLevel, title: &str, message: &str) {
            self.notices
                .lock()
                .unwrap()
                .push((level, title.to_string(), message.to_string()));
        }
    }

    /// Queries the coordinator from inside `open`.
    #[derive(Default)]
    struct QueryingPresenter {
        coordinator: std::sync::OnceLock<Coordinator>,
        seen: Mutex<Vec<OperationState>>,
        inner: RecordingPresenter,
    }

    impl Presenter for QueryingPresenter {
        fn open(&self, config: PresenterConfig) -> Arc<dyn PresenterController> {
            if let Some(coordinator) = self.coordinator.get() {
                self.seen
                    .lock()
                    .unwrap()
                    .push(coordinator.state(OperationKind::Restart));
            }
            self.inner.open(config)
        }
    }

    struct Harness {
        coordinator: Coordinator,
        remote: Arc<FakeRemote>,
        bridge: Arc<FakeBridge>,
        presenter: Arc<RecordingPresenter>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Harness {
        fn new(reply: Reply) -> Self {
            let remote = Arc::new(FakeRemote::new(reply));
            let bridge = Arc::new(FakeBridge::default());
            let presenter = Arc::new(RecordingPresenter::default());
            let notifier = Arc::new(RecordingNotifier::default());
            let coordinator = Coordinator::new(
                remote.clone(),
                bridge.clone(),
                presenter.clone(),
                notifier.clone(),
                CoordinatorOptions::default(),
            );
            Self {
                coordinator,
                remote,
                bridge,
                presenter,
                notifier,
            }
        }

        fn emit(&self, payload: serde_json::Value) {
            self.bridge.emit(DEVICE_OPERATION_TOPIC, payload);
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn assert_non_decreasing(values: &[f64]) {
        for pair in values.windows(2) {
            assert!(pair[0] <= pair[1], "progress regressed: {values:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flash_stable_face_is_not_cancelable_and_omits_path() {
        let h = Harness::new(Reply::Pending);
        let req = FlashRequest::new(DeviceTarget::Face, FirmwareChannel::Stable);

        let handle = h.coordinator.flash(req).await.unwrap();
        settle().await;

        assert_eq!(handle.kind(), OperationKind::FlashFirmware);
        let opened = h.presenter.opened();
        assert_eq!(opened.len(), 1);
        assert!(!opened[0].cancelable);
        assert_eq!(opened[0].initial_progress, 0.0);
        assert_eq!(opened[0].title, "Flashing firmware");

        let calls = h.remote.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "flash_firmware");
        assert_eq!(
            calls[0].1,
            serde_json::json!({"device_type": "face", "firmware_type": "stable"})
        );
        assert_eq!(
            h.coordinator.state(OperationKind::FlashFirmware),
            OperationState::Running
        );
    }

    #[tokio::test(start_paused = true)]
    async fn custom_flash_without_path_never_reaches_remote() {
        let h = Harness::new(Reply::Accept);
        let req = FlashRequest::new(DeviceTarget::Custom, FirmwareChannel::Custom);

        let err = h.coordinator.flash(req).await.unwrap_err();
        settle().await;

        assert_eq!(
            err,
            OperationError::Validation(ValidationError::MissingFirmwarePath)
        );
        assert_eq!(err.kind(), OperationErrorKind::InvalidRequest);
        assert!(h.presenter.opened().is_empty());
        assert!(h.remote.calls().is_empty());
        assert_eq!(h.bridge.subscribe_calls(), 0);
        assert_eq!(
            h.coordinator.state(OperationKind::FlashFirmware),
            OperationState::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_restart_while_running_is_busy() {
        let h = Harness::new(Reply::Pending);

        let _first = h.coordinator.restart().await.unwrap();
        let err = h.coordinator.restart().await.unwrap_err();
        settle().await;

        assert_eq!(
            err,
            OperationError::Busy {
                kind: OperationKind::Restart
            }
        );
        assert_eq!(h.presenter.opened().len(), 1);
        assert!(h.presenter.opened()[0].cancelable);
        assert_eq!(h.remote.calls().len(), 1);
        assert_eq!(h.remote.calls()[0].0, "restart_device");
    }

    #[tokio::test(start_paused = true)]
    async fn restart_progress_then_success() {
        let h = Harness::new(Reply::Accept);
        let handle = h.coordinator.restart().await.unwrap();

        h.emit(serde_json::json!({"progress": 40, "status": "running", "message": "running command"}));
        settle().await;
        h.emit(serde_json::json!({"progress": 100, "status": "success", "message": "Device restarted!"}));

        let outcome = handle.wait().await;
        assert_eq!(
            outcome,
            OperationOutcome::Succeeded {
                message: "Device restarted!".to_string()
            }
        );

        let controller = h.presenter.controller(0);
        let updates = controller.updates();
        assert_non_decreasing(&updates);
        assert!(updates.contains(&40.0));
        assert_eq!(updates.last(), Some(&100.0));
        assert!(controller.completed.load(Ordering::SeqCst));
        assert!(controller
            .messages
            .lock()
            .unwrap()
            .contains(&"running command".to_string()));

        let notices = h.notifier.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, NoticeLevel::Success);
        assert_eq!(notices[0].1, SUCCESS_TITLE);
        assert_eq!(notices[0].2, "Device restarted!");
        assert_eq!(
            h.coordinator.state(OperationKind::Restart),
            OperationState::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_restart_call_fails_once() {
        let h = Harness::new(Reply::Reject("serial port busy".to_string()));
        let handle = h.coordinator.restart().await.unwrap();

        let outcome = handle.wait().await;
        match outcome {
            OperationOutcome::Failed { message, origin } => {
                assert_eq!(origin, FailureOrigin::Remote);
                assert!(message.contains("serial port busy"), "{message}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let controller = h.presenter.controller(0);
        assert!(controller.cancelled.load(Ordering::SeqCst));
        assert!(!controller.completed.load(Ordering::SeqCst));
        let notices = h.notifier.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, NoticeLevel::Error);
        assert_eq!(
            h.coordinator.state(OperationKind::Restart),
            OperationState::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_call_racing_device_error_notifies_once() {
        let h = Harness::new(Reply::Reject("Device not connected".to_string()));
        let handle = h.coordinator.restart().await.unwrap();
        h.emit(serde_json::json!({
            "progress": 0,
            "status": "error",
            "message": "Device not connected"
        }));

        let outcome = handle.wait().await;
        settle().await;
        settle().await;

        assert!(matches!(outcome, OperationOutcome::Failed { .. }), "{outcome:?}");
        let notices = h.notifier.notices();
        assert_eq!(notices.len(), 1, "{notices:?}");
        assert_eq!(notices[0].0, NoticeLevel::Error);
        assert_eq!(notices[0].1, FAILURE_TITLE);
        assert_eq!(h.remote.calls().len(), 1);
        assert_eq!(
            h.coordinator.state(OperationKind::Restart),
            OperationState::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_terminal_events_notify_once() {
        let h = Harness::new(Reply::Accept);
        let handle = h.coordinator.restart().await.unwrap();

        h.emit(serde_json::json!({"progress": 100, "status": "success"}));
        h.emit(serde_json::json!({"progress": 100, "status": "success"}));
        h.emit(serde_json::json!({"progress": 100, "status": "error", "message": "late"}));

        let outcome = handle.wait().await;
        settle().await;

        assert!(outcome.is_success());
        let notices = h.notifier.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, NoticeLevel::Success);
        assert_eq!(notices[0].2, "Device restarted");
    }

    #[tokio::test(start_paused = true)]
    async fn device_error_closes_without_reaching_full() {
        let h = Harness::new(Reply::Accept);
        let handle = h.coordinator.restart().await.unwrap();

        h.emit(serde_json::json!({"progress": 30, "status": "running"}));
        settle().await;
        h.emit(serde_json::json!({"progress": 100, "status": "error", "message": "exit code 2"}));

        assert_eq!(
            handle.wait().await,
            OperationOutcome::Failed {
                message: "exit code 2".to_string(),
                origin: FailureOrigin::Device,
            }
        );
        let controller = h.presenter.controller(0);
        assert!(controller.max_update() < 100.0);
        assert!(controller.cancelled.load(Ordering::SeqCst));
        assert_eq!(h.notifier.notices().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_ramp_stops_at_85() {
        let h = Harness::new(Reply::Pending);
        let _handle = h.coordinator.restart().await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;

        let controller = h.presenter.controller(0);
        let updates = controller.updates();
        assert_non_decreasing(&updates);
        assert_eq!(controller.max_update(), 85.0);
    }

    #[tokio::test(start_paused = true)]
    async fn flash_ramp_stops_at_95() {
        let h = Harness::new(Reply::Pending);
        let req = FlashRequest::new(DeviceTarget::RightEye, FirmwareChannel::Beta);
        let _handle = h.coordinator.flash(req).await.unwrap();

        tokio::time::sleep(Duration::from_secs(120)).await;

        let controller = h.presenter.controller(0);
        assert_non_decreasing(&controller.updates());
        let max = controller.max_update();
        assert!(max <= 95.0 && max > 94.0, "max={max}");
    }

    #[tokio::test(start_paused = true)]
    async fn user_cancel_is_silent_and_detaches() {
        let h = Harness::new(Reply::Pending);
        let handle = h.coordinator.restart().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let controller = h.presenter.controller(0);
        controller.cancel();
        assert_eq!(handle.wait().await, OperationOutcome::Cancelled);

        let seen = controller.updates().len();
        h.emit(serde_json::json!({"progress": 60, "status": "running"}));
        h.emit(serde_json::json!({"progress": 100, "status": "success"}));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(controller.updates().len(), seen);
        assert!(h.notifier.notices().is_empty());
        assert_eq!(
            h.coordinator.state(OperationKind::Restart),
            OperationState::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_routes_through_presenter() {
        let h = Harness::new(Reply::Pending);
        let handle = h.coordinator.restart().await.unwrap();

        h.coordinator.cancel(OperationKind::Restart).unwrap();

        assert_eq!(handle.wait().await, OperationOutcome::Cancelled);
        assert!(h.presenter.controller(0).cancelled.load(Ordering::SeqCst));
        assert_eq!(
            h.coordinator.cancel(OperationKind::Restart),
            Err(OperationError::NotRunning {
                kind: OperationKind::Restart
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn flash_cannot_be_cancelled() {
        let h = Harness::new(Reply::Pending);
        let req = FlashRequest::new(DeviceTarget::LeftEye, FirmwareChannel::Stable);
        let _handle = h.coordinator.flash(req).await.unwrap();

        let err = h.coordinator.cancel(OperationKind::FlashFirmware).unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::NotCancellable);

        // A presenter closing on its own does not end the flash either.
        h.presenter.controller(0).cancel();
        assert_eq!(
            h.coordinator.state(OperationKind::FlashFirmware),
            OperationState::Running
        );
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_is_shared_across_sessions() {
        let h = Harness::new(Reply::Accept);

        let first = h.coordinator.restart().await.unwrap();
        h.emit(serde_json::json!({"progress": 100, "status": "success"}));
        assert!(first.wait().await.is_success());

        let second = h.coordinator.restart().await.unwrap();
        assert_ne!(second.id(), 0);
        h.emit(serde_json::json!({"progress": 100, "status": "success"}));
        assert!(second.wait().await.is_success());

        assert_eq!(h.bridge.subscribe_calls(), 1);
        assert!(h.bridge.unsubscribed().is_empty());
        assert_eq!(h.presenter.opened().len(), 2);
        assert_eq!(h.notifier.notices().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_failure_fails_session_without_call() {
        let h = Harness::new(Reply::Accept);
        h.bridge.fail_next_subscribe("listener unavailable");

        let handle = h.coordinator.restart().await.unwrap();

        match handle.wait().await {
            OperationOutcome::Failed { origin, .. } => assert_eq!(origin, FailureOrigin::Bridge),
            other => panic!("unexpected outcome: {other:?}"),
        }
        settle().await;
        assert!(h.remote.calls().is_empty());
        assert_eq!(h.notifier.notices().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tagged_event_reaches_only_its_kind() {
        let h = Harness::new(Reply::Pending);
        let restart = h.coordinator.restart().await.unwrap();
        let flash = h
            .coordinator
            .flash(FlashRequest::new(DeviceTarget::Face, FirmwareChannel::Stable))
            .await
            .unwrap();

        h.emit(serde_json::json!({
            "progress": 100,
            "status": "success",
            "kind": "flash_firmware"
        }));

        assert!(flash.wait().await.is_success());
        assert_eq!(
            h.coordinator.state(OperationKind::Restart),
            OperationState::Running
        );
        assert_eq!(h.notifier.notices().len(), 1);

        h.coordinator.cancel(OperationKind::Restart).unwrap();
        assert_eq!(restart.wait().await, OperationOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payload_is_ignored() {
        let h = Harness::new(Reply::Pending);
        let _handle = h.coordinator.restart().await.unwrap();

        h.emit(serde_json::json!({"progress": "lots", "status": "running"}));
        h.emit(serde_json::json!({"status": "done"}));
        settle().await;

        assert_eq!(
            h.coordinator.state(OperationKind::Restart),
            OperationState::Running
        );
        assert!(h.notifier.notices().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn presenter_may_query_state_while_opening() {
        let presenter = Arc::new(QueryingPresenter::default());
        let coordinator = Coordinator::new(
            Arc::new(FakeRemote::new(Reply::Pending)),
            Arc::new(FakeBridge::default()),
            presenter.clone(),
            Arc::new(RecordingNotifier::default()),
            CoordinatorOptions::default(),
        );
        let _ = presenter.coordinator.set(coordinator.clone());

        let _handle = coordinator.restart().await.unwrap();

        assert_eq!(
            *presenter.seen.lock().unwrap(),
            vec![OperationState::Requested]
        );
        assert_eq!(
            coordinator.restart().await.unwrap_err().kind(),
            OperationErrorKind::Busy
        );
        assert_eq!(presenter.inner.opened().len(), 1);
        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_detaches_sessions_and_unsubscribes() {
        let h = Harness::new(Reply::Pending);
        let handle = h.coordinator.restart().await.unwrap();

        h.coordinator.shutdown().await;

        assert_eq!(handle.wait().await, OperationOutcome::Cancelled);
        assert_eq!(h.bridge.unsubscribed().len(), 1);
        assert!(h.notifier.notices().is_empty());
        assert_eq!(
            h.coordinator.state(OperationKind::Restart),
            OperationState::Idle
        );
    }
}
