//! ETW Tracing/Session abstraction
//!
//! A [`TraceSession`] drives one real-time session through its whole life:
//!
//! ```text
//! Created -> Started -> Enabled -> Consuming -> Disabling -> Stopped
//! ```
//!
//! Any failure moves it to [`SessionState::Failed`] instead, after the native session it created
//! has been torn down. `ProcessTrace` runs on a dedicated worker thread, while the thread calling
//! [`TraceSession::run`] waits for either the shutdown signal or the end of the processing.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use widestring::U16CString;

use crate::config::{SessionConfig, TraceLevel};
use crate::guid::{Guid, GuidError};
use crate::native::etw_types::{
    ControlValues, SessionProperties, SessionPropertiesError, TraceHandle, TraceLogfile,
    EVENT_CONTROL_CODE_DISABLE_PROVIDER, EVENT_CONTROL_CODE_ENABLE_PROVIDER,
};
use crate::native::evntrace::{self, EtwApi, EvntraceNativeError};
use crate::shutdown::ShutdownSignal;
use crate::sink::{Pipeline, SinkError};

mod callback_data;
pub use callback_data::CallbackData;

/// Default time a stopping session waits for `ProcessTrace` to return, before closing it forcibly
///
/// The same delay is granted once more after the forced close.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Keywords matched when none are configured
pub const MATCH_ANY_KEYWORD_ALL: u64 = u64::MAX;

/// Trace module errors
#[derive(Debug)]
pub enum TraceError {
    /// A provider id is not a valid GUID
    MalformedIdentifier(GuidError),
    /// The session has no provider to enable
    NoProvider,
    /// The session name cannot be used as a native session name
    InvalidSessionName(String),
    /// The session property block could not be built
    SessionProperties(SessionPropertiesError),
    /// Wrapper over an internal [EvntraceNativeError]
    ///
    /// [EvntraceNativeError]: crate::native::evntrace::EvntraceNativeError
    EtwNativeError(evntrace::EvntraceNativeError),
    /// The sink could not be connected
    SinkConnectFailed(SinkError),
    /// `ProcessTrace` had not returned this long after the session was stopped and closed
    ProcessingTimedOut(Duration),
    /// Wrapper over an standard IO Error
    IoError(std::io::Error),
}

impl std::fmt::Display for TraceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceError::MalformedIdentifier(err) => write!(f, "{}", err),
            TraceError::NoProvider => write!(f, "no provider configured"),
            TraceError::InvalidSessionName(name) => write!(f, "invalid session name {:?}", name),
            TraceError::SessionProperties(err) => write!(f, "{}", err),
            TraceError::EtwNativeError(err) => write!(f, "{}", err),
            TraceError::SinkConnectFailed(err) => write!(f, "{}", err),
            TraceError::ProcessingTimedOut(waited) => {
                write!(f, "processing did not return within {:?} of the stop request", waited)
            }
            TraceError::IoError(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for TraceError {}

impl From<std::io::Error> for TraceError {
    fn from(err: std::io::Error) -> Self {
        TraceError::IoError(err)
    }
}

impl From<evntrace::EvntraceNativeError> for TraceError {
    fn from(err: evntrace::EvntraceNativeError) -> Self {
        TraceError::EtwNativeError(err)
    }
}

impl From<GuidError> for TraceError {
    fn from(err: GuidError) -> Self {
        TraceError::MalformedIdentifier(err)
    }
}

impl From<SessionPropertiesError> for TraceError {
    fn from(err: SessionPropertiesError) -> Self {
        TraceError::SessionProperties(err)
    }
}

type TraceResult<T> = Result<T, TraceError>;

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Enabled,
    Consuming,
    Disabling,
    Stopped,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Failed)
    }
}

#[derive(Debug)]
struct StatusInner {
    history: Mutex<Vec<SessionState>>,
    events_handled: AtomicUsize,
}

/// Observable state of a session
///
/// Clones share the same state. The controller writes it, anyone may read it.
#[derive(Debug, Clone)]
pub struct SessionStatus {
    inner: Arc<StatusInner>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            inner: Arc::new(StatusInner {
                history: Mutex::new(vec![SessionState::Created]),
                events_handled: AtomicUsize::new(0),
            }),
        }
    }
}

impl SessionStatus {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn state(&self) -> SessionState {
        self.lock_history()
            .last()
            .copied()
            .unwrap_or(SessionState::Created)
    }

    /// Every state this session went through, in order
    pub fn history(&self) -> Vec<SessionState> {
        self.lock_history().clone()
    }

    /// How many events have been published so far
    pub fn events_handled(&self) -> usize {
        self.inner.events_handled.load(Ordering::Relaxed)
    }

    pub(crate) fn record_event(&self) {
        self.inner.events_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn transition(&self, to: SessionState) {
        let mut history = self.lock_history();
        let from = history.last().copied();
        if from.map_or(false, |from| from.is_terminal()) {
            log::debug!("Ignoring transition {:?} -> {:?}", from, to);
            return;
        }
        log::debug!("Session state {:?} -> {:?}", from, to);
        history.push(to);
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, Vec<SessionState>> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Native session handle, as returned by `StartTraceW`
#[derive(Debug, PartialEq, Eq)]
pub struct ControlHandle(TraceHandle);

impl ControlHandle {
    pub fn raw(&self) -> TraceHandle {
        self.0
    }
}

/// Native consumer handle, as returned by `OpenTraceW`
#[derive(Debug, PartialEq, Eq)]
pub struct ProcessingHandle(TraceHandle);

impl ProcessingHandle {
    pub fn raw(&self) -> TraceHandle {
        self.0
    }
}

enum SessionEvent {
    Shutdown,
    ProcessingEnded(Result<(), EvntraceNativeError>),
}

/// One real-time session, from creation to stop
pub struct TraceSession {
    name: String,
    wide_name: U16CString,
    provider: Guid,
    level: TraceLevel,
    match_any_keyword: u64,
    match_all_keyword: u64,
    api: Arc<dyn EtwApi>,
    status: SessionStatus,
    stop_timeout: Duration,
    control_handle: Option<ControlHandle>,
    properties: Option<SessionProperties>,
}

impl TraceSession {
    /// Prepare a session from its configuration
    ///
    /// Only the first provider id is enabled. Others are ignored (with a warning).
    pub fn from_config(
        config: &SessionConfig,
        api: Arc<dyn EtwApi>,
        status: SessionStatus,
    ) -> TraceResult<Self> {
        if config.name.is_empty() {
            return Err(TraceError::InvalidSessionName(config.name.clone()));
        }
        let wide_name = U16CString::from_str(&config.name)
            .map_err(|_| TraceError::InvalidSessionName(config.name.clone()))?;

        let provider_id = config.provider_ids.first().ok_or(TraceError::NoProvider)?;
        let provider = Guid::parse(provider_id)?;
        if config.provider_ids.len() > 1 {
            log::warn!(
                "Session {}: only provider {} is enabled, {} other(s) ignored",
                config.name,
                provider,
                config.provider_ids.len() - 1
            );
        }

        Ok(Self {
            name: config.name.clone(),
            wide_name,
            provider,
            level: config.level(),
            match_any_keyword: config.match_any_keyword.unwrap_or(MATCH_ANY_KEYWORD_ALL),
            match_all_keyword: config.match_all_keyword.unwrap_or(0),
            api,
            status,
            stop_timeout: STOP_TIMEOUT,
            control_handle: None,
            properties: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provider(&self) -> Guid {
        self.provider
    }

    pub fn level(&self) -> TraceLevel {
        self.level
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// How long to wait for `ProcessTrace` to return once stopped (see [`STOP_TIMEOUT`])
    pub fn set_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Run the session until `shutdown` fires, or until processing ends on its own
    ///
    /// This blocks the current thread. Every native resource the session acquired is released
    /// when this returns, whatever the outcome.
    pub fn run(mut self, pipeline: &dyn Pipeline, shutdown: &ShutdownSignal) -> TraceResult<()> {
        let client = match pipeline.connect() {
            Ok(client) => client,
            Err(err) => {
                self.status.transition(SessionState::Failed);
                return Err(TraceError::SinkConnectFailed(err));
            }
        };

        if let Err(err) = self.start() {
            self.status.transition(SessionState::Failed);
            client.close();
            return Err(err);
        }

        if let Err(err) = self.enable() {
            self.stop(false);
            self.status.transition(SessionState::Failed);
            client.close();
            return Err(err);
        }

        let callback_data = Arc::new(CallbackData::new(
            self.name.clone(),
            self.status.clone(),
            Arc::clone(&client),
        ));
        let processed = self.consume(&callback_data, shutdown, &|| client.close());

        match processed {
            Ok(()) => {
                self.status.transition(SessionState::Stopped);
                log::info!(
                    "Session {} stopped after {} event(s)",
                    self.name,
                    callback_data.events_handled()
                );
                Ok(())
            }
            Err(err) => {
                self.status.transition(SessionState::Failed);
                Err(err)
            }
        }
    }

    /// `Created -> Started`
    ///
    /// A session left over with the same name is reused: its handle is recovered with a query.
    fn start(&mut self) -> TraceResult<()> {
        let mut properties = SessionProperties::build(&self.wide_name)?;

        let handle = match self.api.start_trace(&self.wide_name, &mut properties) {
            Ok(handle) => {
                log::info!("Session {} started", self.name);
                handle
            }
            Err(EvntraceNativeError::AlreadyExist) => {
                self.api
                    .control_trace(0, &self.wide_name, &mut properties, ControlValues::Query)?;
                log::info!("Session {} already exists, reusing it", self.name);
                properties.historical_context()
            }
            Err(err) => {
                log::error!("Session {}: unable to start: {}", self.name, err);
                return Err(err.into());
            }
        };

        if handle == 0 {
            return Err(EvntraceNativeError::InvalidHandle.into());
        }

        self.control_handle = Some(ControlHandle(handle));
        self.properties = Some(properties);
        self.status.transition(SessionState::Started);
        Ok(())
    }

    /// `Started -> Enabled`
    fn enable(&mut self) -> TraceResult<()> {
        let handle = self
            .control_handle
            .as_ref()
            .ok_or(EvntraceNativeError::InvalidHandle)?;

        if let Err(err) = self.api.enable_trace(
            handle.raw(),
            &self.provider,
            EVENT_CONTROL_CODE_ENABLE_PROVIDER,
            self.level.into(),
            self.match_any_keyword,
            self.match_all_keyword,
        ) {
            log::error!(
                "Session {}: unable to enable provider {}: {}",
                self.name,
                self.provider,
                err
            );
            return Err(err.into());
        }

        self.status.transition(SessionState::Enabled);
        Ok(())
    }

    /// `Enabled -> Consuming -> Disabling`
    ///
    /// Returns once `ProcessTrace` has returned (or has been given up on) and the consumer handle
    /// is closed.
    fn consume(
        &mut self,
        callback_data: &Arc<CallbackData>,
        shutdown: &ShutdownSignal,
        close_sink: &dyn Fn(),
    ) -> TraceResult<()> {
        let mut logfile = TraceLogfile::create(
            callback_data,
            &self.wide_name,
            evntrace::buffer_callback,
            evntrace::event_record_callback,
        );

        let processing = match self.api.open_trace(logfile.native_mut()) {
            Ok(handle) => ProcessingHandle(handle),
            Err(err) => {
                log::error!("Session {}: unable to open trace: {}", self.name, err);
                close_sink();
                self.stop(true);
                return Err(err.into());
            }
        };

        let (tx, rx) = mpsc::channel();
        let worker = {
            let api = Arc::clone(&self.api);
            // The worker keeps the callback data alive for as long as ProcessTrace may call back
            let callback_data = Arc::clone(callback_data);
            let tx = tx.clone();
            let handle = processing.raw();

            std::thread::Builder::new()
                .name(format!("etw-{}", self.name))
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        api.process_trace(&[handle])
                    }))
                    .unwrap_or_else(|_| {
                        Err(EvntraceNativeError::NativeCallFailed {
                            function: "ProcessTrace",
                            source: std::io::Error::new(
                                std::io::ErrorKind::Other,
                                "processing panicked",
                            ),
                        })
                    });
                    drop(callback_data);
                    let _ = tx.send(SessionEvent::ProcessingEnded(result));
                })
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(err) => {
                close_sink();
                self.stop(true);
                self.close_processing(processing);
                return Err(err.into());
            }
        };

        self.status.transition(SessionState::Consuming);
        log::info!("Session {} consuming events from {}", self.name, self.provider);

        shutdown.on_trigger(move || {
            let _ = tx.send(SessionEvent::Shutdown);
        });

        let ended_early = match rx.recv() {
            Ok(SessionEvent::ProcessingEnded(result)) => Some(result),
            Ok(SessionEvent::Shutdown) => None,
            // Both senders are gone: the worker has ended without a word
            Err(_) => Some(Ok(())),
        };
        if ended_early.is_some() {
            log::info!("Session {}: processing ended on its own", self.name);
        }

        close_sink();
        self.status.transition(SessionState::Disabling);
        self.stop(true);

        let result = match ended_early {
            Some(result) => {
                let _ = worker.join();
                self.close_processing(processing);
                result.map_err(TraceError::from)
            }
            None => match wait_for_processing(&rx, self.stop_timeout) {
                Some(result) => {
                    let _ = worker.join();
                    self.close_processing(processing);
                    result.map_err(TraceError::from)
                }
                None => {
                    log::warn!(
                        "Session {}: processing still running after {:?}, closing it",
                        self.name,
                        self.stop_timeout
                    );
                    self.close_processing(processing);
                    match wait_for_processing(&rx, self.stop_timeout) {
                        Some(result) => {
                            let _ = worker.join();
                            result.map_err(TraceError::from)
                        }
                        None => {
                            // The worker may still be inside ProcessTrace, which can reach the logfile
                            std::mem::forget(logfile);
                            return Err(self.processing_timed_out());
                        }
                    }
                }
            },
        };

        // The logfile must stay alive for as long as its consumer handle is open
        drop(logfile);

        result.map_err(|err| {
            log::error!("Session {}: processing failed: {}", self.name, err);
            err
        })
    }

    fn processing_timed_out(&self) -> TraceError {
        let waited = self.stop_timeout * 2;
        log::error!(
            "Session {}: processing thread did not return within {:?}, giving up on it",
            self.name,
            waited
        );
        TraceError::ProcessingTimedOut(waited)
    }

    /// Stop the native session (and disable the provider first if it was enabled)
    ///
    /// Errors are logged, never retried.
    fn stop(&mut self, disable_provider: bool) {
        let handle = match self.control_handle.take() {
            Some(handle) => handle,
            None => return,
        };

        if let Some(properties) = self.properties.as_mut() {
            if let Err(err) =
                self.api
                    .control_trace(handle.raw(), &self.wide_name, properties, ControlValues::Stop)
            {
                log::warn!("Session {}: unable to stop: {}", self.name, err);
            }
        }

        if disable_provider {
            if let Err(err) = self.api.enable_trace(
                handle.raw(),
                &self.provider,
                EVENT_CONTROL_CODE_DISABLE_PROVIDER,
                self.level.into(),
                0,
                0,
            ) {
                log::warn!("Session {}: unable to disable provider: {}", self.name, err);
            }
        }

        // The property block may only go once the session it describes is gone
        self.properties = None;
    }

    fn close_processing(&self, handle: ProcessingHandle) {
        if let Err(err) = self.api.close_trace(handle.raw()) {
            log::warn!("Session {}: unable to close trace: {}", self.name, err);
        }
    }
}

impl std::fmt::Debug for TraceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceSession")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("level", &self.level)
            .field("state", &self.status.state())
            .finish()
    }
}

/// Wait for the worker to report the end of `ProcessTrace`
fn wait_for_processing(
    rx: &mpsc::Receiver<SessionEvent>,
    timeout: Duration,
) -> Option<Result<(), EvntraceNativeError>> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(SessionEvent::ProcessingEnded(result)) => return Some(result),
            Ok(SessionEvent::Shutdown) => continue,
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => return Some(Ok(())),
        }
    }
}
