#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::mpsc::{RecvTimeoutError, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use widestring::{U16CStr, U16CString};

use ferrisbeat::guid::Guid;
use ferrisbeat::native::etw_types::{
    ControlValues, SessionProperties, TraceHandle, EVENT_CONTROL_CODE_DISABLE_PROVIDER,
    EVENT_CONTROL_CODE_ENABLE_PROVIDER, EVENT_RECORD, EVENT_TRACE_LOGFILEW,
};
use ferrisbeat::native::evntrace::{EtwApi, EvntraceNativeError, EvntraceNativeResult};
use ferrisbeat::sink::{SinkClient, SinkError, Pipeline};
use ferrisbeat::{SessionState, SessionStatus, StructuredRecord};

#[derive(Clone, Debug)]
pub enum TestKind {
    /// Test will pass if a success has been notified in the test duration
    ExpectSuccess,
    /// Test will pass if no failure has been notified in the test duration
    ExpectNoFailure,
}

#[derive(Clone, Debug)] // mpsc channels are clone-able to be shared between threads
pub struct StatusNotifier {
    kind: TestKind,
    tx: mpsc::SyncSender<()>,
}

impl StatusNotifier {
    pub fn notify_success(&self) {
        if let TestKind::ExpectSuccess = self.kind {
            match self.tx.try_send(()) {
                Ok(()) => (),
                Err(TrySendError::Full(_)) => (), // this means we've sent a success signal already, we don't care
                Err(TrySendError::Disconnected(_)) => (), // Receiver disconnected when the test was still running. That's usually expected, since the callback can outlive the function that started the trace
            }
        }
    }

    pub fn notify_failure(&self) {
        if let TestKind::ExpectNoFailure = self.kind {
            match self.tx.try_send(()) {
                Ok(()) => (),
                Err(TrySendError::Full(_)) => (), // this means we've sent a failure signal already, we don't care
                Err(TrySendError::Disconnected(_)) => (),
            }
        }
    }
}

#[derive(Debug)]
pub struct Status {
    notifier: StatusNotifier,
    rx: mpsc::Receiver<()>,
}

impl Status {
    pub fn new(kind: TestKind) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        Self { notifier: StatusNotifier{kind, tx}, rx }
    }

    pub fn notifier(&self) -> StatusNotifier {
        self.notifier.clone()
    }

    pub fn assert_passed(&self) {
        let timeout = Duration::from_secs(10);

        match self.notifier.kind {
            TestKind::ExpectSuccess => {
                match self.rx.recv_timeout(timeout) {
                    Ok(()) => (),
                    Err(RecvTimeoutError::Timeout) => {
                        panic!("Test did not pass within the allowed timeout");
                    },
                    _ => panic!("Should not happen, the sending end has not hung up."),
                }
            },

            TestKind::ExpectNoFailure => {
                match self.rx.recv_timeout(timeout) {
                    Ok(()) => {
                        panic!("Test failed within the allowed timeout");
                    },
                    Err(RecvTimeoutError::Timeout) => (),
                    _ => panic!("Should not happen, the sending end has not hung up."),
                }
            }
        }
    }
}

/// Poll `status` until it reaches `state`
pub fn wait_for_state(status: &SessionStatus, state: SessionState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while status.state() != state {
        if Instant::now() > deadline {
            panic!("Session did not reach {:?} in time (history: {:?})", state, status.history());
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}


/// A pipeline that forwards records, and notifies a success for every record of `session`
pub struct NotifyingPipeline {
    session: String,
    notifier: StatusNotifier,
    records: mpsc::Sender<StructuredRecord>,
}

impl NotifyingPipeline {
    pub fn new(session: &str, notifier: StatusNotifier) -> (Self, mpsc::Receiver<StructuredRecord>) {
        let (records, rx) = mpsc::channel();
        (Self { session: session.to_string(), notifier, records }, rx)
    }
}

struct NotifyingClient {
    session: String,
    notifier: StatusNotifier,
    records: Mutex<mpsc::Sender<StructuredRecord>>,
    closed: std::sync::atomic::AtomicBool,
}

impl Pipeline for NotifyingPipeline {
    fn connect(&self) -> Result<Arc<dyn SinkClient>, SinkError> {
        Ok(Arc::new(NotifyingClient {
            session: self.session.clone(),
            notifier: self.notifier.clone(),
            records: Mutex::new(self.records.clone()),
            closed: Default::default(),
        }))
    }
}

impl SinkClient for NotifyingClient {
    fn publish(&self, record: StructuredRecord) -> Result<(), SinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SinkError::Closed);
        }
        if record.session == self.session {
            self.notifier.notify_success();
        } else {
            self.notifier.notify_failure();
        }
        // The test may have stopped listening, that's fine
        let _ = self.records.lock().unwrap().send(record);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A pipeline that never connects
pub struct UnreachablePipeline;

impl Pipeline for UnreachablePipeline {
    fn connect(&self) -> Result<Arc<dyn SinkClient>, SinkError> {
        Err(SinkError::ConnectFailed("connection refused".into()))
    }
}


/// A native call received by [`FakeEtw`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Start { name: String, buffer_size: u32, logger_name_offset: u32 },
    Enable { handle: TraceHandle, provider: Guid, control_code: u32, level: u8, any: u64, all: u64 },
    Control { handle: TraceHandle, name: String, control: ControlValues },
    Open { name: String, process_trace_mode: u32 },
    Process { handles: Vec<TraceHandle> },
    /// `during_processing` tells whether `ProcessTrace` had not returned yet
    Close { handle: TraceHandle, during_processing: bool },
}

struct StoredLogfile(EVENT_TRACE_LOGFILEW);

// Safety: the logfile only holds pointers to the session's `CallbackData`, which outlives the
// processing, and to a logger name that is not read after `open_trace`
unsafe impl Send for StoredLogfile {}

struct Consumer {
    name: String,
    logfile: StoredLogfile,
    closed: bool,
    processing: bool,
}

/// One iteration of `process_trace`
struct Step {
    logfile: StoredLogfile,
    provider: Option<Guid>,
    /// Whether the buffer callback can end the processing
    stoppable: bool,
}

#[derive(Default)]
struct FakeState {
    /// Session name -> control handle
    running: HashMap<String, TraceHandle>,
    /// Control handle -> enabled provider
    enabled: HashMap<TraceHandle, Guid>,
    /// Processing handle -> consumer
    consumers: HashMap<TraceHandle, Consumer>,
    failing_enable: HashSet<String>,
    failing_open: HashSet<String>,
    /// Sessions whose processing only returns once its consumer handle is closed
    deaf_to_stop: HashSet<String>,
    /// Sessions whose processing ignores both stop and close, until released
    stuck: HashSet<String>,
    calls: Vec<Call>,
}

/// An in-memory ETW
///
/// Sessions exist for as long as they are not stopped. Processing a trace emits a synthetic event
/// for the enabled provider every few milliseconds, through the callbacks of the logfile, until
/// the session is stopped, the consumer handle is closed, or the buffer callback says to stop.
/// [`FakeEtw::keep_processing_after_stop`] and [`FakeEtw::stick_processing`] relax the first two.
#[derive(Default)]
pub struct FakeEtw {
    state: Mutex<FakeState>,
    next_handle: AtomicU64,
}

pub const ACCESS_DENIED: i32 = 5;

impl FakeEtw {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Default::default(),
            next_handle: AtomicU64::new(0x1000),
        })
    }

    /// Make `EnableTraceEx2` fail on the session named `name`
    pub fn fail_enable_for(&self, name: &str) {
        self.state.lock().unwrap().failing_enable.insert(name.to_string());
    }

    /// Make `OpenTraceW` fail on the session named `name`
    pub fn fail_open_for(&self, name: &str) {
        self.state.lock().unwrap().failing_open.insert(name.to_string());
    }

    /// Keep processing the session named `name` after it is stopped, until its consumer is closed
    pub fn keep_processing_after_stop(&self, name: &str) {
        self.state.lock().unwrap().deaf_to_stop.insert(name.to_string());
    }

    /// Keep processing the session named `name` whatever happens, until [`FakeEtw::release`]
    pub fn stick_processing(&self, name: &str) {
        self.state.lock().unwrap().stuck.insert(name.to_string());
    }

    pub fn release(&self, name: &str) {
        self.state.lock().unwrap().stuck.remove(name);
    }

    /// Simulate a session left running by a previous run
    pub fn leftover_session(&self, name: &str) -> TraceHandle {
        let handle = self.new_handle();
        self.state.lock().unwrap().running.insert(name.to_string(), handle);
        handle
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state.lock().unwrap().running.contains_key(name)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn enable_calls(&self) -> Vec<Call> {
        self.calls().into_iter().filter(|call| matches!(call, Call::Enable { .. })).collect()
    }

    fn new_handle(&self) -> TraceHandle {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    fn failure(function: &'static str, code: i32) -> EvntraceNativeError {
        EvntraceNativeError::NativeCallFailed {
            function,
            source: std::io::Error::from_raw_os_error(code),
        }
    }

    /// What the next iteration of `process_trace` should do
    fn next_step(&self, handle: TraceHandle) -> Option<Step> {
        let state = self.state.lock().unwrap();
        let consumer = state.consumers.get(&handle)?;
        let stuck = state.stuck.contains(&consumer.name);
        let deaf = stuck || state.deaf_to_stop.contains(&consumer.name);
        if consumer.closed && !stuck {
            return None;
        }
        let provider = match state.running.get(&consumer.name) {
            Some(control) => state.enabled.get(control).copied(),
            None if deaf => None,
            None => return None,
        };
        Some(Step { logfile: StoredLogfile(consumer.logfile.0), provider, stoppable: !deaf })
    }

    fn set_processing(&self, handle: TraceHandle, processing: bool) {
        if let Some(consumer) = self.state.lock().unwrap().consumers.get_mut(&handle) {
            consumer.processing = processing;
        }
    }
}

impl EtwApi for FakeEtw {
    fn start_trace(&self, name: &U16CStr, properties: &mut SessionProperties) -> EvntraceNativeResult<TraceHandle> {
        let name = name.to_string_lossy();
        let handle = self.new_handle();
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Start {
            name: name.clone(),
            buffer_size: properties.buffer_size(),
            logger_name_offset: properties.logger_name_offset(),
        });

        if state.running.contains_key(&name) {
            return Err(EvntraceNativeError::AlreadyExist);
        }
        state.running.insert(name, handle);
        Ok(handle)
    }

    fn enable_trace(&self, handle: TraceHandle, provider: &Guid, control_code: u32, level: u8, any: u64, all: u64) -> EvntraceNativeResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Enable { handle, provider: *provider, control_code, level, any, all });

        let name = state
            .running
            .iter()
            .find(|(_, h)| **h == handle)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| Self::failure("EnableTraceEx2", 87))?;

        match control_code {
            EVENT_CONTROL_CODE_ENABLE_PROVIDER => {
                if state.failing_enable.contains(&name) {
                    return Err(Self::failure("EnableTraceEx2", ACCESS_DENIED));
                }
                state.enabled.insert(handle, *provider);
            }
            EVENT_CONTROL_CODE_DISABLE_PROVIDER => {
                state.enabled.remove(&handle);
            }
            _ => return Err(Self::failure("EnableTraceEx2", 87)),
        }
        Ok(())
    }

    fn control_trace(&self, handle: TraceHandle, name: &U16CStr, properties: &mut SessionProperties, control: ControlValues) -> EvntraceNativeResult<()> {
        let name = name.to_string_lossy();
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Control { handle, name: name.clone(), control });

        let target = if handle == 0 {
            state.running.get(&name).map(|h| (name.clone(), *h))
        } else {
            state
                .running
                .iter()
                .find(|(_, h)| **h == handle)
                .map(|(name, h)| (name.clone(), *h))
        };
        // Like ERROR_WMI_INSTANCE_NOT_FOUND, a missing session is not an error
        let (target_name, target_handle) = match target {
            Some(target) => target,
            None => return Ok(()),
        };

        match control {
            ControlValues::Query => {
                properties.header_mut().Wnode.HistoricalContext = target_handle;
            }
            ControlValues::Stop => {
                state.running.remove(&target_name);
                state.enabled.remove(&target_handle);
            }
            _ => (),
        }
        Ok(())
    }

    fn open_trace(&self, logfile: &mut EVENT_TRACE_LOGFILEW) -> EvntraceNativeResult<TraceHandle> {
        let name = unsafe { U16CStr::from_ptr_str(logfile.LoggerName.0) }.to_string_lossy();
        let process_trace_mode = unsafe { logfile.Anonymous1.ProcessTraceMode };
        let handle = self.new_handle();
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Open { name: name.clone(), process_trace_mode });

        if state.failing_open.contains(&name) || !state.running.contains_key(&name) {
            return Err(Self::failure("OpenTraceW", 4201));
        }
        state.consumers.insert(handle, Consumer { name, logfile: StoredLogfile(*logfile), closed: false, processing: false });
        Ok(handle)
    }

    fn process_trace(&self, handles: &[TraceHandle]) -> EvntraceNativeResult<()> {
        self.state.lock().unwrap().calls.push(Call::Process { handles: handles.to_vec() });
        let handle = *handles.first().ok_or(EvntraceNativeError::InvalidHandle)?;

        self.set_processing(handle, true);
        let mut event_id: u16 = 0;
        // Callbacks are never invoked with the state lock held
        while let Some(Step { mut logfile, provider, stoppable }) = self.next_step(handle) {
            let on_event = unsafe { logfile.0.Anonymous2.EventRecordCallback };
            if let (Some(provider), Some(on_event)) = (provider, on_event) {
                event_id = event_id.wrapping_add(1);
                let mut record = EVENT_RECORD::default();
                record.EventHeader.ProviderId = provider.into();
                record.EventHeader.EventDescriptor.Id = event_id;
                record.EventHeader.EventDescriptor.Level = 4;
                record.EventHeader.ProcessId = std::process::id();
                record.EventHeader.ThreadId = 1;
                record.UserContext = logfile.0.Context;
                unsafe { on_event(&mut record) };
            }

            if let Some(on_buffer) = logfile.0.BufferCallback {
                if unsafe { on_buffer(&mut logfile.0) } == 0 && stoppable {
                    break;
                }
            }

            std::thread::sleep(Duration::from_millis(5));
        }
        self.set_processing(handle, false);
        Ok(())
    }

    fn close_trace(&self, handle: TraceHandle) -> EvntraceNativeResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.consumers.get_mut(&handle) {
            Some(consumer) => {
                consumer.closed = true;
                let during_processing = consumer.processing;
                state.calls.push(Call::Close { handle, during_processing });
                Ok(())
            }
            None => {
                state.calls.push(Call::Close { handle, during_processing: false });
                Err(EvntraceNativeError::InvalidHandle)
            }
        }
    }
}

/// Wide version of `name`, as the fake sees it
pub fn wide(name: &str) -> U16CString {
    U16CString::from_str(name).unwrap()
}
