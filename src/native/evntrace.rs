//! Native API - Event Tracing evntrace header
//!
//! The `evntrace` module is an abstraction layer for the Windows evntrace library. This module act as a
//! internal API that holds all `unsafe` calls to functions exported by the `evntrace` Windows library.
//!
//! Every entry point goes through the [`EtwApi`] trait, so that sessions can be driven either by
//! the real OS ([`NativeEtw`], Windows only) or by any other implementation.
use std::panic::AssertUnwindSafe;

use widestring::U16CStr;
#[cfg(windows)]
use windows::core::{GUID, PCWSTR};
#[cfg(windows)]
use windows::Win32::Foundation::{
    ERROR_ALREADY_EXISTS, ERROR_CANCELLED, ERROR_CTX_CLOSE_PENDING, ERROR_SUCCESS,
    ERROR_WMI_INSTANCE_NOT_FOUND, WIN32_ERROR,
};
#[cfg(windows)]
use windows::Win32::System::Diagnostics::Etw;

use super::etw_types::*;
use crate::guid::Guid;
use crate::trace::CallbackData;

/// Evntrace native module errors
#[derive(Debug)]
pub enum EvntraceNativeError {
    /// Represents an Invalid Handle Error
    InvalidHandle,
    /// Represents an ERROR_ALREADY_EXISTS
    AlreadyExist,
    /// A native call returned a failure code
    NativeCallFailed {
        function: &'static str,
        source: std::io::Error,
    },
}

#[cfg(windows)]
impl EvntraceNativeError {
    pub(crate) fn from_status(function: &'static str, status: WIN32_ERROR) -> Self {
        EvntraceNativeError::NativeCallFailed {
            function,
            source: std::io::Error::from_raw_os_error(status.0 as i32),
        }
    }

    pub(crate) fn last_os_error(function: &'static str) -> Self {
        EvntraceNativeError::NativeCallFailed {
            function,
            source: std::io::Error::last_os_error(),
        }
    }
}

impl std::fmt::Display for EvntraceNativeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvntraceNativeError::InvalidHandle => write!(f, "invalid trace handle"),
            EvntraceNativeError::AlreadyExist => write!(f, "session already exists"),
            EvntraceNativeError::NativeCallFailed { function, source } => {
                write!(f, "{} failed: {}", function, source)
            }
        }
    }
}

impl std::error::Error for EvntraceNativeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EvntraceNativeError::NativeCallFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type EvntraceNativeResult<T> = Result<T, EvntraceNativeError>;

/// The native controller and consumer entry points a session needs
pub trait EtwApi: Send + Sync {
    /// `StartTraceW`. Fails with [`EvntraceNativeError::AlreadyExist`] if a session with the same
    /// name is already running
    fn start_trace(
        &self,
        name: &U16CStr,
        properties: &mut SessionProperties,
    ) -> EvntraceNativeResult<TraceHandle>;

    /// `EnableTraceEx2`
    fn enable_trace(
        &self,
        handle: TraceHandle,
        provider: &Guid,
        control_code: u32,
        level: u8,
        match_any_keyword: u64,
        match_all_keyword: u64,
    ) -> EvntraceNativeResult<()>;

    /// `ControlTraceW`. A session that no longer exists is not an error
    fn control_trace(
        &self,
        handle: TraceHandle,
        name: &U16CStr,
        properties: &mut SessionProperties,
        control_code: ControlValues,
    ) -> EvntraceNativeResult<()>;

    /// `OpenTraceW`. The logfile is modified on output
    fn open_trace(&self, logfile: &mut EVENT_TRACE_LOGFILEW) -> EvntraceNativeResult<TraceHandle>;

    /// `ProcessTrace`
    ///
    /// # Note
    /// This function blocks the current thread until the session is closed, or the buffer
    /// callback asks to stop.
    fn process_trace(&self, handles: &[TraceHandle]) -> EvntraceNativeResult<()>;

    /// `CloseTrace`. A pending close is not an error
    fn close_trace(&self, handle: TraceHandle) -> EvntraceNativeResult<()>;
}

/// Called by `ProcessTrace` for each event
pub(crate) extern "system" fn event_record_callback(p_record: *mut EVENT_RECORD) {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let record_from_ptr = unsafe {
            // Safety: lifetime is valid at least until the end of the callback. A correct lifetime will be attached when we pass the reference to the child function
            EventRecord::from_ptr(p_record)
        };

        if let Some(event_record) = record_from_ptr {
            let p_user_context = event_record.user_context().cast::<CallbackData>();
            let user_context = unsafe {
                // Safety: the context is the `CallbackData` of the session, that outlives the
                // processing of its trace (see `TraceSession::consume`)
                p_user_context.as_ref()
            };
            if let Some(user_context) = user_context {
                user_context.on_event(event_record);
            }
        }
    }));

    if let Err(e) = outcome {
        log::error!("Panic while handling an event: {:?}", e);
    }
}

/// Called by `ProcessTrace` after each delivered buffer. Returning `0` makes it return
pub(crate) extern "system" fn buffer_callback(p_logfile: *mut EVENT_TRACE_LOGFILEW) -> u32 {
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let user_context = unsafe {
            // Safety: Windows hands back the logfile given to `OpenTraceW`, whose context is the
            // `CallbackData` of the session
            p_logfile
                .as_ref()
                .and_then(|logfile| (logfile.Context as *const CallbackData).as_ref())
        };

        match user_context {
            Some(user_context) => user_context.on_buffer(),
            None => true,
        }
    }));

    match outcome {
        Ok(keep_going) => u32::from(keep_going),
        Err(e) => {
            log::error!("Panic while handling a buffer: {:?}", e);
            0
        }
    }
}

/// The actual Windows implementation of [`EtwApi`]
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeEtw;

#[cfg(windows)]
impl NativeEtw {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(windows)]
impl EtwApi for NativeEtw {
    fn start_trace(
        &self,
        name: &U16CStr,
        properties: &mut SessionProperties,
    ) -> EvntraceNativeResult<TraceHandle> {
        let mut handle = Etw::CONTROLTRACE_HANDLE::default();
        let status = unsafe {
            // Safety:
            //  * first argument points to a valid and allocated address (this is an output and will be modified)
            //  * second argument is a valid, null terminated widestring
            //  * third argument is a valid, allocated EVENT_TRACE_PROPERTIES, followed by room for the session name (and will be mutated)
            Etw::StartTraceW(
                &mut handle,
                PCWSTR::from_raw(name.as_ptr()),
                properties.as_mut_ptr().cast::<Etw::EVENT_TRACE_PROPERTIES>(),
            )
        };

        if status == ERROR_ALREADY_EXISTS {
            return Err(EvntraceNativeError::AlreadyExist);
        } else if status != ERROR_SUCCESS {
            return Err(EvntraceNativeError::from_status("StartTraceW", status));
        } else if handle.Value == 0 {
            // Because Microsoft says that
            // > The session handle is 0 if the handle is not valid.
            // (https://learn.microsoft.com/en-us/windows/win32/api/evntrace/nf-evntrace-starttracew)
            return Err(EvntraceNativeError::InvalidHandle);
        }
        Ok(handle.Value)
    }

    fn enable_trace(
        &self,
        handle: TraceHandle,
        provider: &Guid,
        control_code: u32,
        level: u8,
        match_any_keyword: u64,
        match_all_keyword: u64,
    ) -> EvntraceNativeResult<()> {
        let provider = GUID::from(*provider);
        let status = unsafe {
            Etw::EnableTraceEx2(
                Etw::CONTROLTRACE_HANDLE { Value: handle },
                &provider,
                control_code,
                level,
                match_any_keyword,
                match_all_keyword,
                0,
                None,
            )
        };

        match status {
            ERROR_SUCCESS => Ok(()),
            e => Err(EvntraceNativeError::from_status("EnableTraceEx2", e)),
        }
    }

    fn control_trace(
        &self,
        handle: TraceHandle,
        name: &U16CStr,
        properties: &mut SessionProperties,
        control_code: ControlValues,
    ) -> EvntraceNativeResult<()> {
        let status = unsafe {
            // Safety:
            //  * depending on the control code, the `Properties` can be mutated
            //  * the name is only read when `handle` is 0
            Etw::ControlTraceW(
                Etw::CONTROLTRACE_HANDLE { Value: handle },
                PCWSTR::from_raw(name.as_ptr()),
                properties.as_mut_ptr().cast::<Etw::EVENT_TRACE_PROPERTIES>(),
                control_code.into(),
            )
        };

        if status != ERROR_SUCCESS && status != ERROR_WMI_INSTANCE_NOT_FOUND {
            return Err(EvntraceNativeError::from_status("ControlTraceW", status));
        }

        Ok(())
    }

    fn open_trace(&self, logfile: &mut EVENT_TRACE_LOGFILEW) -> EvntraceNativeResult<TraceHandle> {
        let handle = unsafe {
            // This function modifies the data pointed to by logfile.
            //
            // > On success, OpenTrace will update the structure with information from the opened file or session.
            // https://learn.microsoft.com/en-us/windows/win32/api/evntrace/nf-evntrace-opentracea
            Etw::OpenTraceW(logfile)
        };

        if handle.Value == INVALID_PROCESSTRACE_HANDLE {
            return Err(EvntraceNativeError::last_os_error("OpenTraceW"));
        }
        Ok(handle.Value)
    }

    fn process_trace(&self, handles: &[TraceHandle]) -> EvntraceNativeResult<()> {
        if handles.is_empty() {
            return Err(EvntraceNativeError::InvalidHandle);
        }

        let handles: Vec<Etw::PROCESSTRACE_HANDLE> = handles
            .iter()
            .map(|handle| Etw::PROCESSTRACE_HANDLE { Value: *handle })
            .collect();
        let status = unsafe {
            // Safety: the handles come from `OpenTraceW`, and no time window is given
            Etw::ProcessTrace(&handles, None, None)
        };

        // ERROR_CANCELLED is what a buffer callback returning FALSE produces
        if status != ERROR_SUCCESS && status != ERROR_CANCELLED {
            return Err(EvntraceNativeError::from_status("ProcessTrace", status));
        }
        Ok(())
    }

    fn close_trace(&self, handle: TraceHandle) -> EvntraceNativeResult<()> {
        if handle == INVALID_PROCESSTRACE_HANDLE {
            return Err(EvntraceNativeError::InvalidHandle);
        }

        let status = unsafe {
            // Safety: the handle is valid
            Etw::CloseTrace(Etw::PROCESSTRACE_HANDLE { Value: handle })
        };
        if status != ERROR_SUCCESS && status != ERROR_CTX_CLOSE_PENDING {
            return Err(EvntraceNativeError::from_status("CloseTrace", status));
        }

        Ok(())
    }
}
