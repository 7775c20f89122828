//! Basic ETW types
//!
//! The `etw_types` module wraps the evntrace.h and evntcons.h structures of the `windows` crate.
//!
//! The property block handed to `StartTraceW` is the exception: its header is built through
//! [`crate::encoding`], so `WNODE_HEADER` and `EVENT_TRACE_PROPERTIES` are mirrored here. Their
//! layout is checked at compile time against the `windows` definitions.
#![allow(non_snake_case, non_camel_case_types)]

use std::ffi::c_void;
use std::marker::PhantomData;

use widestring::{U16CStr, U16CString};
use windows::core::PWSTR;
use windows::Win32::System::Diagnostics::Etw;

pub use windows::Win32::System::Diagnostics::Etw::{
    EVENT_HEADER_EXTENDED_DATA_ITEM, EVENT_RECORD, EVENT_TRACE_LOGFILEW,
};

use crate::guid::Guid;
use crate::trace::CallbackData;

pub mod event_record;
pub use event_record::EventRecord;

mod extended_data;
pub use extended_data::{EventHeaderExtendedDataItem, ExtendedDataItem};

mod session_properties;
pub use session_properties::{SessionProperties, SessionPropertiesError};

/// Native session and consumer handles (`TRACEHANDLE`)
pub type TraceHandle = u64;

/// Value returned by `OpenTraceW` on failure
pub const INVALID_PROCESSTRACE_HANDLE: TraceHandle = usize::MAX as TraceHandle;

pub const WNODE_FLAG_ALL_DATA: u32 = Etw::WNODE_FLAG_ALL_DATA;

pub const EVENT_TRACE_REAL_TIME_MODE: u32 = Etw::EVENT_TRACE_REAL_TIME_MODE;

pub const EVENT_CONTROL_CODE_DISABLE_PROVIDER: u32 = Etw::EVENT_CONTROL_CODE_DISABLE_PROVIDER.0;
pub const EVENT_CONTROL_CODE_ENABLE_PROVIDER: u32 = Etw::EVENT_CONTROL_CODE_ENABLE_PROVIDER.0;

/// `ExtType` of a related activity id (typed as the `ExtType` field is)
pub const EVENT_HEADER_EXT_TYPE_RELATED_ACTIVITYID: u16 =
    Etw::EVENT_HEADER_EXT_TYPE_RELATED_ACTIVITYID as u16;

/// `ControlTraceW` control codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlValues {
    Query = 0,
    Stop = 1,
    Update = 2,
    Flush = 3,
}

impl From<ControlValues> for Etw::EVENT_TRACE_CONTROL {
    fn from(control: ControlValues) -> Self {
        Etw::EVENT_TRACE_CONTROL(control as u32)
    }
}

bitflags! {
    /// `ProcessTraceMode` member of `EVENT_TRACE_LOGFILEW`
    #[derive(Default)]
    pub struct ProcessTraceMode: u32 {
        const REAL_TIME = Etw::PROCESS_TRACE_MODE_REAL_TIME;
        const RAW_TIMESTAMP = Etw::PROCESS_TRACE_MODE_RAW_TIMESTAMP;
        const EVENT_RECORD = Etw::PROCESS_TRACE_MODE_EVENT_RECORD;
    }
}

crate::encodable_struct! {
    /// [WNODE_HEADER](https://learn.microsoft.com/en-us/windows/win32/etw/wnode-header)
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct WNODE_HEADER {
        pub BufferSize: u32,
        pub ProviderId: u32,
        /// Union with `Version`/`Linkage`. Holds the session handle after a query
        pub HistoricalContext: u64,
        /// Union with `CountLost`/`KernelHandle`
        pub TimeStamp: i64,
        pub Guid: Guid,
        pub ClientContext: u32,
        pub Flags: u32,
    }
}

crate::encodable_struct! {
    /// [EVENT_TRACE_PROPERTIES](https://learn.microsoft.com/en-us/windows/win32/api/evntrace/ns-evntrace-event_trace_properties)
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct EVENT_TRACE_PROPERTIES {
        pub Wnode: WNODE_HEADER,
        pub BufferSize: u32,
        pub MinimumBuffers: u32,
        pub MaximumBuffers: u32,
        pub MaximumFileSize: u32,
        pub LogFileMode: u32,
        pub FlushTimer: u32,
        pub EnableFlags: u32,
        pub AgeLimit: i32,
        pub NumberOfBuffers: u32,
        pub FreeBuffers: u32,
        pub EventsLost: u32,
        pub BuffersWritten: u32,
        pub LogBuffersLost: u32,
        pub RealTimeBuffersLost: u32,
        /// A `HANDLE`
        pub LoggerThreadId: usize,
        pub LogFileNameOffset: u32,
        pub LoggerNameOffset: u32,
    }
}

const _: () = {
    use std::mem::size_of;

    assert!(size_of::<Guid>() == size_of::<windows::core::GUID>());
    assert!(size_of::<WNODE_HEADER>() == size_of::<Etw::WNODE_HEADER>());
    assert!(size_of::<EVENT_TRACE_PROPERTIES>() == size_of::<Etw::EVENT_TRACE_PROPERTIES>());
};

/// Wrapper over an [`EVENT_TRACE_LOGFILEW`]
///
/// Its lifetime is tied a to [`CallbackData`] because it contains raw pointers to it.
pub struct TraceLogfile<'callbackdata> {
    native: EVENT_TRACE_LOGFILEW,
    wide_logger_name: U16CString,
    lifetime: PhantomData<&'callbackdata CallbackData>,
}

impl<'callbackdata> TraceLogfile<'callbackdata> {
    /// Create a real-time logfile descriptor for the session named `logger_name`
    pub fn create(
        callback_data: &'callbackdata CallbackData,
        logger_name: &U16CStr,
        buffer_callback: unsafe extern "system" fn(*mut EVENT_TRACE_LOGFILEW) -> u32,
        event_callback: unsafe extern "system" fn(*mut EVENT_RECORD),
    ) -> Self {
        let mut wide_logger_name = logger_name.to_ucstring();
        let mut native = EVENT_TRACE_LOGFILEW::default();

        native.LoggerName = PWSTR(wide_logger_name.as_mut_ptr());
        native.Anonymous1.ProcessTraceMode = (ProcessTraceMode::REAL_TIME
            | ProcessTraceMode::RAW_TIMESTAMP
            | ProcessTraceMode::EVENT_RECORD)
            .bits();
        native.BufferCallback = Some(buffer_callback);
        native.Anonymous2.EventRecordCallback = Some(event_callback);

        // The user context is not supposed to be written by Windows APIs
        native.Context = callback_data as *const CallbackData as *mut c_void;

        Self {
            native,
            wide_logger_name,
            lifetime: PhantomData,
        }
    }

    pub fn logger_name(&self) -> &U16CStr {
        &self.wide_logger_name
    }

    pub fn process_trace_mode(&self) -> ProcessTraceMode {
        // Safety: both members of the union are plain `u32`s
        let mode = unsafe { self.native.Anonymous1.ProcessTraceMode };
        ProcessTraceMode::from_bits_truncate(mode)
    }

    /// Retrieve the wrapped `EVENT_TRACE_LOGFILEW`
    ///
    /// `OpenTraceW` **will** modify its content on output.
    pub(crate) fn native_mut(&mut self) -> &mut EVENT_TRACE_LOGFILEW {
        &mut self.native
    }
}
