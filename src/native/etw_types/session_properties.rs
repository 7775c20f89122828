//! The variable-length property block that identifies a real-time session
use std::alloc::Layout;
use std::fmt;
use std::mem;
use std::ptr::NonNull;

use widestring::U16CStr;

use crate::encoding::{self, ByteOrder, Encode, EncodeError};
use crate::guid::{Guid, GuidError};
use crate::native::etw_types::{
    EVENT_TRACE_PROPERTIES, EVENT_TRACE_REAL_TIME_MODE, WNODE_FLAG_ALL_DATA, WNODE_HEADER,
};

/// `Wnode.ClientContext` value selecting query performance counter timestamps
pub const CLIENT_CONTEXT_QPC: u32 = 1;

const HEADER_SIZE: usize = mem::size_of::<EVENT_TRACE_PROPERTIES>();

/// Session properties errors
#[derive(Debug)]
pub enum SessionPropertiesError {
    /// No session GUID could be generated
    SessionGuid(GuidError),
    /// The header could not be encoded
    Encoding(EncodeError),
    /// The session name does not fit in a property block
    NameTooLong(usize),
}

impl fmt::Display for SessionPropertiesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPropertiesError::SessionGuid(err) => write!(f, "session guid: {}", err),
            SessionPropertiesError::Encoding(err) => write!(f, "session properties: {}", err),
            SessionPropertiesError::NameTooLong(len) => {
                write!(f, "session name of {} UTF-16 units is too long", len)
            }
        }
    }
}

impl std::error::Error for SessionPropertiesError {}

impl From<GuidError> for SessionPropertiesError {
    fn from(err: GuidError) -> Self {
        SessionPropertiesError::SessionGuid(err)
    }
}

impl From<EncodeError> for SessionPropertiesError {
    fn from(err: EncodeError) -> Self {
        SessionPropertiesError::Encoding(err)
    }
}

/// An owned [`EVENT_TRACE_PROPERTIES`], immediately followed by the session name
///
/// The block is allocated once and never moves, so that pointers Windows keeps into it stay valid
/// for as long as this value lives.
pub struct SessionProperties {
    data: NonNull<u8>,
    layout: Layout,
}

// Safety: the block is exclusively owned, and only ever accessed through `&self`/`&mut self`
unsafe impl Send for SessionProperties {}

impl SessionProperties {
    /// Build the property block of a real-time session named `name`
    ///
    /// The block is `size_of::<EVENT_TRACE_PROPERTIES>() + (name.len() + 1) * 2` bytes long, and
    /// carries a fresh random session GUID.
    pub fn build(name: &U16CStr) -> Result<Self, SessionPropertiesError> {
        let name_units = name.as_slice_with_nul();
        let total_size = name_units
            .len()
            .checked_mul(mem::size_of::<u16>())
            .and_then(|name_size| name_size.checked_add(HEADER_SIZE))
            .filter(|size| u32::try_from(*size).is_ok())
            .ok_or(SessionPropertiesError::NameTooLong(name.len()))?;

        let header = EVENT_TRACE_PROPERTIES {
            Wnode: WNODE_HEADER {
                BufferSize: total_size as u32,
                Guid: Guid::random()?,
                ClientContext: CLIENT_CONTEXT_QPC,
                Flags: WNODE_FLAG_ALL_DATA,
                ..Default::default()
            },
            LogFileMode: EVENT_TRACE_REAL_TIME_MODE,
            // > If you do not want to log events to a log file (for example, if you specify EVENT_TRACE_REAL_TIME_MODE only), set LogFileNameOffset to 0.
            // (https://learn.microsoft.com/en-us/windows/win32/api/evntrace/ns-evntrace-event_trace_properties)
            LogFileNameOffset: 0,
            LoggerNameOffset: HEADER_SIZE as u32,
            ..Default::default()
        };
        let encoded_header = encode_native(&header)?;

        let layout = Layout::from_size_align(total_size, mem::align_of::<EVENT_TRACE_PROPERTIES>())
            .map_err(|_| SessionPropertiesError::NameTooLong(name.len()))?;
        let data = unsafe {
            // Safety: layout size is not zero, since it includes the header
            std::alloc::alloc_zeroed(layout)
        };
        let data = match NonNull::new(data) {
            Some(data) => data,
            None => std::alloc::handle_alloc_error(layout),
        };

        unsafe {
            // Safety:
            //  * the allocation is `total_size` bytes, that is the header plus the name and its terminator
            //  * sources are distinct allocations
            std::ptr::copy_nonoverlapping(
                encoded_header.as_ptr(),
                data.as_ptr(),
                HEADER_SIZE,
            );
            std::ptr::copy_nonoverlapping(
                name_units.as_ptr() as *const u8,
                data.as_ptr().add(HEADER_SIZE),
                name_units.len() * mem::size_of::<u16>(),
            );
        }

        Ok(Self { data, layout })
    }

    /// Gets a pointer to the wrapped [`EVENT_TRACE_PROPERTIES`]
    ///
    /// The pointed block is `buffer_size()` bytes long. Note that `StartTraceW` and `ControlTraceW`
    /// **will** modify its content on output.
    pub fn as_mut_ptr(&mut self) -> *mut EVENT_TRACE_PROPERTIES {
        self.data.as_ptr() as *mut EVENT_TRACE_PROPERTIES
    }

    pub fn header(&self) -> &EVENT_TRACE_PROPERTIES {
        // Safety: the block starts with an initialized, suitably aligned header
        unsafe { &*(self.data.as_ptr() as *const EVENT_TRACE_PROPERTIES) }
    }

    pub fn header_mut(&mut self) -> &mut EVENT_TRACE_PROPERTIES {
        // Safety: see `header`, and `&mut self` guarantees exclusivity
        unsafe { &mut *self.as_mut_ptr() }
    }

    /// Size of the whole block, as allocated
    pub fn allocated_size(&self) -> usize {
        self.layout.size()
    }

    /// The `Wnode.BufferSize` field
    pub fn buffer_size(&self) -> u32 {
        self.header().Wnode.BufferSize
    }

    pub fn logger_name_offset(&self) -> u32 {
        self.header().LoggerNameOffset
    }

    pub fn log_file_name_offset(&self) -> u32 {
        self.header().LogFileNameOffset
    }

    pub fn session_guid(&self) -> Guid {
        self.header().Wnode.Guid
    }

    pub fn client_context(&self) -> u32 {
        self.header().Wnode.ClientContext
    }

    /// The `Wnode.HistoricalContext` field
    ///
    /// After a successful `EVENT_TRACE_CONTROL_QUERY`, this holds the handle of the running session.
    pub fn historical_context(&self) -> u64 {
        self.header().Wnode.HistoricalContext
    }

    /// The session name, as stored after the header
    pub fn logger_name(&self) -> Option<&U16CStr> {
        let offset = self.logger_name_offset() as usize;
        if offset < HEADER_SIZE || offset >= self.layout.size() || offset % 2 != 0 {
            return None;
        }
        let units = unsafe {
            // Safety: `offset` lies in the allocation and is 2-byte aligned
            std::slice::from_raw_parts(
                self.data.as_ptr().add(offset) as *const u16,
                (self.layout.size() - offset) / mem::size_of::<u16>(),
            )
        };
        U16CStr::from_slice_truncate(units).ok()
    }

    /// The raw block
    pub fn as_bytes(&self) -> &[u8] {
        // Safety: the whole allocation is initialized (zeroed, then written)
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.layout.size()) }
    }
}

/// Encode `value` as it lies in native memory
///
/// Fields are written back to back, so the encoding lacks the trailing padding of `T` (e.g. the
/// last 4 bytes of `EVENT_TRACE_PROPERTIES` on 32-bit targets). It is zero-filled up to
/// `size_of::<T>()`.
fn encode_native<T: Encode>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let mut encoded = encoding::encode(Some(value), ByteOrder::NATIVE)?;
    debug_assert!(encoded.len() <= mem::size_of::<T>());
    encoded.resize(mem::size_of::<T>(), 0);
    Ok(encoded)
}

impl Drop for SessionProperties {
    fn drop(&mut self) {
        unsafe {
            // Safety: ptr and layout come from the `alloc_zeroed` call in `build`
            std::alloc::dealloc(self.data.as_ptr(), self.layout);
        }
    }
}

impl fmt::Debug for SessionProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self
            .logger_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();
        f.debug_struct("SessionProperties")
            .field("name", &name)
            .field("buffer_size", &self.buffer_size())
            .field("session_guid", &self.session_guid())
            .finish()
    }
}
