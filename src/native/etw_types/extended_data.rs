//! A module to handle Extended Data from ETW traces

use std::mem;

use windows::core::GUID;

use crate::guid::Guid;
use crate::native::etw_types::{
    EVENT_HEADER_EXTENDED_DATA_ITEM, EVENT_HEADER_EXT_TYPE_RELATED_ACTIVITYID,
};

/// A wrapper over an [`EVENT_HEADER_EXTENDED_DATA_ITEM`]
#[repr(transparent)]
pub struct EventHeaderExtendedDataItem(EVENT_HEADER_EXTENDED_DATA_ITEM);

/// A safe representation of an ExtendedDataItem
///
/// See <https://docs.microsoft.com/en-us/windows/win32/api/relogger/ns-relogger-event_header_extended_data_item>
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedDataItem {
    /// Unexpected, invalid or not implemented yet
    Unsupported,
    /// Related activity identifier
    RelatedActivityId(Guid),
}

impl EventHeaderExtendedDataItem {
    /// Returns the `ExtType` of this extended data.
    ///
    /// See <https://docs.microsoft.com/en-us/windows/win32/api/relogger/ns-relogger-event_header_extended_data_item> for possible values
    pub fn data_type(&self) -> u16 {
        self.0.ExtType
    }

    /// Returns this extended data as a variant of a Rust enum.
    pub fn to_extended_data_item(&self) -> ExtendedDataItem {
        let data_ptr = self.0.DataPtr as usize as *const u8;
        if data_ptr.is_null() {
            return ExtendedDataItem::Unsupported;
        }

        match self.0.ExtType {
            EVENT_HEADER_EXT_TYPE_RELATED_ACTIVITYID
                if usize::from(self.0.DataSize) >= mem::size_of::<GUID>() =>
            {
                // Safety: Windows guarantees `DataPtr` points to `DataSize` readable bytes
                let guid = unsafe { (data_ptr as *const GUID).read_unaligned() };
                ExtendedDataItem::RelatedActivityId(Guid::from(guid))
            }

            _ => ExtendedDataItem::Unsupported,
        }
    }
}
