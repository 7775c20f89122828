//! Turns an [`EventRecord`] into an owned [`StructuredRecord`]
//!
//! Decoding copies everything out of the native record, so that nothing refers to ETW memory once
//! the callback returns. It never fails: fields are passed through as their raw numeric values,
//! whether or not they mean anything.
use crate::config::TraceLevel;
use crate::native::etw_types::EventRecord;
use crate::timestamp::Timestamp;

/// One decoded event, ready to be published
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StructuredRecord {
    /// Canonical text form of the provider GUID
    pub provider_id: String,
    pub process_id: u32,
    pub thread_id: u32,
    pub event_id: u16,
    pub version: u8,
    pub channel: u8,
    pub level: u8,
    pub op_code: u8,
    pub task: u16,
    pub keyword: u64,
    /// Canonical text form of the activity GUID
    pub activity_id: String,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub related_activity_id: Option<String>,
    /// The native timestamp, as a raw performance counter value
    pub raw_timestamp: i64,
    /// Name of the session the event was received on
    pub session: String,
    /// When the event was decoded
    pub created: Timestamp,
}

impl StructuredRecord {
    /// The name of `level`, if it is a well-known one
    pub fn level_name(&self) -> Option<&'static str> {
        TraceLevel::from_raw(self.level).map(|level| level.name())
    }
}

/// Decode `record`, received on the session named `session`
pub fn decode(record: &EventRecord, session: &str) -> StructuredRecord {
    StructuredRecord {
        provider_id: record.provider_id().to_string(),
        process_id: record.process_id(),
        thread_id: record.thread_id(),
        event_id: record.event_id(),
        version: record.version(),
        channel: record.channel(),
        level: record.level(),
        op_code: record.opcode(),
        task: record.task(),
        keyword: record.keyword(),
        activity_id: record.activity_id().to_string(),
        related_activity_id: record.related_activity_id().map(|guid| guid.to_string()),
        raw_timestamp: record.raw_timestamp(),
        session: session.to_string(),
        created: Timestamp::now(),
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::guid::Guid;
    use crate::native::etw_types::{
        EVENT_HEADER_EXTENDED_DATA_ITEM, EVENT_HEADER_EXT_TYPE_RELATED_ACTIVITYID, EVENT_RECORD,
    };
    use windows::Win32::System::Diagnostics::Etw::EVENT_DESCRIPTOR;

    const PROVIDER: &str = "{EDD08927-9CC4-4E65-B970-C2560FB5C289}";
    const ACTIVITY: &str = "{22FB2CD6-0E7B-422B-A0C7-2FAD1FD0E716}";
    const RELATED: &str = "{A0C1853B-5C40-4B15-8766-3CF1C58F985A}";

    pub(crate) fn sample_record() -> StructuredRecord {
        let mut native = EVENT_RECORD::default();
        native.EventHeader.EventDescriptor.Id = 42;
        decode(EventRecord::from_native(&native), "sample")
    }

    fn native_record() -> EVENT_RECORD {
        let mut native = EVENT_RECORD::default();
        native.EventHeader.ProviderId = Guid::parse(PROVIDER).unwrap().into();
        native.EventHeader.ActivityId = Guid::parse(ACTIVITY).unwrap().into();
        native.EventHeader.ProcessId = 4242;
        native.EventHeader.ThreadId = 1337;
        native.EventHeader.TimeStamp = 123_456_789;
        native.EventHeader.EventDescriptor = EVENT_DESCRIPTOR {
            Id: 11,
            Version: 2,
            Channel: 16,
            Level: 4,
            Opcode: 1,
            Task: 7,
            Keyword: 0x8000_0000_0000_0010,
        };
        native
    }

    #[test]
    fn test_decode_header_fields() {
        let native = native_record();
        let before = Timestamp::now();
        let decoded = decode(EventRecord::from_native(&native), "etwbeat");

        assert_eq!(decoded.provider_id, PROVIDER);
        assert_eq!(decoded.activity_id, ACTIVITY);
        assert_eq!(decoded.related_activity_id, None);
        assert_eq!(decoded.process_id, 4242);
        assert_eq!(decoded.thread_id, 1337);
        assert_eq!(decoded.event_id, 11);
        assert_eq!(decoded.version, 2);
        assert_eq!(decoded.channel, 16);
        assert_eq!(decoded.level, 4);
        assert_eq!(decoded.level_name(), Some("information"));
        assert_eq!(decoded.op_code, 1);
        assert_eq!(decoded.task, 7);
        assert_eq!(decoded.keyword, 0x8000_0000_0000_0010);
        assert_eq!(decoded.raw_timestamp, 123_456_789);
        assert_eq!(decoded.session, "etwbeat");
        assert!(decoded.created >= before);
    }

    #[test]
    fn test_decode_zeroed_record() {
        let native = EVENT_RECORD::default();
        let decoded = decode(EventRecord::from_native(&native), "");

        assert_eq!(decoded.provider_id, "{00000000-0000-0000-0000-000000000000}");
        assert_eq!(decoded.activity_id, "{00000000-0000-0000-0000-000000000000}");
        assert_eq!(decoded.event_id, 0);
        assert_eq!(decoded.level, 0);
        assert_eq!(decoded.level_name(), None);
        assert_eq!(decoded.keyword, 0);
    }

    #[test]
    fn test_unknown_level_is_kept_raw() {
        let mut native = native_record();
        native.EventHeader.EventDescriptor.Level = 0x80;
        let decoded = decode(EventRecord::from_native(&native), "etwbeat");

        assert_eq!(decoded.level, 0x80);
        assert_eq!(decoded.level_name(), None);
    }

    #[test]
    fn test_related_activity_id() {
        let related = Guid::parse(RELATED).unwrap();
        let mut items = [
            EVENT_HEADER_EXTENDED_DATA_ITEM {
                ExtType: 0x0004, // not handled
                DataSize: 16,
                DataPtr: &related as *const Guid as u64,
                ..Default::default()
            },
            EVENT_HEADER_EXTENDED_DATA_ITEM {
                ExtType: EVENT_HEADER_EXT_TYPE_RELATED_ACTIVITYID,
                DataSize: 16,
                DataPtr: &related as *const Guid as u64,
                ..Default::default()
            },
        ];

        let mut native = native_record();
        native.ExtendedDataCount = items.len() as u16;
        native.ExtendedData = items.as_mut_ptr();
        let decoded = decode(EventRecord::from_native(&native), "etwbeat");

        assert_eq!(decoded.related_activity_id.as_deref(), Some(RELATED));
    }

    #[test]
    fn test_truncated_related_activity_id() {
        let related = Guid::parse(RELATED).unwrap();
        let mut items = [EVENT_HEADER_EXTENDED_DATA_ITEM {
            ExtType: EVENT_HEADER_EXT_TYPE_RELATED_ACTIVITYID,
            DataSize: 8,
            DataPtr: &related as *const Guid as u64,
            ..Default::default()
        }];

        let mut native = native_record();
        native.ExtendedDataCount = 1;
        native.ExtendedData = items.as_mut_ptr();
        let decoded = decode(EventRecord::from_native(&native), "etwbeat");

        assert_eq!(decoded.related_activity_id, None);
    }
}
