use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::decoder;
use crate::native::etw_types::EventRecord;
use crate::sink::SinkClient;
use crate::trace::SessionStatus;

/// Data used by callbacks when the trace is running
// NOTE: this structure is accessed in an unsafe block in a separate thread (see the `event_record_callback` function)
//       Thus, this struct must not be mutated (outside of interior mutability) when the associated trace is running.
pub struct CallbackData {
    session: String,
    status: SessionStatus,
    client: Arc<dyn SinkClient>,
    /// Set once the sink refused a record. The next buffer callback then stops the processing
    stop_requested: AtomicBool,
}

impl CallbackData {
    pub fn new(session: String, status: SessionStatus, client: Arc<dyn SinkClient>) -> Self {
        Self {
            session,
            status,
            client,
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// How many events have been published since the session started
    pub fn events_handled(&self) -> usize {
        self.status.events_handled()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    pub fn on_event(&self, record: &EventRecord) {
        if self.is_stop_requested() {
            return;
        }

        let structured = decoder::decode(record, &self.session);
        log::trace!(
            "Session {}: event {} from {}",
            self.session,
            structured.event_id,
            structured.provider_id
        );
        match self.client.publish(structured) {
            Ok(()) => {
                self.status.record_event();
            }
            Err(err) => {
                if !self.stop_requested.swap(true, Ordering::AcqRel) {
                    log::warn!("Session {}: sink refused an event ({}), stopping", self.session, err);
                }
            }
        }
    }

    /// Whether `ProcessTrace` should keep delivering buffers
    pub fn on_buffer(&self) -> bool {
        !self.is_stop_requested()
    }
}

impl std::fmt::Debug for CallbackData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackData")
            .field("session", &self.session)
            .field("events_handled", &self.events_handled())
            .field("stop_requested", &self.is_stop_requested())
            .finish()
    }
}
