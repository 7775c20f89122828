//! # Real-time ETW sessions, turned into structured records
//! This crate runs Windows Event Tracing (ETW) real-time sessions and hands every event they
//! receive, as a [`StructuredRecord`], to a sink of your choice.
//!
//! # What's ETW
//! Event Tracing for Windows (ETW) is an efficient kernel-level tracing facility that lets you log
//! kernel or application-defined events to a log file. You can consume the events in real time or
//! from a log file and use them to debug an application or to determine where performance issues
//! are occurring in the application. [Source]
//!
//! ETW is made out of three components:
//! * Controllers
//! * Providers
//! * Consumers
//!
//! This crate acts both as a controller (it creates a session per configured entry and enables one
//! provider on it) and as a consumer (it processes the session in real time, and decodes the header
//! of each event).
//!
//! # Getting started
//! Describe the sessions you want in a [`ConsumerConfig`], pick a [`sink::Pipeline`] and run a
//! [`Consumer`]. [`Consumer::run`] blocks until every session is done, so you'll usually call it
//! on its own thread, and [`Consumer::stop`] it from another one.
//!
//! ```ignore
//! use std::sync::Arc;
//! use ferrisbeat::{sink, Consumer, ConsumerConfig, SessionConfig};
//!
//! let config = ConsumerConfig {
//!     sessions: vec![SessionConfig::new("ferrisbeat-kernel-process")
//!         .provider("{22FB2CD6-0E7B-422B-A0C7-2FAD1FD0E716}") // Microsoft-Windows-Kernel-Process
//!         .trace_level("verbose")],
//! };
//!
//! let (pipeline, records) = sink::channel();
//! let consumer = Arc::new(Consumer::new(config, Arc::new(pipeline)));
//!
//! let runner = {
//!     let consumer = Arc::clone(&consumer);
//!     std::thread::spawn(move || consumer.run())
//! };
//!
//! for record in records.iter().take(10) {
//!     println!("{} emitted event {}", record.provider_id, record.event_id);
//! }
//!
//! consumer.stop();
//! for report in runner.join().unwrap() {
//!     println!("{}: {:?}", report.name, report.final_state());
//! }
//! ```
//!
//! [Source]: https://docs.microsoft.com/en-us/windows/win32/etw/about-event-tracing
//!
//! # Log messages
//! This crate writes log messages using the [`log`](https://docs.rs/log/latest/log/) crate.<br/>
//! In case you want them to be printed to the console, your binary should use one of the various logger implementations. [`env_logger`](https://docs.rs/env_logger/latest/env_logger/) is one of them.<br/>
//! You can have a look at how to use it in the `demos/` folder.
//!
//! # Platforms
//! The native bindings ([`native::evntrace::NativeEtw`], [`Consumer::new`]) only exist on Windows.
//! Everything else builds anywhere, and sessions can be driven by any [`native::evntrace::EtwApi`]
//! implementation.

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate num_derive;
extern crate num_traits;

pub mod encoding;
pub mod guid;

pub mod config;
pub mod consumer;
pub mod decoder;
pub mod native;
pub mod shutdown;
pub mod sink;
pub mod timestamp;
pub mod trace;

// Convenience re-exports.
pub use crate::config::{ConsumerConfig, SessionConfig, TraceLevel};
pub use crate::consumer::{Consumer, SessionReport};
pub use crate::decoder::StructuredRecord;
pub use crate::guid::Guid;
pub use crate::native::etw_types::EventRecord;
pub use crate::shutdown::ShutdownSignal;
pub use crate::trace::{SessionState, SessionStatus, TraceError, TraceSession};
