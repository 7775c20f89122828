//! Runs every configured session side by side
//!
//! Each session gets its own controller thread (plus the worker thread that thread spawns to run
//! `ProcessTrace`). A session that fails does not affect the others. [`Consumer::stop`] fires the
//! shared shutdown signal and returns right away; [`Consumer::run`] returns once every session is
//! done.
use std::sync::Arc;
use std::thread;

use crate::config::{ConsumerConfig, SessionConfig};
use crate::native::evntrace::EtwApi;
use crate::shutdown::ShutdownSignal;
use crate::sink::Pipeline;
use crate::trace::{SessionState, SessionStatus, TraceSession};

/// How a session ended
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub name: String,
    /// Every state the session went through
    pub history: Vec<SessionState>,
    pub events_handled: usize,
}

impl SessionReport {
    pub fn final_state(&self) -> SessionState {
        self.history.last().copied().unwrap_or(SessionState::Created)
    }
}

/// Supervises the configured sessions
pub struct Consumer {
    sessions: Vec<(SessionConfig, SessionStatus)>,
    pipeline: Arc<dyn Pipeline>,
    api: Arc<dyn EtwApi>,
    shutdown: ShutdownSignal,
}

impl Consumer {
    /// A consumer backed by the actual Windows ETW API
    #[cfg(windows)]
    pub fn new(config: ConsumerConfig, pipeline: Arc<dyn Pipeline>) -> Self {
        Self::with_api(config, pipeline, Arc::new(crate::native::evntrace::NativeEtw::new()))
    }

    pub fn with_api(config: ConsumerConfig, pipeline: Arc<dyn Pipeline>, api: Arc<dyn EtwApi>) -> Self {
        let sessions = config
            .sessions
            .into_iter()
            .map(|session| (session, SessionStatus::new()))
            .collect();

        Self {
            sessions,
            pipeline,
            api,
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Run every session, and wait for all of them to end
    ///
    /// Sessions end when [`Self::stop`] is called, or on their own (failure, closed sink...).
    pub fn run(&self) -> Vec<SessionReport> {
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .sessions
                .iter()
                .map(|(config, status)| {
                    let spawned = thread::Builder::new()
                        .name(format!("session-{}", config.name))
                        .spawn_scoped(scope, move || self.run_session(config, status));
                    if let Err(err) = &spawned {
                        log::error!("Session {}: unable to spawn its thread: {}", config.name, err);
                        status.transition(SessionState::Failed);
                    }
                    spawned.ok()
                })
                .collect();

            for handle in handles.into_iter().flatten() {
                if handle.join().is_err() {
                    log::error!("A session thread panicked");
                }
            }
        });

        self.sessions
            .iter()
            .map(|(config, status)| SessionReport {
                name: config.name.clone(),
                history: status.history(),
                events_handled: status.events_handled(),
            })
            .collect()
    }

    fn run_session(&self, config: &SessionConfig, status: &SessionStatus) {
        let session = match TraceSession::from_config(config, Arc::clone(&self.api), status.clone()) {
            Ok(session) => session,
            Err(err) => {
                log::error!("Session {}: invalid configuration: {}", config.name, err);
                status.transition(SessionState::Failed);
                return;
            }
        };

        if let Err(err) = session.run(self.pipeline.as_ref(), &self.shutdown) {
            log::error!("Session {} failed: {}", config.name, err);
        }
    }

    /// Ask every session to stop. Does not wait for them
    pub fn stop(&self) {
        log::info!("Stopping {} session(s)", self.sessions.len());
        self.shutdown.trigger();
    }

    /// The live status of the session named `name`
    pub fn status(&self, name: &str) -> Option<SessionStatus> {
        self.sessions
            .iter()
            .find(|(config, _)| config.name == name)
            .map(|(_, status)| status.clone())
    }

    pub fn session_names(&self) -> impl Iterator<Item = &str> {
        self.sessions.iter().map(|(config, _)| config.name.as_str())
    }

    /// The signal [`Self::stop`] fires
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("sessions", &self.session_names().collect::<Vec<_>>())
            .field("shutdown", &self.shutdown)
            .finish()
    }
}
