//! Consumer configuration
//!
//! The list of sessions to run, as handed over by whatever loads the configuration file.
use num_traits::FromPrimitive;

/// ETW trace levels, as passed to `EnableTraceEx2`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, FromPrimitive)]
#[repr(u8)]
pub enum TraceLevel {
    Critical = 1,
    Error = 2,
    Warning = 3,
    Information = 4,
    Verbose = 5,
}

impl TraceLevel {
    /// Map a configured level name (case-insensitive)
    ///
    /// Anything unknown falls back to [`TraceLevel::Information`].
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "critical" => TraceLevel::Critical,
            "error" => TraceLevel::Error,
            "warning" => TraceLevel::Warning,
            "information" => TraceLevel::Information,
            "verbose" => TraceLevel::Verbose,
            _ => TraceLevel::Information,
        }
    }

    /// Map a raw level, as found in event descriptors
    pub fn from_raw(level: u8) -> Option<Self> {
        Self::from_u8(level)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TraceLevel::Critical => "critical",
            TraceLevel::Error => "error",
            TraceLevel::Warning => "warning",
            TraceLevel::Information => "information",
            TraceLevel::Verbose => "verbose",
        }
    }
}

impl Default for TraceLevel {
    fn default() -> Self {
        TraceLevel::Information
    }
}

impl From<TraceLevel> for u8 {
    fn from(level: TraceLevel) -> Self {
        level as u8
    }
}

/// One real-time session to run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct SessionConfig {
    /// Name of the native session
    pub name: String,
    /// GUIDs of the providers to enable, in their canonical `{...}` form.
    ///
    /// Only the first one is enabled.
    #[cfg_attr(feature = "serde", serde(default))]
    pub provider_ids: Vec<String>,
    /// One of `critical`, `error`, `warning`, `information` or `verbose`
    #[cfg_attr(feature = "serde", serde(default))]
    pub trace_level: Option<String>,
    /// Defaults to every keyword
    #[cfg_attr(feature = "serde", serde(default))]
    pub match_any_keyword: Option<u64>,
    #[cfg_attr(feature = "serde", serde(default))]
    pub match_all_keyword: Option<u64>,
}

impl SessionConfig {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn provider<S: Into<String>>(mut self, provider_id: S) -> Self {
        self.provider_ids.push(provider_id.into());
        self
    }

    pub fn trace_level<S: Into<String>>(mut self, level: S) -> Self {
        self.trace_level = Some(level.into());
        self
    }

    pub fn any(mut self, any: u64) -> Self {
        self.match_any_keyword = Some(any);
        self
    }

    pub fn all(mut self, all: u64) -> Self {
        self.match_all_keyword = Some(all);
        self
    }

    /// The level to enable the provider with
    pub fn level(&self) -> TraceLevel {
        self.trace_level
            .as_deref()
            .map(TraceLevel::from_name)
            .unwrap_or_default()
    }
}

/// The whole consumer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct ConsumerConfig {
    #[cfg_attr(feature = "serde", serde(default))]
    pub sessions: Vec<SessionConfig>,
}
