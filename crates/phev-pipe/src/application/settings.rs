//! Session tunables and the construction bundle.

use std::time::Duration;

use phev_core::XorSeeds;
use serde::{Deserialize, Serialize};

use crate::application::dispatch::SessionStatus;
use crate::application::handshake::{RetryPolicy, PHEV_CONNECT_MAX_RETRIES, PHEV_CONNECT_WAIT_TIME};
use crate::application::pipeline::PipelineStages;
use crate::application::transport::Transport;
use crate::error::{log_error, ErrorHandler, PhevError};

/// Tunables of one session.  Loaded from the `[session]` table of the
/// configuration file; every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Register this device with the car when it is not registered yet.
    #[serde(default)]
    pub register_device: bool,
    /// Registrations the car holds at most.  A VIN announcing this many
    /// means no further device can be registered.
    #[serde(default = "default_max_registrations")]
    pub max_registrations: u8,
    /// Obfuscate frame bodies.
    #[serde(default = "default_true")]
    pub encrypt: bool,
    #[serde(default)]
    pub xor_seeds: XorSeeds,
    #[serde(default = "default_connect_wait_time_ms")]
    pub connect_wait_time_ms: u64,
    #[serde(default = "default_connect_max_retries")]
    pub connect_max_retries: u32,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Unanswered pings in a row that count as transport loss.  0 disables.
    #[serde(default = "default_max_missed_pings")]
    pub max_missed_pings: u32,
    #[serde(default = "default_update_ack_timeout_ms")]
    pub update_ack_timeout_ms: u64,
    /// Sleep between loop iterations.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Car-originated registers the default input filter suppresses.
    #[serde(default)]
    pub filtered_registers: Vec<u8>,
}

fn default_max_registrations() -> u8 {
    3
}
fn default_true() -> bool {
    true
}
fn default_connect_wait_time_ms() -> u64 {
    PHEV_CONNECT_WAIT_TIME.as_millis() as u64
}
fn default_connect_max_retries() -> u32 {
    PHEV_CONNECT_MAX_RETRIES
}
fn default_ping_interval_ms() -> u64 {
    1000
}
fn default_max_missed_pings() -> u32 {
    5
}
fn default_update_ack_timeout_ms() -> u64 {
    5000
}
fn default_poll_interval_ms() -> u64 {
    20
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            register_device: false,
            max_registrations: default_max_registrations(),
            encrypt: default_true(),
            xor_seeds: XorSeeds::default(),
            connect_wait_time_ms: default_connect_wait_time_ms(),
            connect_max_retries: default_connect_max_retries(),
            ping_interval_ms: default_ping_interval_ms(),
            max_missed_pings: default_max_missed_pings(),
            update_ack_timeout_ms: default_update_ack_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            filtered_registers: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.connect_max_retries,
            wait: Duration::from_millis(self.connect_wait_time_ms),
        }
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn update_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.update_ack_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Called once when the car confirms this device's registration.
pub type RegistrationCallback = Box<dyn FnOnce(&SessionStatus) + Send>;

/// Everything a [`Session`](crate::application::session::Session) is built
/// from.  The session takes ownership and never hands it back.
pub struct SessionSettings {
    pub input: Box<dyn Transport>,
    pub output: Option<Box<dyn Transport>>,
    pub stages: PipelineStages,
    pub config: SessionConfig,
    pub error_handler: ErrorHandler,
    pub on_registration_complete: Option<RegistrationCallback>,
}

impl SessionSettings {
    /// Settings with the default config, no application-side transport and
    /// the logging error handler.
    pub fn new(input: Box<dyn Transport>, stages: PipelineStages) -> Self {
        Self {
            input,
            output: None,
            stages,
            config: SessionConfig::default(),
            error_handler: Box::new(log_error),
            on_registration_complete: None,
        }
    }

    pub fn with_output(mut self, output: Box<dyn Transport>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_error_handler(mut self, handler: impl FnMut(&PhevError) + Send + 'static) -> Self {
        self.error_handler = Box::new(handler);
        self
    }

    pub fn on_registration_complete(
        mut self,
        callback: impl FnOnce(&SessionStatus) + Send + 'static,
    ) -> Self {
        self.on_registration_complete = Some(Box::new(callback));
        self
    }
}
