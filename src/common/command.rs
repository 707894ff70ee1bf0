//! Command and response types for driver control
//!
//! This module defines the protocol for controlling the lidar driver
//! via ZeroMQ REQ/REP sockets.
//!
//! ## Lifecycle State Machine
//! ```text
//!   ┌──────────────┐  Configure  ┌──────────┐  Activate  ┌────────┐
//!   │ Unconfigured │ ──────────► │ Inactive │ ─────────► │ Active │
//!   └──────────────┘ ◄────────── └──────────┘ ◄───────── └────────┘
//!          ▲            Cleanup                Deactivate     │
//!          │                                                  │ (on error)
//!          │ ClearError        ┌─────────────────┐            │
//!          └────────────────── │ ErrorProcessing │ ◄──────────┘
//!                              └─────────────────┘
//!
//!   Any state ── Shutdown ──► Finalized (terminal)
//! ```

use serde::{Deserialize, Serialize};

use super::metrics::CounterSnapshot;
use crate::sensor::SensorMetadata;

/// Driver lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LifecycleState {
    /// Initial state, no resources allocated
    #[default]
    Unconfigured,
    /// Output channels and pipeline allocated, sensor not connected
    Inactive,
    /// Sensor connected, processing tick running
    Active,
    /// Terminal state after shutdown
    Finalized,
    /// Unrecoverable failure, waiting for an explicit clear
    ErrorProcessing,
}

/// Lifecycle transitions that can be requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transition {
    Configure,
    Activate,
    Deactivate,
    Cleanup,
    Error,
    ClearError,
    Shutdown,
}

impl Transition {
    /// State reached when the transition succeeds
    pub fn target(&self) -> LifecycleState {
        match self {
            Transition::Configure => LifecycleState::Inactive,
            Transition::Activate => LifecycleState::Active,
            Transition::Deactivate => LifecycleState::Inactive,
            Transition::Cleanup => LifecycleState::Unconfigured,
            Transition::Error => LifecycleState::ErrorProcessing,
            Transition::ClearError => LifecycleState::Unconfigured,
            Transition::Shutdown => LifecycleState::Finalized,
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transition::Configure => write!(f, "configure"),
            Transition::Activate => write!(f, "activate"),
            Transition::Deactivate => write!(f, "deactivate"),
            Transition::Cleanup => write!(f, "cleanup"),
            Transition::Error => write!(f, "error"),
            Transition::ClearError => write!(f, "clear_error"),
            Transition::Shutdown => write!(f, "shutdown"),
        }
    }
}

impl LifecycleState {
    /// Check whether `transition` may be applied in this state
    pub fn allows(&self, transition: Transition) -> bool {
        use LifecycleState::*;
        match transition {
            Transition::Configure => *self == Unconfigured,
            Transition::Activate => *self == Inactive,
            Transition::Deactivate => *self == Active,
            Transition::Cleanup => *self == Inactive,
            Transition::ClearError => *self == ErrorProcessing,
            // Error and shutdown are reachable from anywhere but the terminal state
            Transition::Error => *self != Finalized,
            Transition::Shutdown => *self != Finalized,
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Unconfigured => write!(f, "Unconfigured"),
            LifecycleState::Inactive => write!(f, "Inactive"),
            LifecycleState::Active => write!(f, "Active"),
            LifecycleState::Finalized => write!(f, "Finalized"),
            LifecycleState::ErrorProcessing => write!(f, "ErrorProcessing"),
        }
    }
}

/// Commands sent from a controller to the driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Allocate output channels and pipeline (Unconfigured → Inactive)
    Configure,
    /// Connect to the sensor and start processing (Inactive → Active)
    Activate,
    /// Stop processing and disconnect (Active → Inactive)
    Deactivate,
    /// Release all resources (Inactive → Unconfigured)
    Cleanup,
    /// Force the error state (Any → ErrorProcessing)
    Error { reason: String },
    /// Acknowledge an error (ErrorProcessing → Unconfigured)
    ClearError,
    /// Release everything and finalize (Any → Finalized)
    Shutdown,
    /// Reconnect to the sensor without changing lifecycle state
    Reset,
    /// Return the cached sensor metadata
    GetMetadata,
    /// Query current status
    GetStatus,
}

impl Command {
    /// Look up a command by name, case-insensitively
    ///
    /// `reason` is only used by `Error`.
    pub fn from_name(name: &str, reason: Option<String>) -> Option<Self> {
        let cmd = match name.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "configure" => Command::Configure,
            "activate" => Command::Activate,
            "deactivate" => Command::Deactivate,
            "cleanup" => Command::Cleanup,
            "error" => Command::Error {
                reason: reason.unwrap_or_else(|| "requested by controller".to_string()),
            },
            "clearerror" => Command::ClearError,
            "shutdown" => Command::Shutdown,
            "reset" => Command::Reset,
            "getmetadata" | "metadata" => Command::GetMetadata,
            "getstatus" | "status" => Command::GetStatus,
            _ => return None,
        };
        Some(cmd)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Configure => write!(f, "Configure"),
            Command::Activate => write!(f, "Activate"),
            Command::Deactivate => write!(f, "Deactivate"),
            Command::Cleanup => write!(f, "Cleanup"),
            Command::Error { reason } => write!(f, "Error({})", reason),
            Command::ClearError => write!(f, "ClearError"),
            Command::Shutdown => write!(f, "Shutdown"),
            Command::Reset => write!(f, "Reset"),
            Command::GetMetadata => write!(f, "GetMetadata"),
            Command::GetStatus => write!(f, "GetStatus"),
        }
    }
}

/// Response from the driver to a controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Whether the command succeeded
    pub success: bool,
    /// Current lifecycle state after command
    pub state: LifecycleState,
    /// Human-readable message
    pub message: String,
    /// Sensor metadata (GetMetadata only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SensorMetadata>,
    /// Driver counters (GetStatus only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<CounterSnapshot>,
}

impl CommandResponse {
    /// Create a success response
    pub fn success(state: LifecycleState, message: impl Into<String>) -> Self {
        Self {
            success: true,
            state,
            message: message.into(),
            metadata: None,
            counters: None,
        }
    }

    /// Create an error response
    pub fn error(state: LifecycleState, message: impl Into<String>) -> Self {
        Self {
            success: false,
            state,
            message: message.into(),
            metadata: None,
            counters: None,
        }
    }

    /// Attach metadata to the response
    pub fn with_metadata(mut self, metadata: SensorMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Attach counters to the response
    pub fn with_counters(mut self, counters: CounterSnapshot) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Serialize to JSON bytes (for ZMQ)
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl Command {
    /// Serialize to JSON bytes (for ZMQ)
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
