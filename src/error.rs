// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

use thiserror::Error;

/// Everything a public engine operation can fail with. The tick never
/// surfaces these to its caller; it logs and keeps going.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Sensor {id} is not configured or has been deactivated")]
    InactiveSensor { id: u32 },

    #[error("Sector pool exhausted and no space could be reclaimed")]
    OutOfMemory,

    #[error("No records available")]
    NoData,

    #[error("Timed out after {waited_ms} ms waiting for UTC time")]
    Timeout { waited_ms: u64 },

    #[error("Write rejected: shutdown in progress")]
    ShuttingDown,

    #[error("Sensor {id} chain corrupt: {reason}")]
    CorruptChain { id: u32, reason: String },

    #[error("Every sector of sensor {id} is pending acknowledgement")]
    AllPending { id: u32 },

    #[error("I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("Spooler for {spooler} stalled in {state} and was reset")]
    SpoolerStall { spooler: &'static str, state: &'static str },

    #[error("Recovery failed for sensor {id}: {reason}")]
    RecoveryFailed { id: u32, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
