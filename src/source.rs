// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Upload sources — the logical lanes data leaves the device through.
//!
//! Each lane has its own sensor namespace and its own spool directory under
//! the configured base path. Sensor ids are unique only within a lane.

use serde::{Deserialize, Serialize};

/// A logical upload lane. Doubles as the index into every per-source array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadSource {
    Gateway,
    Ble,
    Can,
    Telemetry,
    Diagnostics,
    Hosted,
}

/// Number of upload lanes; the length of every per-source array.
pub const UPLOAD_SOURCE_COUNT: usize = 6;

pub const ALL_SOURCES: [UploadSource; UPLOAD_SOURCE_COUNT] = [
    UploadSource::Gateway,
    UploadSource::Ble,
    UploadSource::Can,
    UploadSource::Telemetry,
    UploadSource::Diagnostics,
    UploadSource::Hosted,
];

impl UploadSource {
    /// Array index for per-source state.
    pub fn index(self) -> usize {
        match self {
            UploadSource::Gateway => 0,
            UploadSource::Ble => 1,
            UploadSource::Can => 2,
            UploadSource::Telemetry => 3,
            UploadSource::Diagnostics => 4,
            UploadSource::Hosted => 5,
        }
    }

    /// Spool directory name under the configured base path.
    pub fn dir_name(self) -> &'static str {
        match self {
            UploadSource::Gateway => "gateway",
            UploadSource::Ble => "ble",
            UploadSource::Can => "can",
            UploadSource::Telemetry => "telemetry",
            UploadSource::Diagnostics => "diagnostics",
            UploadSource::Hosted => "hosted",
        }
    }

    pub fn name(self) -> &'static str {
        self.dir_name()
    }

    pub fn from_index(idx: usize) -> Option<Self> {
        ALL_SOURCES.get(idx).copied()
    }
}

impl std::fmt::Display for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}
