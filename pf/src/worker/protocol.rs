//! Driver wire protocol
//!
//! Simple JSON-over-newline protocol between a worker and its browser driver
//! process. Each message is a single line of JSON followed by `\n`. The driver
//! writes `Ready` once after start, then answers every `Visit` with `Done` or
//! `Error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::ContentBlob;

/// Messages from worker to driver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum DriverRequest {
    /// Load a page
    Visit { id: u64, url: String },

    /// Ask the driver to exit cleanly
    Shutdown,
}

/// Messages from driver to worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum DriverResponse {
    /// Driver started and browser is usable
    Ready,

    /// Command finished; `id` echoes the request when present
    Done {
        #[serde(default)]
        id: Option<u64>,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        content: Vec<ContentBlob>,
    },

    /// Command failed but the browser is still healthy
    Error {
        #[serde(default)]
        id: Option<u64>,
        message: String,
    },
}
