//! Structured events streamed to log viewers.
//!
//! Wire shape is a JSON object with an `event` discriminator:
//!
//! ```json
//! {"event": "log", "line": "..."}
//! {"event": "milestone", "milestone": "Linking Firmware", "id": "step-3"}
//! {"event": "progress", "name": "RAM", "bar": "[====      ]", "percent": "42.0%"}
//! {"event": "update_summary", "target_id": "step-2", "text": "..."}
//! {"event": "CLOSE"}
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum LogEvent {
    #[serde(rename = "log")]
    Log { line: String },

    #[serde(rename = "milestone")]
    Milestone {
        #[serde(rename = "milestone")]
        name: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        line: Option<String>,
    },

    #[serde(rename = "progress")]
    Progress {
        name: String,
        bar: String,
        percent: String,
    },

    #[serde(rename = "update_summary")]
    UpdateSummary { target_id: String, text: String },

    /// Terminates every stream; nothing follows it.
    #[serde(rename = "CLOSE")]
    Close,
}

impl LogEvent {
    pub fn log(line: impl Into<String>) -> Self {
        Self::Log { line: line.into() }
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close)
    }
}
