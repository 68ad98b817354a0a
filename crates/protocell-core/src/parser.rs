//! Stable encoding of `(timestep, settings)` for persistence.
//!
//! The encoded tree is a JSON object:
//!
//! ```json
//! { "version": 1, "timestep": 42, "general": { ... }, "parameters": { ... } }
//! ```
//!
//! Missing fields take their named defaults and unknown fields are ignored,
//! so trees written by older or newer versions still decode.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use protocell_types::{GeneralSettings, Settings, SimulationParameters};

/// Version written by [`encode`]. Trees with a higher version are rejected.
pub const FORMAT_VERSION: u32 = 1;

/// Errors raised by the settings codec.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The tree does not have the expected shape.
    #[error("malformed settings tree: {source}")]
    Json {
        /// The underlying serde error.
        #[from]
        source: serde_json::Error,
    },

    /// The tree was written by a newer format.
    #[error("settings format version {found} is newer than supported version {supported}")]
    UnsupportedVersion {
        /// Version found in the tree.
        found: u32,
        /// Highest version this build reads.
        supported: u32,
    },
}

#[derive(Serialize, Deserialize)]
struct Document {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    timestep: u64,
    #[serde(default)]
    general: GeneralSettings,
    #[serde(default)]
    parameters: SimulationParameters,
}

const fn default_version() -> u32 {
    FORMAT_VERSION
}

/// Encode a timestep and settings into a JSON tree.
pub fn encode(timestep: u64, settings: &Settings) -> Result<Value, ParseError> {
    let document = Document {
        version: FORMAT_VERSION,
        timestep,
        general: settings.general.clone(),
        parameters: settings.parameters.clone(),
    };
    Ok(serde_json::to_value(document)?)
}

/// Decode a JSON tree produced by [`encode`] (or an older version of it).
pub fn decode(tree: &Value) -> Result<(u64, Settings), ParseError> {
    let document = Document::deserialize(tree)?;
    if document.version > FORMAT_VERSION {
        return Err(ParseError::UnsupportedVersion {
            found: document.version,
            supported: FORMAT_VERSION,
        });
    }
    Ok((
        document.timestep,
        Settings {
            general: document.general,
            parameters: document.parameters,
        },
    ))
}

/// Encode to a JSON string.
pub fn encode_to_string(timestep: u64, settings: &Settings) -> Result<String, ParseError> {
    Ok(serde_json::to_string_pretty(&encode(timestep, settings)?)?)
}

/// Decode from a JSON string.
pub fn decode_from_str(text: &str) -> Result<(u64, Settings), ParseError> {
    let tree: Value = serde_json::from_str(text)?;
    decode(&tree)
}
