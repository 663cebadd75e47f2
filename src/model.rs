//! Device kinds and the typed states decoded from node state topics.
//!
//! Nodes publish JSON objects on `iot/nodes/<node>/<device>/state`; the
//! structs here mirror those payloads. Every field has a default so a
//! partial or malformed payload degrades to a usable value instead of an
//! error (see [`crate::mqtt::decode`]).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Appliance kinds a node can drive through its IR emitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Ac,
    Tv,
    Fan,
    Stb,
    Dvd,
    Projector,
}

impl DeviceType {
    /// All supported kinds, in subscription order.
    pub const ALL: [DeviceType; 6] = [
        DeviceType::Ac,
        DeviceType::Tv,
        DeviceType::Fan,
        DeviceType::Stb,
        DeviceType::Dvd,
        DeviceType::Projector,
    ];

    /// Lower-case topic segment for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Ac => "ac",
            DeviceType::Tv => "tv",
            DeviceType::Fan => "fan",
            DeviceType::Stb => "stb",
            DeviceType::Dvd => "dvd",
            DeviceType::Projector => "projector",
        }
    }

    /// Lenient parse from payload fields or display labels. Unknown or
    /// blank values fall back to AC, matching what nodes assume.
    pub fn from_label(value: &str) -> DeviceType {
        let raw = value.trim();
        if raw.is_empty() {
            return DeviceType::Ac;
        }
        for kind in DeviceType::ALL {
            if raw.eq_ignore_ascii_case(kind.as_str()) {
                return kind;
            }
        }
        match raw.to_ascii_lowercase().as_str() {
            "tivi" => DeviceType::Tv,
            "set-top-box" | "sat" | "stb/sat" => DeviceType::Stb,
            _ => DeviceType::Ac,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Air-conditioner state; the only device whose full state is mirrored
/// back by the node. The rest are command-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcState {
    pub power: bool,
    pub mode: String,
    pub temp: i32,
    pub fan: String,
}

impl Default for AcState {
    fn default() -> Self {
        Self {
            power: false,
            mode: "cool".to_string(),
            temp: 24,
            fan: "auto".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TvState {
    pub power: bool,
    pub muted: bool,
    pub volume: i32,
    pub channel: i32,
    pub input: String,
}

impl Default for TvState {
    fn default() -> Self {
        Self {
            power: false,
            muted: false,
            volume: 0,
            channel: 1,
            input: String::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanState {
    pub power: bool,
    /// 0..N, node-defined scale.
    pub speed: i32,
    pub swing: bool,
    /// normal / nature / sleep, free-form.
    #[serde(rename = "type")]
    pub kind: String,
    /// Remaining timer minutes, 0 when no timer armed.
    #[serde(rename = "timerMin")]
    pub timer_min: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StbState {
    pub power: bool,
    pub muted: bool,
    pub last_key: Option<String>,
    pub hint: Option<String>,
}

/// Result of an IR learning round published on `ir/learn`.
#[derive(Clone, Debug, PartialEq)]
pub struct IrLearningEvent {
    pub device: DeviceType,
    pub key: String,
    pub success: bool,
    pub protocol: Option<String>,
    pub code: Option<String>,
    pub bits: Option<i32>,
    pub error: Option<String>,
}
