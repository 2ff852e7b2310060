//! Framing mode selector

use std::fmt;

use serde::{Deserialize, Serialize};

/// Wire framing used on the bus
///
/// Exactly one mode is active at a time. `Uci` is the normal operating
/// protocol; `Hbci` and `Hdll` are bootstrap framings used only while the
/// device runs its bootloader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramingMode {
    #[default]
    Uci,
    Hbci,
    Hdll,
}

impl FramingMode {
    /// True for the bootloader framings
    pub fn is_bootstrap(self) -> bool {
        matches!(self, FramingMode::Hbci | FramingMode::Hdll)
    }
}

impl fmt::Display for FramingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FramingMode::Uci => "uci",
            FramingMode::Hbci => "hbci",
            FramingMode::Hdll => "hdll",
        };
        f.write_str(s)
    }
}
