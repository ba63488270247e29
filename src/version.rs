// Centralized version and board identity

use std::fmt;

// Cargo package version from Cargo.toml
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

// Display version - this is what users see on the matrix
pub fn display_version() -> String {
    format!("v{}", FIRMWARE_VERSION)
}

// Version info string for logging
pub fn version_info() -> String {
    format!("Firmware: {}, Board: {}", FIRMWARE_VERSION, Board::compiled())
}

/// Board family, used to pick the right release assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Board {
    Esp32,
    Esp32S2,
    Esp32S3,
}

impl Board {
    /// Board selected at compile time through cargo features.
    pub const fn compiled() -> Self {
        if cfg!(feature = "esp32s3") {
            Board::Esp32S3
        } else if cfg!(feature = "esp32s2") {
            Board::Esp32S2
        } else {
            Board::Esp32
        }
    }

    /// Identifier used as the manifest key (`firmware.<id>.url`).
    pub const fn id(&self) -> &'static str {
        match self {
            Board::Esp32 => "esp32",
            Board::Esp32S2 => "esp32s2",
            Board::Esp32S3 => "esp32s3",
        }
    }

    /// Whether a lower-cased asset file name targets this board.
    ///
    /// The plain ESP32 name is a prefix of the S2/S3 names, so the base board
    /// only matches names that mention none of the variants.
    pub fn matches_asset(&self, name_lower: &str) -> bool {
        let s3 = name_lower.contains("esp32s3") || name_lower.contains("esp32-s3");
        let s2 = name_lower.contains("esp32s2") || name_lower.contains("esp32-s2");
        match self {
            Board::Esp32S3 => s3,
            Board::Esp32S2 => s2,
            Board::Esp32 => name_lower.contains("esp32") && !s3 && !s2,
        }
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}
