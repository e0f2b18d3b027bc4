//! Cross-platform application paths using the `dirs` crate.
//!
//! Config dir:
//!   Windows: %APPDATA%\narrator\
//!   macOS:   ~/Library/Application Support/narrator/
//!   Linux:   ~/.config/narrator/
//!
//! Cache dir (image descriptions): `dirs::cache_dir()/narrator/`.

use std::path::PathBuf;

/// Holds all resolved application directory/file paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory holding `settings.toml`.
    pub config_dir: PathBuf,
    /// Full path to `settings.toml`.
    pub settings_file: PathBuf,
    /// Directory holding the description cache index.
    pub cache_dir: PathBuf,
}

impl AppPaths {
    const APP_NAME: &'static str = "narrator";

    /// Resolves all paths using the `dirs` crate.
    ///
    /// Falls back to the current directory if the platform cannot provide a
    /// standard path.
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);
        let settings_file = config_dir.join("settings.toml");
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);

        Self {
            config_dir,
            settings_file,
            cache_dir,
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}
