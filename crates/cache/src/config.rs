//! Tile buffer configuration
//!
//! Tile edge length and the byte budget of the pixel pool. Configuration can
//! be loaded from a file, environment variables, or created programmatically.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Bytes per pixel of every pooled tile buffer (premultiplied 32-bit color).
pub const BYTES_PER_PIXEL: usize = 4;

/// Default tile edge length in device pixels.
pub const DEFAULT_TILE_SIZE_PX: u32 = 256;

/// Default pixel pool budget. Holds an 8K viewport twice over.
pub const DEFAULT_POOL_BUDGET_BYTES: usize = 256 * 1024 * 1024;

const MB: usize = 1024 * 1024;

/// Configuration for a [`TileBuffer`](crate::TileBuffer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileBufferConfig {
    /// Tile edge length in device pixels
    pub tile_size_px: u32,
    /// Total bytes reserved for the pixel pool
    pub pool_budget_bytes: usize,
}

impl Default for TileBufferConfig {
    fn default() -> Self {
        Self {
            tile_size_px: DEFAULT_TILE_SIZE_PX,
            pool_budget_bytes: DEFAULT_POOL_BUDGET_BYTES,
        }
    }
}

impl TileBufferConfig {
    /// Sets the tile edge length in pixels.
    pub fn with_tile_size(mut self, px: u32) -> Self {
        self.tile_size_px = px;
        self
    }

    /// Sets the pool budget in megabytes, saturating at `usize::MAX` bytes.
    pub fn with_pool_budget_mb(mut self, mb: usize) -> Self {
        self.pool_budget_bytes = mb.saturating_mul(MB);
        self
    }

    /// Sets the pool budget in bytes.
    pub fn with_pool_budget_bytes(mut self, bytes: usize) -> Self {
        self.pool_budget_bytes = bytes;
        self
    }

    /// Byte size of one tile buffer.
    pub fn tile_stride(&self) -> usize {
        let edge = self.tile_size_px as usize;
        edge * edge * BYTES_PER_PIXEL
    }

    /// Number of pool slots the budget affords, keeping one tile of headroom.
    pub fn pool_slots(&self) -> usize {
        let stride = self.tile_stride();
        if stride == 0 {
            return 1;
        }
        (self.pool_budget_bytes / stride).saturating_sub(1).max(1)
    }

    /// Returns the pool budget in megabytes.
    pub fn pool_budget_mb(&self) -> usize {
        self.pool_budget_bytes / MB
    }

    /// Checks that the configuration describes a usable pool.
    ///
    /// # Errors
    /// Returns an error for a zero tile size or a budget below two tiles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tile_size_px == 0 {
            return Err(ConfigError::InvalidValue("tile_size_px".to_string()));
        }
        if self.pool_budget_bytes < self.tile_stride() * 2 {
            return Err(ConfigError::InvalidValue("pool_budget_mb".to_string()));
        }
        Ok(())
    }

    /// Returns the default configuration file location for the current platform.
    ///
    /// - macOS: ~/Library/Application Support/doctile/tiles.toml
    /// - Linux: ~/.config/doctile/tiles.toml
    /// - Windows: %APPDATA%\doctile\tiles.toml
    pub fn default_config_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("doctile").join("tiles.toml")
        } else {
            PathBuf::from("doctile-tiles.toml")
        }
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DOCTILE_TILE_SIZE_PX`: tile edge length in pixels (default: 256)
    /// - `DOCTILE_POOL_BUDGET_MB`: pixel pool budget in MB (default: 256)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("DOCTILE_TILE_SIZE_PX") {
            config.tile_size_px = val
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidValue("DOCTILE_TILE_SIZE_PX".to_string()))?;
        }

        if let Ok(val) = std::env::var("DOCTILE_POOL_BUDGET_MB") {
            config.pool_budget_bytes = val
                .parse::<usize>()
                .ok()
                .and_then(|mb| mb.checked_mul(MB))
                .ok_or_else(|| ConfigError::InvalidValue("DOCTILE_POOL_BUDGET_MB".to_string()))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format:
    /// ```toml
    /// tile_size_px = 256
    /// pool_budget_mb = 256
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for line in toml_str.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"');

                match key {
                    "tile_size_px" => {
                        config.tile_size_px = value
                            .parse::<u32>()
                            .map_err(|_| ConfigError::InvalidValue(key.to_string()))?;
                    }
                    "pool_budget_mb" => {
                        config.pool_budget_bytes = value
                            .parse::<usize>()
                            .ok()
                            .and_then(|mb| mb.checked_mul(MB))
                            .ok_or_else(|| ConfigError::InvalidValue(key.to_string()))?;
                    }
                    _ => {} // Ignore unknown keys
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml())?;
        Ok(())
    }

    fn to_toml(&self) -> String {
        format!(
            "# doctile tile buffer configuration\n\
             tile_size_px = {}\n\
             pool_budget_mb = {}\n",
            self.tile_size_px,
            self.pool_budget_mb()
        )
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    /// I/O error reading or writing configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = TileBufferConfig::default();
        assert_eq!(config.tile_size_px, 256);
        assert_eq!(config.pool_budget_bytes, 256 * 1024 * 1024);
        assert_eq!(config.tile_stride(), 256 * 256 * 4);
        assert_eq!(config.pool_slots(), 1023);
    }

    #[test]
    fn test_builder_methods() {
        let config = TileBufferConfig::default()
            .with_tile_size(16)
            .with_pool_budget_bytes(16 * 16 * 4 * 9);

        assert_eq!(config.tile_stride(), 1024);
        assert_eq!(config.pool_slots(), 8);
        assert!(config.validate().is_ok());

        let config = config.with_pool_budget_mb(64);
        assert_eq!(config.pool_budget_mb(), 64);
    }

    #[test]
    fn test_validate_rejects_unusable_pool() {
        let zero = TileBufferConfig::default().with_tile_size(0);
        assert!(matches!(zero.validate(), Err(ConfigError::InvalidValue(_))));

        let tiny = TileBufferConfig::default().with_pool_budget_bytes(1024);
        assert!(tiny.validate().is_err());
    }

    #[test]
    fn test_default_config_path() {
        let path = TileBufferConfig::default_config_path();
        assert!(path.ends_with("tiles.toml") || path.ends_with("doctile-tiles.toml"));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&["DOCTILE_TILE_SIZE_PX", "DOCTILE_POOL_BUDGET_MB"]);

        env::set_var("DOCTILE_TILE_SIZE_PX", "512");
        env::set_var("DOCTILE_POOL_BUDGET_MB", "64");

        let config = TileBufferConfig::from_env().unwrap();
        assert_eq!(config.tile_size_px, 512);
        assert_eq!(config.pool_budget_bytes, 64 * 1024 * 1024);
    }

    #[test]
    #[serial]
    fn test_from_env_partial() {
        let _guard = EnvGuard::new(&["DOCTILE_TILE_SIZE_PX", "DOCTILE_POOL_BUDGET_MB"]);

        env::remove_var("DOCTILE_TILE_SIZE_PX");
        env::set_var("DOCTILE_POOL_BUDGET_MB", "32");

        let config = TileBufferConfig::from_env().unwrap();
        assert_eq!(config.tile_size_px, 256); // default
        assert_eq!(config.pool_budget_mb(), 32);
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&["DOCTILE_TILE_SIZE_PX"]);

        env::set_var("DOCTILE_TILE_SIZE_PX", "huge");
        assert!(TileBufferConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_budget_overflow() {
        let _guard = EnvGuard::new(&["DOCTILE_TILE_SIZE_PX", "DOCTILE_POOL_BUDGET_MB"]);

        env::remove_var("DOCTILE_TILE_SIZE_PX");
        env::set_var("DOCTILE_POOL_BUDGET_MB", usize::MAX.to_string());

        let err = TileBufferConfig::from_env().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value for configuration key: DOCTILE_POOL_BUDGET_MB"
        );
    }

    // Helper to save and restore environment variables
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
            # Test configuration
            tile_size_px = 128
            pool_budget_mb = "16"
            unknown_key = 5
        "#;

        let config = TileBufferConfig::from_toml(toml).unwrap();
        assert_eq!(config.tile_size_px, 128);
        assert_eq!(config.pool_budget_mb(), 16);
    }

    #[test]
    fn test_from_toml_invalid_number() {
        let err = TileBufferConfig::from_toml("tile_size_px = -3").unwrap_err();
        assert_eq!(err.to_string(), "invalid value for configuration key: tile_size_px");
    }

    #[test]
    fn test_from_toml_budget_overflow() {
        let toml = format!("pool_budget_mb = {}", usize::MAX);
        let err = TileBufferConfig::from_toml(&toml).unwrap_err();
        assert_eq!(err.to_string(), "invalid value for configuration key: pool_budget_mb");
    }

    #[test]
    fn test_builder_budget_saturates() {
        let config = TileBufferConfig::default().with_pool_budget_mb(usize::MAX);
        assert_eq!(config.pool_budget_bytes, usize::MAX);
    }

    #[test]
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiles.toml");

        let config = TileBufferConfig::default()
            .with_tile_size(128)
            .with_pool_budget_mb(8);
        config.save_to_file(&path).unwrap();

        let loaded = TileBufferConfig::from_file(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = TileBufferConfig::from_file(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
