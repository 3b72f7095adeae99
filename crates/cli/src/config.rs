//! Configuration persistence for the fp8-scaling CLI.
//!
//! Recipe parameters are resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (~/.config/fp8-scaling/config.toml, or `--config PATH`)
//! 3. Recipe defaults (lowest priority)

use std::fs;
use std::path::{Path, PathBuf};

use fp8_scaling_core::recipe::{
    AmaxComputeAlgo, BlockScalingConfig, CurrentScalingConfig, DelayedScalingConfig, Fp8Format,
};
use serde::{Deserialize, Serialize};

/// `[delayed]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DelayedSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub margin: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fp8_format: Option<Fp8Format>,

    /// Reference amax reduction (max, most_recent).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amax_compute_algo: Option<AmaxComputeAlgo>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub amax_history_len: Option<usize>,
}

/// `[current]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub margin: Option<f32>,

    /// Format of the synthetic output tensor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fp8_format: Option<Fp8Format>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_pow_2_scales: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub amax_epsilon: Option<f32>,
}

/// `[block]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_len: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fp8_format: Option<Fp8Format>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub margin: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_pow_2_scales: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub amax_epsilon: Option<f32>,
}

/// Persistent configuration stored in TOML format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Seed for the synthetic tensors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    #[serde(default)]
    pub delayed: DelayedSection,

    #[serde(default)]
    pub current: CurrentSection,

    #[serde(default)]
    pub block: BlockSection,
}

/// Fully resolved recipe parameters, as printed by `config show`.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    pub seed: u64,
    pub current_format: Fp8Format,
    pub delayed: DelayedScalingConfig,
    pub current: CurrentScalingConfig,
    pub block: BlockScalingConfig,
}

/// Seed used when neither the file nor the command line names one.
pub const DEFAULT_SEED: u64 = 0;

fn take<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
    if src.is_some() {
        dst.clone_from(src);
    }
}

impl CliConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("fp8-scaling").join("config.toml"))
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path().ok_or(ConfigError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save configuration to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }

        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)?;
        Ok(())
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &CliConfig) {
        take(&mut self.seed, &other.seed);

        let (d, o) = (&mut self.delayed, &other.delayed);
        take(&mut d.margin, &o.margin);
        take(&mut d.fp8_format, &o.fp8_format);
        take(&mut d.amax_compute_algo, &o.amax_compute_algo);
        take(&mut d.amax_history_len, &o.amax_history_len);

        let (c, o) = (&mut self.current, &other.current);
        take(&mut c.margin, &o.margin);
        take(&mut c.fp8_format, &o.fp8_format);
        take(&mut c.force_pow_2_scales, &o.force_pow_2_scales);
        take(&mut c.amax_epsilon, &o.amax_epsilon);

        let (b, o) = (&mut self.block, &other.block);
        take(&mut b.block_len, &o.block_len);
        take(&mut b.fp8_format, &o.fp8_format);
        take(&mut b.margin, &o.margin);
        take(&mut b.force_pow_2_scales, &o.force_pow_2_scales);
        take(&mut b.amax_epsilon, &o.amax_epsilon);
    }

    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or(DEFAULT_SEED)
    }

    pub fn delayed(&self) -> DelayedScalingConfig {
        let d = &self.delayed;
        let defaults = DelayedScalingConfig::default();
        DelayedScalingConfig {
            margin: d.margin.unwrap_or(defaults.margin),
            fp8_format: d.fp8_format.unwrap_or(defaults.fp8_format),
            amax_compute_algo: d.amax_compute_algo.unwrap_or(defaults.amax_compute_algo),
            amax_history_len: d.amax_history_len.unwrap_or(defaults.amax_history_len),
        }
    }

    pub fn current(&self) -> (CurrentScalingConfig, Fp8Format) {
        let c = &self.current;
        let defaults = CurrentScalingConfig::default();
        let config = CurrentScalingConfig {
            margin: c.margin.unwrap_or(defaults.margin),
            force_pow_2_scales: c.force_pow_2_scales.unwrap_or(defaults.force_pow_2_scales),
            amax_epsilon: c.amax_epsilon.unwrap_or(defaults.amax_epsilon),
        };
        (config, c.fp8_format.unwrap_or_default())
    }

    pub fn block(&self) -> BlockScalingConfig {
        let b = &self.block;
        let defaults = BlockScalingConfig::default();
        BlockScalingConfig {
            block_len: b.block_len.unwrap_or(defaults.block_len),
            fp8_format: b.fp8_format.unwrap_or(defaults.fp8_format),
            margin: b.margin.unwrap_or(defaults.margin),
            force_pow_2_scales: b.force_pow_2_scales.unwrap_or(defaults.force_pow_2_scales),
            amax_epsilon: b.amax_epsilon.unwrap_or(defaults.amax_epsilon),
        }
    }

    pub fn resolve(&self) -> ResolvedConfig {
        let (current, current_format) = self.current();
        ResolvedConfig {
            seed: self.seed(),
            current_format,
            delayed: self.delayed(),
            current,
            block: self.block(),
        }
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
    /// No config directory available.
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No config directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = CliConfig {
            seed: Some(7),
            delayed: DelayedSection {
                amax_compute_algo: Some(AmaxComputeAlgo::MostRecent),
                amax_history_len: Some(16),
                ..Default::default()
            },
            block: BlockSection {
                fp8_format: Some(Fp8Format::E5M2),
                ..Default::default()
            },
            ..Default::default()
        };

        config.save_to(&path).unwrap();
        let loaded = CliConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("amax_compute_algo = \"most_recent\""));
        assert!(text.contains("fp8_format = \"e5m2\""));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_save_uses_default_path() {
        let dir = tempdir().unwrap();
        std::env::set_var("XDG_CONFIG_HOME", dir.path());

        let config = CliConfig {
            seed: Some(3),
            ..Default::default()
        };
        let path = config.save().unwrap();
        assert_eq!(path, dir.path().join("fp8-scaling").join("config.toml"));
        assert_eq!(CliConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("config.toml");
        CliConfig::default().save_to(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[current]\nforce_pow_2_scales = true\n").unwrap();

        let loaded = CliConfig::load_from(&path).unwrap();
        let (current, format) = loaded.current();
        assert!(current.force_pow_2_scales);
        assert_eq!(current.margin, 0.0);
        assert_eq!(format, Fp8Format::E4M3);
        assert_eq!(loaded.delayed(), DelayedScalingConfig::default());
    }

    #[test]
    fn test_bad_file_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[delayed]\namax_compute_algo = \"mean\"\n").unwrap();
        assert!(matches!(
            CliConfig::load_from(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_algo_in_file_ignores_case() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[delayed]\namax_compute_algo = \"MOST_RECENT\"\n").unwrap();
        let loaded = CliConfig::load_from(&path).unwrap();
        assert_eq!(loaded.delayed().amax_compute_algo, AmaxComputeAlgo::MostRecent);
    }

    #[test]
    fn test_merge() {
        let mut base = CliConfig {
            seed: Some(1),
            delayed: DelayedSection {
                margin: Some(1.0),
                amax_history_len: Some(32),
                ..Default::default()
            },
            ..Default::default()
        };

        let flags = CliConfig {
            delayed: DelayedSection {
                amax_history_len: Some(8),
                fp8_format: Some(Fp8Format::E5M2),
                ..Default::default()
            },
            ..Default::default()
        };

        base.merge(&flags);

        assert_eq!(base.seed, Some(1)); // Unchanged
        assert_eq!(base.delayed.margin, Some(1.0)); // Unchanged
        assert_eq!(base.delayed.amax_history_len, Some(8)); // Overridden
        assert_eq!(base.delayed.fp8_format, Some(Fp8Format::E5M2)); // Added
    }

    #[test]
    fn test_resolve_fills_defaults() {
        let resolved = CliConfig::default().resolve();
        assert_eq!(resolved.seed, DEFAULT_SEED);
        assert_eq!(resolved.delayed.amax_history_len, 1024);
        assert_eq!(resolved.block.block_len, 128);
        assert!(resolved.block.force_pow_2_scales);
        assert!(!resolved.current.force_pow_2_scales);
    }
}
