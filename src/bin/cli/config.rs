use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::OutputFormat;

/// Settings read from `cli.toml`.
#[derive(Debug, Default)]
pub struct CliConfig {
    path: Option<PathBuf>,
    data: RawConfig,
}

impl CliConfig {
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let data = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => RawConfig::default(),
        };
        let config = Self { path, data };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(name) = &self.data.default_source_set {
            self.source_set(name)?;
        }
        self.format()?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn format(&self) -> Result<Option<OutputFormat>, ConfigError> {
        match self.data.defaults.format.as_deref() {
            Some(value) => OutputFormat::from_str(value, true)
                .map(Some)
                .map_err(|_| ConfigError::InvalidFormat {
                    value: value.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub fn timeout_ms(&self) -> Option<u64> {
        self.data.defaults.timeout_ms
    }

    pub fn hash_join_budget(&self) -> Option<usize> {
        self.data.defaults.hash_join_budget
    }

    pub fn source_set(&self, name: &str) -> Result<&[String], ConfigError> {
        self.data
            .source_sets
            .get(name)
            .map(|set| set.sources.as_slice())
            .ok_or_else(|| ConfigError::SourceSetNotFound {
                name: name.to_string(),
            })
    }

    pub fn default_source_set(&self) -> Option<&str> {
        self.data.default_source_set.as_deref()
    }

    pub fn source_sets(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.data
            .source_sets
            .iter()
            .map(|(name, set)| (name.as_str(), set.sources.as_slice()))
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawConfig {
    #[serde(default)]
    defaults: DefaultsSection,
    #[serde(default)]
    source_sets: BTreeMap<String, RawSourceSet>,
    #[serde(default)]
    default_source_set: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct DefaultsSection {
    format: Option<String>,
    timeout_ms: Option<u64>,
    hash_join_budget: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawSourceSet {
    #[serde(default)]
    sources: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read CLI config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse CLI config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("source set '{name}' not found")]
    SourceSetNotFound { name: String },
    #[error("default output format '{value}' is invalid")]
    InvalidFormat { value: String },
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("sparrow").join("cli.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn config_file(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(body.as_bytes()).expect("write");
        file
    }

    #[test]
    fn reads_source_sets_and_defaults() {
        let file = config_file(
            r#"
default_source_set = "people"

[defaults]
format = "tsv"
timeout_ms = 5000

[source_sets.people]
sources = ["people.nt", "https://example.org/sparql"]
"#,
        );
        let config = CliConfig::load(Some(file.path().to_path_buf())).expect("load");
        assert_eq!(config.format().expect("format"), Some(OutputFormat::Tsv));
        assert_eq!(config.timeout_ms(), Some(5000));
        assert_eq!(config.default_source_set(), Some("people"));
        assert_eq!(config.source_set("people").expect("set").len(), 2);
    }

    #[test]
    fn dangling_default_source_set_is_rejected() {
        let file = config_file("default_source_set = \"missing\"\n");
        let err = CliConfig::load(Some(file.path().to_path_buf())).expect_err("invalid");
        assert!(matches!(err, ConfigError::SourceSetNotFound { .. }));
    }

    #[test]
    fn missing_file_yields_empty_config() {
        let config = CliConfig::load(Some(PathBuf::from("/no/such/cli.toml"))).expect("load");
        assert!(config.source_sets().next().is_none());
        assert_eq!(config.format().expect("format"), None);
    }
}
