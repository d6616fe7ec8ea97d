use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Execution defaults stored under `[profiles.<name>]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Profile {
    pub name: String,
    pub partitions: Option<usize>,
    pub partition_key_path: Option<String>,
    pub page_size: Option<i32>,
    pub max_concurrency: Option<usize>,
    pub optimistic: Option<bool>,
    pub index_metrics: Option<bool>,
}

#[derive(Debug, Default)]
pub struct CliConfig {
    path: Option<PathBuf>,
    data: RawConfig,
    profiles: BTreeMap<String, Profile>,
}

impl CliConfig {
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let data = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => RawConfig::default(),
        };
        let profiles = parse_profiles(&data)?;
        Ok(Self {
            path,
            data,
            profiles,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn default_profile_name(&self) -> Option<&str> {
        self.data.default_profile.as_deref()
    }

    /// Named profile, or the configured default when `name` is `None`.
    pub fn resolve(&self, name: Option<&str>) -> Result<Option<&Profile>, ConfigError> {
        match name.or_else(|| self.default_profile_name()) {
            Some(name) => self
                .profiles
                .get(name)
                .map(Some)
                .ok_or_else(|| ConfigError::ProfileNotFound {
                    name: name.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub fn profiles(&self) -> impl Iterator<Item = &Profile> {
        self.profiles.values()
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

fn parse_profiles(data: &RawConfig) -> Result<BTreeMap<String, Profile>, ConfigError> {
    let mut profiles = BTreeMap::new();
    for (name, raw) in &data.profiles {
        profiles.insert(name.clone(), convert_profile(name, raw)?);
    }
    if let Some(default_name) = data.default_profile.as_ref() {
        if !profiles.contains_key(default_name) {
            return Err(ConfigError::ProfileNotFound {
                name: default_name.clone(),
            });
        }
    }
    Ok(profiles)
}

fn convert_profile(name: &str, raw: &RawProfile) -> Result<Profile, ConfigError> {
    if raw.partitions == Some(0) {
        return Err(ConfigError::Invalid {
            profile: name.to_string(),
            field: "partitions",
            value: "0".to_string(),
        });
    }
    if let Some(size) = raw.page_size.filter(|size| *size == 0 || *size < -1) {
        return Err(ConfigError::Invalid {
            profile: name.to_string(),
            field: "page_size",
            value: size.to_string(),
        });
    }
    Ok(Profile {
        name: name.to_string(),
        partitions: raw.partitions,
        partition_key_path: raw.partition_key_path.clone(),
        page_size: raw.page_size,
        max_concurrency: raw.max_concurrency,
        optimistic: raw.optimistic,
        index_metrics: raw.index_metrics,
    })
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    profiles: BTreeMap<String, RawProfile>,
    #[serde(default)]
    default_profile: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProfile {
    partitions: Option<usize>,
    partition_key_path: Option<String>,
    page_size: Option<i32>,
    max_concurrency: Option<usize>,
    optimistic: Option<bool>,
    index_metrics: Option<bool>,
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
    #[error("profile '{name}' not found")]
    ProfileNotFound { name: String },
    #[error("profile '{profile}' {field} value '{value}' is invalid")]
    Invalid {
        profile: String,
        field: &'static str,
        value: String,
    },
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("docquery").join("cli.toml"))
}
