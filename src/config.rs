use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL the asset manifest resolves against; also the same-origin
  /// reference for dynamic caching
  #[serde(deserialize_with = "deserialize_url")]
  pub origin: Url,
  /// The single remote endpoint that receives write submissions
  #[serde(deserialize_with = "deserialize_url")]
  pub endpoint: Url,
  /// Name of the current cache version; bump on deploy to rotate the cache
  #[serde(default = "default_cache_version")]
  pub cache_version: String,
  /// Root-relative paths cached eagerly on install
  #[serde(default = "default_assets")]
  pub assets: Vec<String>,
  /// Tag identifying this application's retry queue on reconnect signals
  #[serde(default = "default_sync_tag")]
  pub sync_tag: String,
  #[serde(default)]
  pub policy: PolicyConfig,
}

/// Interception policy knobs. Defaults match the simplest deployment:
/// placeholder fallback, no dynamic caching, form-encoded replays.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyConfig {
  /// Opportunistically cache successful same-origin GET responses
  #[serde(default)]
  pub dynamic_caching: bool,
  /// What to serve for a read that misses both cache and network
  #[serde(default)]
  pub offline_fallback: OfflineFallback,
  /// Content type used when replaying queued payloads
  #[serde(default)]
  pub write_body_encoding: WriteBodyEncoding,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum OfflineFallback {
  /// Fixed warning text
  #[default]
  Placeholder,
  /// The cached root document, when present
  CachedDocument,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WriteBodyEncoding {
  #[default]
  FormUrlencoded,
  Json,
}

impl WriteBodyEncoding {
  pub fn content_type(&self) -> &'static str {
    match self {
      WriteBodyEncoding::FormUrlencoded => "application/x-www-form-urlencoded",
      WriteBodyEncoding::Json => "application/json",
    }
  }
}

fn default_cache_version() -> String {
  "offsync-cache-v1".to_string()
}

fn default_assets() -> Vec<String> {
  [
    "/",
    "/index.html",
    "/manifest.json",
    "/icons/icon-192.png",
    "/icons/icon-512.png",
    "/icons/maskable-icon-512.png",
  ]
  .iter()
  .map(|s| s.to_string())
  .collect()
}

fn default_sync_tag() -> String {
  "sync-form-data".to_string()
}

fn deserialize_url<'de, D>(deserializer: D) -> Result<Url, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let s = String::deserialize(deserializer)?;
  Url::parse(&s).map_err(serde::de::Error::custom)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/offsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }
}

/// A fully populated config for tests elsewhere in the crate.
#[cfg(test)]
pub(crate) fn test_config() -> Config {
  Config {
    origin: Url::parse("https://example.app").unwrap(),
    endpoint: Url::parse("https://sink.example.com/exec").unwrap(),
    cache_version: "v1".to_string(),
    assets: vec!["/".to_string(), "/index.html".to_string()],
    sync_tag: "sync-form-data".to_string(),
    policy: PolicyConfig::default(),
  }
}
