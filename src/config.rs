use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::outbox::SyncTag;

/// Immutable runtime configuration, built once at startup and shared by `Arc`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the client is served from (scheme + host + port)
  pub origin: Url,
  /// Partition version tag; partitions carrying any other tag are evicted on activation
  pub version: String,
  pub partition_prefix: String,
  /// Cross-origin hosts whose requests are still handled (fonts, API host)
  pub allowed_origins: Vec<String>,
  /// Shell document served for navigation requests while offline
  pub root_document: String,
  /// Fetched all-or-nothing on install
  pub essential_resources: Vec<String>,
  /// Warmed best-effort on install and refreshed on periodic sync
  pub api_endpoints: Vec<String>,
  pub image_resources: Vec<String>,
  pub mutation_routes: Vec<MutationRoute>,
  pub sync: SyncConfig,
  pub notifications: NotificationDefaults,
  /// SQLite database path (default: $XDG_DATA_HOME/lifeline/lifeline.db)
  pub database: Option<PathBuf>,
  /// Directory for rolling log files; stderr only when unset
  pub log_dir: Option<PathBuf>,
}

/// A non-GET path prefix whose failures are queued under `tag`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MutationRoute {
  pub prefix: String,
  #[serde(default = "default_route_method")]
  pub method: String,
  pub tag: SyncTag,
}

fn default_route_method() -> String {
  "POST".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub periodic_interval_secs: u64,
  /// How often the runtime loop checks connectivity
  pub probe_interval_secs: u64,
  pub health_path: String,
  /// Failed replays before an entry is dead-lettered (0 = retry forever)
  pub max_attempts: u32,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      periodic_interval_secs: 24 * 60 * 60,
      probe_interval_secs: 30,
      health_path: "/".to_string(),
      max_attempts: 20,
    }
  }
}

impl SyncConfig {
  pub fn periodic_interval(&self) -> Duration {
    Duration::from_secs(self.periodic_interval_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationDefaults {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub tag: String,
}

impl Default for NotificationDefaults {
  fn default() -> Self {
    Self {
      title: "Lifeline Health".to_string(),
      body: "You have a new notification".to_string(),
      icon: "/assets/icons/icon-192.png".to_string(),
      badge: "/assets/icons/badge-72.png".to_string(),
      tag: "default".to_string(),
    }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:3000/").expect("static origin parses"),
      version: "v2.0".to_string(),
      partition_prefix: "lifeline".to_string(),
      allowed_origins: vec![
        "https://api.lifeline-health.example".to_string(),
        "https://fonts.googleapis.com".to_string(),
        "https://fonts.gstatic.com".to_string(),
      ],
      root_document: "/index.html".to_string(),
      essential_resources: vec![
        "/index.html".to_string(),
        "/manifest.json".to_string(),
        "/".to_string(),
      ],
      api_endpoints: vec![
        "/api/v1/doctors".to_string(),
        "/api/v1/pharmacies".to_string(),
        "/api/v1/emergency-contacts".to_string(),
        "/api/v1/villages".to_string(),
        "/api/v1/specializations".to_string(),
      ],
      image_resources: vec![
        "/assets/img/logo.svg".to_string(),
        "/assets/img/hero-banner.jpg".to_string(),
        "/assets/icons/medical-icons.svg".to_string(),
      ],
      mutation_routes: vec![
        MutationRoute {
          prefix: "/api/appointments".to_string(),
          method: "POST".to_string(),
          tag: SyncTag::Booking,
        },
        MutationRoute {
          prefix: "/api/emergency".to_string(),
          method: "POST".to_string(),
          tag: SyncTag::EmergencyAlert,
        },
        MutationRoute {
          prefix: "/api/symptoms".to_string(),
          method: "POST".to_string(),
          tag: SyncTag::SymptomAnalysis,
        },
      ],
      sync: SyncConfig::default(),
      notifications: NotificationDefaults::default(),
      database: None,
      log_dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./lifeline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/lifeline/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("lifeline.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("lifeline").join("config.yaml");
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

  /// Resolve a configured path (e.g. "/manifest.json") against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid resource path '{}': {}", path, e))
  }

  pub fn root_document_url(&self) -> Result<Url> {
    self.resolve(&self.root_document)
  }

  /// Origins (besides our own) whose requests are intercepted.
  pub fn is_allowed_origin(&self, url: &Url) -> bool {
    let origin = url.origin().ascii_serialization();
    origin == self.origin.origin().ascii_serialization()
      || self
        .allowed_origins
        .iter()
        .any(|allowed| allowed.trim_end_matches('/') == origin)
  }

  pub fn partition_name(&self, class: &str) -> String {
    format!("{}-{}-{}", self.partition_prefix, class, self.version)
  }

  /// Route table lookup for a mutating request.
  pub fn mutation_tag(&self, method: &str, path: &str) -> Option<SyncTag> {
    self
      .mutation_routes
      .iter()
      .find(|route| route.method.eq_ignore_ascii_case(method) && path.starts_with(&route.prefix))
      .map(|route| route.tag)
  }

  /// Database path, defaulting to the platform data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("lifeline").join("lifeline.db"))
  }
}
