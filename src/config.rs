use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base directory for all on-disk pipeline state.
    #[serde(default = "default_event_root")]
    pub event_root: PathBuf,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub processing: ProcessingConfig,

    #[serde(default)]
    pub watcher: WatcherConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of processing worker threads
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Maximum cosine distance for a face to join an existing person cluster
    #[serde(default = "default_cluster_threshold")]
    pub cluster_threshold: f32,

    /// Longest-edge pixel budget for the normalized JPEG
    #[serde(default = "default_max_image_size")]
    pub max_image_size: u32,

    /// Square edge pixels for the thumbnail
    #[serde(default = "default_thumbnail_size")]
    pub thumbnail_size: u32,

    /// Photos processed per batch before switching to the upload phase
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_worker_count() -> usize { 4 }
fn default_cluster_threshold() -> f32 { 0.6 }
fn default_max_image_size() -> u32 { 2048 }
fn default_thumbnail_size() -> u32 { 300 }
fn default_batch_size() -> usize { 20 }

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            cluster_threshold: default_cluster_threshold(),
            max_image_size: default_max_image_size(),
            thumbnail_size: default_thumbnail_size(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Seconds between periodic drop-zone scans
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,

    /// Lowercased file suffixes accepted for ingestion (without the dot)
    #[serde(default = "default_supported_extensions")]
    pub supported_extensions: Vec<String>,
}

fn default_scan_interval() -> u64 { 30 }

fn default_supported_extensions() -> Vec<String> {
    [
        "jpg", "jpeg", "png", "webp", "avif", "heic", "heif", "bmp", "tiff", "tif", "gif",
        "cr2", "nef", "arw", "dng", "orf", "rw2", "raf", "pef",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            scan_interval: default_scan_interval(),
            supported_extensions: default_supported_extensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Log intended effects without mutating the tree or the remote
    #[serde(default)]
    pub dry_run: bool,

    /// Prefer hardlinks over copies when fanning out
    #[serde(default = "default_use_hardlinks")]
    pub use_hardlinks: bool,
}

fn default_use_hardlinks() -> bool { true }

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            use_hardlinks: default_use_hardlinks(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Credentials file handed to the remote-store backend
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,

    /// Remote folder id under which the event tree is mirrored
    #[serde(default)]
    pub root_folder_id: Option<String>,

    /// Connect timeout for remote calls (seconds)
    #[serde(default = "default_timeout_connect")]
    pub timeout_connect: u64,

    /// Read timeout for remote calls (seconds)
    #[serde(default = "default_timeout_read")]
    pub timeout_read: u64,

    /// Maximum retries before an upload job is frozen
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry delay in seconds, doubled per attempt
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,

    /// Pending uploads fetched per drain round
    #[serde(default = "default_upload_batch_size")]
    pub batch_size: usize,

    /// Master switch for the upload queue
    #[serde(default = "default_queue_enabled")]
    pub queue_enabled: bool,
}

fn default_timeout_connect() -> u64 { 10 }
fn default_timeout_read() -> u64 { 30 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_delay() -> u64 { 2 }
fn default_upload_batch_size() -> usize { 5 }
fn default_queue_enabled() -> bool { true }

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            credentials_file: None,
            root_folder_id: None,
            timeout_connect: default_timeout_connect(),
            timeout_read: default_timeout_read(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            batch_size: default_upload_batch_size(),
            queue_enabled: default_queue_enabled(),
        }
    }
}

fn default_event_root() -> PathBuf {
    PathBuf::from("./EventRoot")
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facefan")
        .join("facefan.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            event_root: default_event_root(),
            database: DatabaseConfig::default(),
            processing: ProcessingConfig::default(),
            watcher: WatcherConfig::default(),
            routing: RoutingConfig::default(),
            remote: RemoteConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            // Create default config
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        // Ensure parent directory exists
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("FACEFAN_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Get the facefan configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facefan")
    }

    pub fn db_path(&self) -> &PathBuf {
        &self.database.path
    }

    pub fn incoming_dir(&self) -> PathBuf {
        self.event_root.join("Incoming")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.event_root.join("Processed")
    }

    pub fn people_dir(&self) -> PathBuf {
        self.event_root.join("People")
    }

    pub fn no_faces_dir(&self) -> PathBuf {
        self.event_root.join("Admin").join("NoFaces")
    }

    pub fn errors_dir(&self) -> PathBuf {
        self.event_root.join("Admin").join("Errors")
    }

    /// Create every directory the pipeline writes into.
    pub fn ensure_directories(&self) -> Result<()> {
        let dirs = [
            self.incoming_dir(),
            self.processed_dir(),
            self.people_dir(),
            self.no_faces_dir(),
            self.errors_dir(),
        ];
        for dir in &dirs {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(parent) = self.database.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn is_supported_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .map(|e| self.watcher.supported_extensions.iter().any(|s| s == &e))
            .unwrap_or(false)
    }
}
