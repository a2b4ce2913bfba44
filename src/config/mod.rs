// sitebackup/src/config/mod.rs
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use url::Url;

use crate::errors::{AppError, Result};
use crate::utils::command::SshTarget;

pub const DEFAULT_OUTPUT_ROOT: &str = "./backups";
/// 1 GiB keeps every chunk well below the 5 GiB single-PUT limit.
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 1024 * 1024 * 1024;
pub const MAX_CHUNK_SIZE_BYTES: u64 = 5 * 1024 * 1024 * 1024;
pub const DEFAULT_ACL: &str = "private";
pub const DEFAULT_SSH_PORT: u16 = 22;

const KNOWN_ACLS: &[&str] = &[
    "private",
    "authenticated-read",
    "aws-exec-read",
    "bucket-owner-read",
    "bucket-owner-full-control",
    "public-read",
    "public-read-write",
];

pub const ENV_DB_PASSWORD: &str = "SITEBACKUP_DB_PASSWORD";
pub const ENV_S3_ACCESS_KEY_ID: &str = "SITEBACKUP_S3_ACCESS_KEY_ID";
pub const ENV_S3_SECRET_ACCESS_KEY: &str = "SITEBACKUP_S3_SECRET_ACCESS_KEY";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonWebServerConfig {
    pub username: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub app_root: Option<String>,
    pub media_path: Option<String>,
    pub maintenance_flag: Option<bool>,
}

#[derive(Clone, Default, Deserialize)]
pub struct JsonDatabaseConfig {
    pub ssh_username: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u16>,
    pub db_username: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub dump_command: Option<String>,
}

#[derive(Clone, Default, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub acl: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonSshConfig {
    pub ssh_bin: Option<String>,
    pub rsync_bin: Option<String>,
    pub batch_mode: Option<bool>,
}

#[derive(Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub site_name: Option<String>,
    pub output_root: Option<PathBuf>,
    pub chunk_size_bytes: Option<u64>,
    pub cleanup: Option<bool>,
    pub exclude_paths: Option<Vec<String>>,
    pub webserver: Option<JsonWebServerConfig>,
    pub database: Option<JsonDatabaseConfig>,
    pub s3_storage: Option<JsonS3StorageConfig>,
    pub ssh: Option<JsonSshConfig>,
}

/// A string that never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("\"***\"")
    }
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct WebServerConfig {
    pub ssh: SshTarget,
    pub app_root: String,
    pub media_path: String,
    pub maintenance_flag: bool,
}

impl WebServerConfig {
    /// Path of the flag file whose presence puts the application in maintenance mode.
    pub fn maintenance_flag_path(&self) -> String {
        format!("{}/maintenance.flag", self.app_root.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub ssh: SshTarget,
    pub db_username: String,
    pub password: Secret,
    pub database: String,
    pub dump_command: String,
}

#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: Option<String>,
    pub region: String,
    pub access_key_id: Secret,
    pub secret_access_key: Secret,
    pub bucket_name: String,
    pub acl: String,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub ssh_bin: String,
    pub rsync_bin: String,
    pub batch_mode: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            ssh_bin: "ssh".to_string(),
            rsync_bin: "rsync".to_string(),
            batch_mode: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub site_name: String,
    pub output_root: PathBuf,
    pub chunk_size_bytes: u64,
    pub cleanup: bool,
    pub exclude_paths: Vec<PathBuf>,
    pub webserver: WebServerConfig,
    pub database: DatabaseConfig,
    pub spaces_config: SpacesConfig,
    pub transport: TransportConfig,
}

impl AppConfig {
    /// Reads `config_path` and applies secret overrides from the process environment.
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path).map_err(|e| {
            AppError::Config(format!(
                "Failed to read config file at {}: {}",
                config_path.display(),
                e
            ))
        })?;
        Self::from_json_str(&config_content, |name| std::env::var(name).ok())
    }

    /// Parses and validates a JSON document. `env` resolves secret overrides.
    pub fn from_json_str<F>(content: &str, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw: RawJsonConfig = serde_json::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config JSON: {}", e)))?;
        Self::from_raw(raw, env)
    }

    fn from_raw<F>(raw: RawJsonConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let site_name = required(raw.site_name, "site_name")?;
        if site_name.contains(|c: char| !c.is_alphanumeric() && c != '_' && c != '-') {
            return Err(AppError::Config(format!(
                "site_name may only contain letters, digits, '_' and '-': {}",
                site_name
            )));
        }

        let chunk_size_bytes = raw.chunk_size_bytes.unwrap_or(DEFAULT_CHUNK_SIZE_BYTES);
        if chunk_size_bytes == 0 || chunk_size_bytes > MAX_CHUNK_SIZE_BYTES {
            return Err(AppError::Config(format!(
                "chunk_size_bytes must be between 1 and {} (got {})",
                MAX_CHUNK_SIZE_BYTES, chunk_size_bytes
            )));
        }

        let exclude_paths = raw
            .exclude_paths
            .unwrap_or_default()
            .into_iter()
            .map(|p| validate_exclude_path(&p))
            .collect::<Result<Vec<_>>>()?;

        let output_root = raw
            .output_root
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_ROOT));

        Ok(AppConfig {
            site_name,
            output_root,
            chunk_size_bytes,
            cleanup: raw.cleanup.unwrap_or(true),
            exclude_paths,
            webserver: load_webserver(raw.webserver.unwrap_or_default())?,
            database: load_database(raw.database.unwrap_or_default(), &env)?,
            spaces_config: load_spaces(raw.s3_storage.unwrap_or_default(), &env)?,
            transport: load_transport(raw.ssh.unwrap_or_default()),
        })
    }
}

fn load_webserver(raw: JsonWebServerConfig) -> Result<WebServerConfig> {
    Ok(WebServerConfig {
        ssh: SshTarget {
            user: required(raw.username, "webserver.username")?,
            host: required(raw.hostname, "webserver.hostname")?,
            port: raw.port.unwrap_or(DEFAULT_SSH_PORT),
        },
        app_root: required(raw.app_root, "webserver.app_root")?,
        media_path: required(raw.media_path, "webserver.media_path")?,
        maintenance_flag: raw.maintenance_flag.unwrap_or(false),
    })
}

fn load_database<F>(raw: JsonDatabaseConfig, env: &F) -> Result<DatabaseConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let password = env(ENV_DB_PASSWORD)
        .or(raw.password)
        .context_required("database.password", ENV_DB_PASSWORD)?;
    Ok(DatabaseConfig {
        ssh: SshTarget {
            user: required(raw.ssh_username, "database.ssh_username")?,
            host: required(raw.hostname, "database.hostname")?,
            port: raw.port.unwrap_or(DEFAULT_SSH_PORT),
        },
        db_username: required(raw.db_username, "database.db_username")?,
        password: Secret::new(password),
        database: required(raw.database, "database.database")?,
        dump_command: raw
            .dump_command
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "mysqldump".to_string()),
    })
}

fn load_spaces<F>(raw: JsonS3StorageConfig, env: &F) -> Result<SpacesConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let access_key_id = env(ENV_S3_ACCESS_KEY_ID)
        .or(raw.access_key_id)
        .context_required("s3_storage.access_key_id", ENV_S3_ACCESS_KEY_ID)?;
    let secret_access_key = env(ENV_S3_SECRET_ACCESS_KEY)
        .or(raw.secret_access_key)
        .context_required("s3_storage.secret_access_key", ENV_S3_SECRET_ACCESS_KEY)?;

    let endpoint_url = match raw.endpoint_url.filter(|s| !s.trim().is_empty()) {
        Some(endpoint) => {
            Url::parse(&endpoint).map_err(|e| {
                AppError::Config(format!("s3_storage.endpoint_url is not a valid URL ({}): {}", endpoint, e))
            })?;
            Some(endpoint)
        }
        None => None,
    };

    let acl = raw
        .acl
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ACL.to_string());
    if !KNOWN_ACLS.contains(&acl.as_str()) {
        return Err(AppError::Config(format!("s3_storage.acl is not a canned ACL: {}", acl)));
    }
    if acl.starts_with("public-") {
        return Err(AppError::Config(format!(
            "s3_storage.acl must not make backups public: {}",
            acl
        )));
    }

    Ok(SpacesConfig {
        endpoint_url,
        region: raw
            .region
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "us-east-1".to_string()),
        access_key_id: Secret::new(access_key_id),
        secret_access_key: Secret::new(secret_access_key),
        bucket_name: required(raw.bucket_name, "s3_storage.bucket_name")?,
        acl,
    })
}

fn load_transport(raw: JsonSshConfig) -> TransportConfig {
    let defaults = TransportConfig::default();
    TransportConfig {
        ssh_bin: raw.ssh_bin.filter(|s| !s.trim().is_empty()).unwrap_or(defaults.ssh_bin),
        rsync_bin: raw
            .rsync_bin
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.rsync_bin),
        batch_mode: raw.batch_mode.unwrap_or(defaults.batch_mode),
    }
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    value
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AppError::Config(format!("{} must be set in config.json", field)))
}

trait RequiredSecret {
    fn context_required(self, field: &str, env_name: &str) -> Result<String>;
}

impl RequiredSecret for Option<String> {
    fn context_required(self, field: &str, env_name: &str) -> Result<String> {
        self.filter(|s| !s.is_empty()).ok_or_else(|| {
            AppError::Config(format!(
                "{} must be set in config.json or via {}",
                field, env_name
            ))
        })
    }
}

/// Exclusions are removed from the staged code tree, so they must stay inside it.
fn validate_exclude_path(path: &str) -> Result<PathBuf> {
    let candidate = PathBuf::from(path.trim());
    let escapes = candidate
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if candidate.as_os_str().is_empty() || escapes || candidate.components().all(|c| c == Component::CurDir) {
        return Err(AppError::Config(format!(
            "exclude_paths entries must be relative paths inside the application root: {:?}",
            path
        )));
    }
    Ok(candidate)
}
