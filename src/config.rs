use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "FILE_RELAY_";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

/// Where object bytes are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Directory tree under `storage_dir`. Upload content types are not kept.
    Local,
    /// S3-compatible service at `s3_endpoint`.
    S3,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" | "minio" => Ok(Self::S3),
            other => bail!("unknown storage backend `{}` (expected `local` or `s3`)", other),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub storage_backend: StorageBackend,
    pub storage_dir: String,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub s3_region: String,
    pub max_upload_bytes: usize,
    pub store_timeout: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "File relay: upload files, download them by identifier")]
pub struct Args {
    /// Host to bind to (overrides FILE_RELAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_RELAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Metadata database URL (overrides FILE_RELAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Object storage backend, `local` or `s3` (overrides FILE_RELAY_STORAGE_BACKEND).
    /// `local` does not keep the content type declared on upload.
    #[arg(long)]
    pub storage_backend: Option<String>,

    /// Directory for the local backend (overrides FILE_RELAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// S3 endpoint, e.g. http://127.0.0.1:9000 (overrides FILE_RELAY_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// S3 access key (overrides FILE_RELAY_S3_ACCESS_KEY)
    #[arg(long)]
    pub s3_access_key: Option<String>,

    /// S3 secret key (overrides FILE_RELAY_S3_SECRET_KEY)
    #[arg(long)]
    pub s3_secret_key: Option<String>,

    /// S3 region (overrides FILE_RELAY_S3_REGION)
    #[arg(long)]
    pub s3_region: Option<String>,

    /// Largest accepted upload body in bytes (overrides FILE_RELAY_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Timeout for each metadata/object store call (overrides FILE_RELAY_STORE_TIMEOUT_SECS)
    #[arg(long)]
    pub store_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over values from `lookup` (keyed by full env var name) over defaults.
    pub fn from_sources(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env_value = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        // --- Environment fallback ---
        let env_host = env_value("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_env(&env_value, "PORT")?.unwrap_or(8080);
        let env_db = env_value("DATABASE_URL")
            .unwrap_or_else(|| "sqlite://./data/meta/file_relay.db".into());
        let env_storage = env_value("STORAGE_DIR").unwrap_or_else(|| "./data/objects".into());
        let env_region = env_value("S3_REGION").unwrap_or_else(|| "us-east-1".into());
        let env_max_upload =
            parse_env(&env_value, "MAX_UPLOAD_BYTES")?.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);
        let env_timeout = parse_env(&env_value, "STORE_TIMEOUT_SECS")?.unwrap_or(30);

        let backend_raw = args
            .storage_backend
            .or_else(|| env_value("STORAGE_BACKEND"))
            .unwrap_or_else(|| "local".into());
        let storage_backend = backend_raw
            .parse::<StorageBackend>()
            .context("reading storage backend")?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            storage_backend,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            s3_endpoint: args.s3_endpoint.or_else(|| env_value("S3_ENDPOINT")),
            s3_access_key: args.s3_access_key.or_else(|| env_value("S3_ACCESS_KEY")),
            s3_secret_key: args.s3_secret_key.or_else(|| env_value("S3_SECRET_KEY")),
            s3_region: args.s3_region.unwrap_or(env_region),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max_upload),
            store_timeout: Duration::from_secs(args.store_timeout_secs.unwrap_or(env_timeout)),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.storage_backend == StorageBackend::S3 && self.s3_endpoint.is_none() {
            bail!("{}S3_ENDPOINT is required for the s3 storage backend", ENV_PREFIX);
        }
        if self.max_upload_bytes == 0 {
            bail!("max upload size must be greater than zero");
        }
        if self.store_timeout.is_zero() {
            bail!("store timeout must be greater than zero");
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Debug output is logged at startup, so credentials are masked.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("storage_backend", &self.storage_backend)
            .field("storage_dir", &self.storage_dir)
            .field("s3_endpoint", &self.s3_endpoint)
            .field("s3_access_key", &self.s3_access_key.as_ref().map(|_| "***"))
            .field("s3_secret_key", &self.s3_secret_key.as_ref().map(|_| "***"))
            .field("s3_region", &self.s3_region)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("store_timeout", &self.store_timeout)
            .finish()
    }
}

fn parse_env<T>(env_value: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_value(name) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {}{} value `{}`", ENV_PREFIX, name, value)),
        None => Ok(None),
    }
}
