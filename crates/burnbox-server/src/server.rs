use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use rand::RngCore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::require_api_key,
    crypto::{kdf::MIN_PBKDF2_ITERATIONS, KdfAlgorithm, KeyDerivation},
    handlers::{generate_secret, get_secret, health},
    lifecycle::{Salt, SecretManager, DEFAULT_TTL},
    store::{MemoryStore, RedbStore, SecretStore},
    AppState,
};

const SALT_FILE: &str = "burnbox.salt";
const DB_FILE: &str = "burnbox.db";
const GENERATED_SALT_LEN: usize = 32;

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Keep secrets in memory only; nothing is written to disk.
    pub ephemeral: bool,
    /// Server-wide salt ($BURNBOX_SALT).
    pub salt: Option<String>,
    /// File holding the salt ($BURNBOX_SALT_FILE); preferred over `salt`.
    pub salt_file: Option<PathBuf>,
    pub ttl: Duration,
    pub sweep_interval: Duration,
    pub kdf: KdfAlgorithm,
    pub pbkdf2_iterations: u32,
    pub per_secret_salt: bool,
    pub kdf_workers: usize,
    /// Optional bearer token guarding the secret routes.
    pub api_key: Option<String>,
    pub cors_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("BURNBOX_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("BURNBOX_PORT").unwrap_or(8080),
            data_dir: std::env::var("BURNBOX_DATA_DIR").ok().map(PathBuf::from),
            ephemeral: false,
            salt: std::env::var("BURNBOX_SALT").ok(),
            salt_file: std::env::var("BURNBOX_SALT_FILE").ok().map(PathBuf::from),
            ttl: env_parse("BURNBOX_TTL_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TTL),
            sweep_interval: Duration::from_secs(env_parse("BURNBOX_SWEEP_SECONDS").unwrap_or(60)),
            kdf: std::env::var("BURNBOX_KDF")
                .ok()
                .and_then(|v| match v.parse() {
                    Ok(kdf) => Some(kdf),
                    Err(e) => {
                        warn!(error = %e, "ignoring BURNBOX_KDF, using pbkdf2");
                        None
                    }
                })
                .unwrap_or_default(),
            pbkdf2_iterations: env_parse("BURNBOX_PBKDF2_ITERATIONS")
                .unwrap_or(MIN_PBKDF2_ITERATIONS),
            per_secret_salt: std::env::var("BURNBOX_PER_SECRET_SALT")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            kdf_workers: env_parse("BURNBOX_KDF_WORKERS").unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4)
            }),
            api_key: std::env::var("BURNBOX_API_KEY").ok(),
            cors_origins: std::env::var("BURNBOX_CORS_ORIGINS").ok(),
        }
    }
}

impl ServerConfig {
    /// Reject settings that would weaken derivation or break the sweep.
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            anyhow::bail!("BURNBOX_TTL_SECONDS must be greater than zero");
        }
        if self.sweep_interval.is_zero() {
            anyhow::bail!("BURNBOX_SWEEP_SECONDS must be greater than zero");
        }
        if self.kdf == KdfAlgorithm::Pbkdf2 && self.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
            anyhow::bail!(
                "BURNBOX_PBKDF2_ITERATIONS must be at least {MIN_PBKDF2_ITERATIONS} (got {})",
                self.pbkdf2_iterations
            );
        }
        if self.kdf_workers == 0 {
            anyhow::bail!("BURNBOX_KDF_WORKERS must be at least 1");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Read a secret value from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_secret_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read secret file: {}", path.display()))?;
    let value = content.trim().to_string();
    if value.is_empty() {
        anyhow::bail!("secret file is empty: {}", path.display());
    }
    Ok(value)
}

/// Resolve the data directory, creating it if needed. `data_dir` already
/// carries any `BURNBOX_DATA_DIR` override from `ServerConfig`.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    match data_dir {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::platform_data_dir(),
    }
}

/// Resolve the server-wide salt.
///
/// Priority: `salt_file`, then `salt`, then `<data_dir>/burnbox.salt`
/// (generated on first start). Without a data dir (ephemeral mode) and with
/// nothing configured, a random salt lives for the process lifetime only.
pub fn resolve_salt(cfg: &ServerConfig, data_dir: Option<&Path>) -> Result<Salt> {
    if let Some(path) = &cfg.salt_file {
        let salt = read_secret_file(path)?;
        if cfg.salt.is_some() {
            warn!("both BURNBOX_SALT and BURNBOX_SALT_FILE are set; using file");
        }
        return Salt::new(salt);
    }
    if let Some(salt) = &cfg.salt {
        return Salt::new(salt.clone()).context("BURNBOX_SALT");
    }
    match data_dir {
        Some(dir) => load_or_create_salt(dir),
        None => Salt::new(random_salt().to_vec()),
    }
}

fn load_or_create_salt(data_dir: &Path) -> Result<Salt> {
    let salt_path = data_dir.join(SALT_FILE);
    if salt_path.exists() {
        let bytes = std::fs::read(&salt_path).context("read burnbox.salt")?;
        Salt::new(bytes).context("burnbox.salt is corrupt")
    } else {
        let salt = random_salt();
        std::fs::write(&salt_path, salt).context("write burnbox.salt")?;
        info!(path = %salt_path.display(), "generated new salt");
        Salt::new(salt.to_vec())
    }
}

fn random_salt() -> [u8; GENERATED_SALT_LEN] {
    let mut salt = [0u8; GENERATED_SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Build the lifecycle manager and its store from configuration, and start
/// the store's expiry sweep.
pub fn build_manager(cfg: &ServerConfig) -> Result<SecretManager> {
    cfg.validate()?;

    let data_dir = if cfg.ephemeral {
        None
    } else {
        Some(resolve_data_dir(cfg.data_dir.as_ref())?)
    };
    let salt = resolve_salt(cfg, data_dir.as_deref())?;

    // Fail at startup, not on every request, if the KDF rejects this salt.
    let kdf = cfg.kdf.build(cfg.pbkdf2_iterations);
    kdf.derive(b"", salt.as_bytes())
        .with_context(|| format!("salt is not usable with {:?}", cfg.kdf))?;

    let store: Arc<dyn SecretStore> = match &data_dir {
        None => {
            info!("ephemeral mode: secrets are kept in memory only");
            let store = Arc::new(MemoryStore::new());
            Arc::clone(&store).spawn_sweep(cfg.sweep_interval);
            store
        }
        Some(dir) => {
            info!(data_dir = %dir.display(), "using data directory");
            let store = Arc::new(RedbStore::open(&dir.join(DB_FILE)).context("open store")?);
            Arc::clone(&store).spawn_sweep(cfg.sweep_interval);
            store
        }
    };

    info!(
        kdf = ?cfg.kdf,
        ttl_seconds = cfg.ttl.as_secs(),
        per_secret_salt = cfg.per_secret_salt,
        workers = cfg.kdf_workers,
        "secret manager ready"
    );

    Ok(SecretManager::new(store, salt)
        .with_kdf(kdf)
        .with_ttl(cfg.ttl)
        .with_per_secret_salt(cfg.per_secret_salt)
        .with_workers(cfg.kdf_workers))
}

/// Routes without transport layers (CORS, tracing). `/health` is always open.
pub fn router(state: AppState) -> Router {
    let public = Router::new().route("/health", get(health));

    let protected = Router::new()
        .route("/generate", post(generate_secret))
        .route("/secrets/{secret_key}", post(get_secret))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .merge(public)
        .merge(protected)
        .with_state(state)
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let manager = build_manager(&cfg)?;

    if cfg.api_key.is_none() {
        warn!("BURNBOX_API_KEY is not set; secret routes are unauthenticated");
    }

    let state = AppState {
        manager,
        api_key: cfg.api_key.clone(),
    };

    let app = router(state)
        .layer(build_cors(cfg.cors_origins.as_deref()))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "burnbox server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
