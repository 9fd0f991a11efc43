use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub db_file: String,
    pub secret_file: String,
    pub message_page_size: usize,
    pub preview_chars: usize,
    pub catalog_path: Option<PathBuf>,
    pub require_cipher: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./journal-data"),
            db_file: "persona.db".to_string(),
            secret_file: "secrets.json".to_string(),
            message_page_size: 50,
            preview_chars: 80,
            catalog_path: None,
            require_cipher: true,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from any variable source; unset values take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let message_page_size: usize =
            parse_var(&lookup, "JOURNAL_MESSAGE_PAGE_SIZE", defaults.message_page_size)?;
        if message_page_size == 0 {
            return Err(anyhow::anyhow!("JOURNAL_MESSAGE_PAGE_SIZE must be at least 1"));
        }

        Ok(Self {
            data_dir: lookup("JOURNAL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            db_file: lookup("JOURNAL_DB_FILE").unwrap_or(defaults.db_file),
            secret_file: lookup("JOURNAL_SECRET_FILE").unwrap_or(defaults.secret_file),
            message_page_size,
            preview_chars: parse_var(&lookup, "JOURNAL_PREVIEW_CHARS", defaults.preview_chars)?,
            catalog_path: lookup("JOURNAL_CATALOG_PATH")
                .filter(|path| !path.trim().is_empty())
                .map(PathBuf::from),
            require_cipher: parse_var(&lookup, "JOURNAL_REQUIRE_CIPHER", defaults.require_cipher)?,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_file)
    }

    pub fn secret_path(&self) -> PathBuf {
        self.data_dir.join(&self.secret_file)
    }

    pub fn log_summary(&self) {
        info!("Current Configuration:");
        info!("- Database: {}", self.db_path().display());
        info!("- Secret store: {}", self.secret_path().display());
        info!("- Message page size: {}", self.message_page_size);
        info!("- Preview length: {} chars", self.preview_chars);
        match &self.catalog_path {
            Some(path) => info!("- Persona catalog: {}", path.display()),
            None => info!("- Persona catalog: embedded"),
        }
        info!("- Require cipher: {}", self.require_cipher);
    }
}

fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", name, raw)),
        None => Ok(default),
    }
}
