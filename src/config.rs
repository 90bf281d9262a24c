use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration, read-only after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind host (default: 0.0.0.0)
    pub host: String,

    /// Bind port (default: 8080)
    pub port: u16,

    /// Document root; made absolute by `finalize`.
    pub docroot: PathBuf,

    /// Realm name presented in Basic-auth challenges.
    pub realm: String,

    /// Budget for any single I/O readiness wait.
    pub network_timeout: Duration,

    /// Resolve paths with realpath and refuse anything a symlink escape
    /// could reach.
    pub no_symlinks: bool,

    /// Disable generated directory listings.
    pub no_dirlists: bool,

    /// Index files tried, in order, for directory requests.
    pub index_files: Vec<String>,
}

pub const DEFAULT_INDEX_FILES: &[&str] = &["index.html", "index.htm", "default.html", "default.htm"];

impl Config {
    /// Load configuration from environment variables (with .env support).
    pub fn from_env() -> Self {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        Config {
            host: std::env::var("POSTERN_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("POSTERN_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .unwrap_or(8080),
            docroot: PathBuf::from(
                std::env::var("POSTERN_DOCROOT").unwrap_or_else(|_| "/www".to_string()),
            ),
            realm: std::env::var("POSTERN_REALM")
                .unwrap_or_else(|_| "Protected Area".to_string()),
            network_timeout: Duration::from_secs(
                std::env::var("POSTERN_TIMEOUT")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            ),
            no_symlinks: env_flag("POSTERN_NO_SYMLINKS"),
            no_dirlists: env_flag("POSTERN_NO_DIRLISTS"),
            index_files: DEFAULT_INDEX_FILES.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Pin the docroot down to an absolute, symlink-free path. Resolution
    /// and the jail check both depend on this.
    pub fn finalize(&mut self) -> io::Result<()> {
        self.docroot = fs::canonicalize(&self.docroot)?;
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
        .unwrap_or(false)
}
