use std::path::PathBuf;
use std::process;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use postern::{Config, Server};

#[derive(Parser)]
#[command(name = "postern")]
#[command(about = "Small HTTP/1.x origin server for embedded routers and appliances")]
#[command(version)]
struct Cli {
    /// Bind address
    #[arg(long)]
    listen: Option<String>,

    /// Bind port
    #[arg(short, long)]
    port: Option<u16>,

    /// Document root
    #[arg(short, long)]
    docroot: Option<PathBuf>,

    /// Realm name presented in Basic-auth challenges
    #[arg(short, long)]
    realm: Option<String>,

    /// Network timeout in seconds
    #[arg(short = 'T', long)]
    timeout: Option<u64>,

    /// Resolve symlinks and refuse targets outside the document root
    #[arg(short = 'S', long)]
    no_symlinks: bool,

    /// Disable generated directory listings
    #[arg(short = 'D', long)]
    no_dirlists: bool,

    /// Index file tried for directory requests (repeatable, ordered)
    #[arg(short = 'i', long = "index", value_name = "FILE")]
    index: Vec<String>,

    /// Protect a URL prefix: "PATH:USER:PASS", where PASS may name a system
    /// account as "$p$account" (repeatable)
    #[arg(long = "auth", value_name = "PATH:USER:PASS")]
    auth: Vec<String>,
}

fn main() {
    init_logging();

    let cli = Cli::parse();
    let mut cfg = Config::from_env();

    if let Some(host) = cli.listen {
        cfg.host = host;
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(docroot) = cli.docroot {
        cfg.docroot = docroot;
    }
    if let Some(realm) = cli.realm {
        cfg.realm = realm;
    }
    if let Some(secs) = cli.timeout {
        cfg.network_timeout = Duration::from_secs(secs);
    }
    cfg.no_symlinks |= cli.no_symlinks;
    cfg.no_dirlists |= cli.no_dirlists;
    if !cli.index.is_empty() {
        cfg.index_files = cli.index;
    }

    let mut server = match Server::new(cfg) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            process::exit(1);
        }
    };

    for spec in &cli.auth {
        match parse_auth_spec(spec) {
            Some((path, user, pass)) => {
                if !server.add_realm(path, user, pass) {
                    warn!(spec = spec.as_str(), "auth realm not registered");
                }
            }
            None => {
                error!(spec = spec.as_str(), "--auth expects PATH:USER:PASS");
                process::exit(1);
            }
        }
    }

    if let Err(e) = server.bind() {
        error!(error = %e, "bind failed");
        process::exit(1);
    }

    let flag = server.shutdown_handle();
    ctrlc::set_handler(move || flag.store(true, Ordering::Release))
        .expect("failed to install signal handler");

    if let Err(e) = server.run() {
        error!(error = %e, "server exited with error");
        process::exit(1);
    }
}

fn parse_auth_spec(spec: &str) -> Option<(&str, &str, &str)> {
    let (path, rest) = spec.split_once(':')?;
    let (user, pass) = rest.split_once(':')?;
    if path.is_empty() || user.is_empty() {
        return None;
    }
    Some((path, user, pass))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
