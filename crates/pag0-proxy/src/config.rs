//! Configuration loading.
//!
//! Resolution order: explicit path argument (CLI), then the `PAG0_CONFIG`
//! environment variable, then built-in defaults. Config files are YAML and
//! every section is optional thanks to `#[serde(default)]`.

use pag0_core::{Pag0Config, Pag0Error, Result};
use std::path::Path;
use tracing::info;

/// Load the proxy configuration.
///
/// `path` wins over the `PAG0_CONFIG` environment variable; if neither is
/// set, defaults are used.
pub fn load_config(path: Option<&str>) -> Result<Pag0Config> {
    let resolved = path
        .map(String::from)
        .or_else(|| std::env::var("PAG0_CONFIG").ok());

    match resolved {
        Some(p) => {
            info!(path = %p, "Loading configuration file");
            load_from_file(&p)
        }
        None => {
            info!("No configuration file specified, using defaults");
            Ok(Pag0Config::default())
        }
    }
}

/// Read and parse a YAML configuration file.
fn load_from_file(path: &str) -> Result<Pag0Config> {
    if !Path::new(path).exists() {
        return Err(Pag0Error::Config(format!(
            "configuration file '{path}' does not exist"
        )));
    }
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Pag0Error::Config(format!("failed to read '{path}': {e}")))?;
    let config: Pag0Config = serde_yaml::from_str(&contents)
        .map_err(|e| Pag0Error::Config(format!("failed to parse '{path}': {e}")))?;
    validate(&config)?;
    Ok(config)
}

/// Sanity-check values that serde cannot express.
fn validate(config: &Pag0Config) -> Result<()> {
    if config.listen_addr.parse::<std::net::SocketAddr>().is_err() {
        return Err(Pag0Error::Config(format!(
            "invalid listen_addr '{}'",
            config.listen_addr
        )));
    }
    if config.timeout_ms == 0 {
        return Err(Pag0Error::Config("timeout_ms must be non-zero".to_string()));
    }
    let w = &config.curation.weights;
    let sum = w.cost + w.latency + w.reliability + w.reputation;
    if (sum - 1.0).abs() > 0.01 {
        return Err(Pag0Error::Config(format!(
            "curation weights must sum to 1.0 (got {sum})"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
