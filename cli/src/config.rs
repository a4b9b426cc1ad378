//! Loading the bridge configuration from TOML.

use std::env;
use std::path::{Path, PathBuf};

use tether_lsp::BridgeConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// `<config dir>/tether/config.toml`.
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tether").join("config.toml"))
}

/// Load from `explicit`, or from [`config_path`] when it exists.
///
/// An explicit path must be readable. A missing default file yields the
/// default configuration.
pub fn load(explicit: Option<&Path>) -> Result<BridgeConfig, ConfigError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match config_path() {
            Some(path) if path.exists() => path,
            _ => {
                tracing::debug!("No config file, using defaults");
                return Ok(BridgeConfig::default());
            }
        },
    };

    let content = std::fs::read_to_string(&path).map_err(|source| {
        tracing::warn!("Failed to read config at {}: {source}", path.display());
        ConfigError::Read {
            path: path.clone(),
            source,
        }
    })?;
    let mut config = parse(&content).map_err(|source| {
        tracing::warn!("Failed to parse config at {}: {source}", path.display());
        ConfigError::Parse {
            path: path.clone(),
            source,
        }
    })?;

    expand_server_env(&mut config);
    tracing::info!(path = %path.display(), "Loaded config");
    Ok(config)
}

fn parse(content: &str) -> Result<BridgeConfig, toml::de::Error> {
    toml::from_str(content)
}

fn expand_server_env(config: &mut BridgeConfig) {
    let server = &mut config.server;
    server.command = expand_env_vars(&server.command);
    for arg in &mut server.args {
        *arg = expand_env_vars(arg);
    }
    if let Some(socket) = server.socket.as_mut() {
        *socket = expand_env_vars(socket);
    }
}

/// Replace `${VAR}` with the variable's value. Unset variables expand to
/// nothing; an unclosed `${` is kept as written.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let var = &after[..end];
        if !var.is_empty() {
            out.push_str(&env::var(var).unwrap_or_default());
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("gopls serve"), "gopls serve");
    }

    #[test]
    fn expand_env_vars_replaces_and_drops_missing() {
        unsafe {
            std::env::set_var("TETHER_TEST_GOPATH", "/opt/go");
            std::env::remove_var("TETHER_TEST_MISSING");
        }
        assert_eq!(
            expand_env_vars("${TETHER_TEST_GOPATH}/bin:${TETHER_TEST_MISSING}x"),
            "/opt/go/bin:x"
        );
        unsafe {
            std::env::remove_var("TETHER_TEST_GOPATH");
        }
    }

    #[test]
    fn expand_env_vars_unclosed_brace_preserved() {
        assert_eq!(expand_env_vars("-logfile=${UNCLOSED"), "-logfile=${UNCLOSED");
        assert_eq!(expand_env_vars("a ${} b"), "a  b");
    }

    #[test]
    fn expand_env_vars_unicode_content() {
        assert_eq!(expand_env_vars("λ-${}-λ"), "λ--λ");
    }

    #[test]
    fn parse_empty_is_default() {
        let config = parse("").unwrap();
        assert_eq!(config.server.command, "gopls");
        assert_eq!(config.notification_concurrency, 4);
        assert_eq!(config.timeouts.request_ms, 10_000);
    }

    #[test]
    fn parse_full_config() {
        let config = parse(
            r#"
            notification_concurrency = 2
            include_text_on_save = true

            [server]
            command = "rust-analyzer"
            language_id = "rust"
            args = ["--log-file", "/tmp/ra.log"]

            [server.env]
            RUST_LOG = "error"

            [timeouts]
            request_ms = 2500

            [settings.gopls]
            staticcheck = true
            "#,
        )
        .unwrap();
        assert_eq!(config.server.command, "rust-analyzer");
        assert_eq!(config.server.language_id, "rust");
        assert_eq!(config.server.args.len(), 2);
        assert_eq!(config.server.env["RUST_LOG"], "error");
        assert_eq!(config.timeouts.request_ms, 2500);
        assert_eq!(config.timeouts.analysis_ms, 60_000);
        assert_eq!(config.notification_concurrency, 2);
        assert!(config.include_text_on_save);
        assert_eq!(config.settings["gopls"]["staticcheck"], true);
    }

    #[test]
    fn load_explicit_file_expands_env() {
        unsafe {
            std::env::set_var("TETHER_TEST_SERVER", "/usr/local/bin/gopls");
        }
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\ncommand = \"${{TETHER_TEST_SERVER}}\"").unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.server.command, "/usr/local/bin/gopls");
        unsafe {
            std::env::remove_var("TETHER_TEST_SERVER");
        }
    }

    #[test]
    fn load_reports_parse_error_with_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "notification_concurrency = \"many\"").unwrap();

        let err = load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), file.path());
    }

    #[test]
    fn load_missing_explicit_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
