//! Where the CLI keeps its files
//!
//! Follows the XDG base directory convention: `$XDG_CONFIG_HOME/ferry` when
//! set and non-empty, otherwise `~/.config/ferry`.

use std::ffi::OsString;
use std::path::PathBuf;

const APP_DIR_NAME: &str = "ferry";
const SESSION_CACHE_FILE_NAME: &str = "sessions.yaml";
const CREDENTIAL_CACHE_FILE_NAME: &str = "credentials.yaml";
const XDG_CONFIG_HOME_ENV: &str = "XDG_CONFIG_HOME";

/// Directory holding the CLI's cache files
pub fn config_dir() -> PathBuf {
    resolve_config_dir(std::env::var_os(XDG_CONFIG_HOME_ENV), dirs::home_dir())
}

fn resolve_config_dir(xdg: Option<OsString>, home: Option<PathBuf>) -> PathBuf {
    if let Some(xdg) = xdg.filter(|p| !p.is_empty()) {
        return PathBuf::from(xdg).join(APP_DIR_NAME);
    }
    match home {
        Some(home) => home.join(".config").join(APP_DIR_NAME),
        // No home directory: keep the files next to the working directory
        None => PathBuf::from(format!(".{}", APP_DIR_NAME)),
    }
}

/// Default `--session-cache` path
pub fn default_session_cache_path() -> String {
    config_dir()
        .join(SESSION_CACHE_FILE_NAME)
        .to_string_lossy()
        .into_owned()
}

/// Default `--credential-cache` path
pub fn default_credential_cache_path() -> String {
    config_dir()
        .join(CREDENTIAL_CACHE_FILE_NAME)
        .to_string_lossy()
        .into_owned()
}
