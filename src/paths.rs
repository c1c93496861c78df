use anyhow::Context;
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

fn ensure_dir(path: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory: {}", path.display()))?;
    Ok(path.to_path_buf())
}

/// `$WINGMAN_HOME/config`, then `$XDG_CONFIG_HOME/wingman`, then
/// `~/.config/wingman`.
fn resolve_config_dir(var: impl Fn(&str) -> Option<OsString>) -> anyhow::Result<PathBuf> {
    if let Some(base) = var("WINGMAN_HOME") {
        return Ok(PathBuf::from(base).join("config"));
    }

    if let Some(xdg) = var("XDG_CONFIG_HOME") {
        return Ok(PathBuf::from(xdg).join("wingman"));
    }

    // On Unix, HOME is standard.
    let home = var("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(home).join(".config").join("wingman"))
}

pub fn config_dir() -> anyhow::Result<PathBuf> {
    ensure_dir(&resolve_config_dir(|k| env::var_os(k))?)
}

pub fn config_file() -> anyhow::Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}
