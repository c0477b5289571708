use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Application folder name under the platform config/data dirs
const APP_DIR: &str = "stepframe";

/// Files whose presence makes the working directory the config directory
const LOCAL_FILES: [&str; 2] = ["stepframe.json", "stepframe.log"];

/// Configuration for overriding default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args → ENV var (STEPFRAME_CONFIG_DIR) → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir =
            cli_dir.or_else(|| std::env::var("STEPFRAME_CONFIG_DIR").ok().map(PathBuf::from));

        Self { config_dir }
    }
}

/// Get path to a configuration file
///
/// Priority:
/// 1. CLI --config-dir argument
/// 2. STEPFRAME_CONFIG_DIR environment variable
/// 3. Local folder IF any stepframe files exist (stepframe.json, stepframe.log)
/// 4. Platform-specific config directory from dirs-next (default)
///
/// Platform paths:
/// - Linux: ~/.config/stepframe/{name}
/// - macOS: ~/Library/Application Support/stepframe/{name}
/// - Windows: %APPDATA%\stepframe\{name}
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    resolve_dir(config, std::env::current_dir().ok().as_deref(), dirs_next::config_dir()).join(name)
}

/// Get path to a data file (logs). Same priority, platform data dir last.
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    resolve_dir(config, std::env::current_dir().ok().as_deref(), dirs_next::data_dir()).join(name)
}

/// Ensure that the parent directory of `file` exists
pub fn ensure_parent(file: &Path) -> Result<()> {
    if let Some(dir) = file.parent()
        && !dir.as_os_str().is_empty()
        && !dir.exists()
    {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    Ok(())
}

fn has_local_files(dir: &Path) -> bool {
    LOCAL_FILES.iter().any(|f| dir.join(f).exists())
}

fn resolve_dir(config: &PathConfig, cwd: Option<&Path>, platform: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }

    if let Some(cwd) = cwd
        && has_local_files(cwd)
    {
        return cwd.to_path_buf();
    }

    if let Some(dir) = platform {
        return dir.join(APP_DIR);
    }

    PathBuf::from(".")
}
