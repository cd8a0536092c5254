use anyhow::{Context, Result};
use directories::ProjectDirs;
use multilink_core::ServerConfig;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "multilink-server.toml";

pub fn default_config_path() -> Result<PathBuf> {
    let proj = ProjectDirs::from("io", "multilink", "multilink")
        .context("could not determine platform config directory")?;
    Ok(proj.config_dir().join(CONFIG_FILE_NAME))
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
    }
    Ok(())
}

pub fn load(path: &Path) -> Result<ServerConfig> {
    if !path.exists() {
        anyhow::bail!(
            "no config at {} (create one with `multilink-server init-config`)",
            path.display()
        );
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let cfg: ServerConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse TOML: {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(cfg)
}

pub fn save(path: &Path, cfg: &ServerConfig, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    ensure_parent_dir(path)?;
    let raw = toml::to_string_pretty(cfg).context("failed to serialize config to TOML")?;
    fs::write(path, raw).with_context(|| format!("failed to write config: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use multilink_core::PreSharedKey;

    #[test]
    fn test_save_then_load() {
        let path = std::env::temp_dir()
            .join(format!("multilink-server-test-{}", std::process::id()))
            .join("server.toml");
        let cfg = ServerConfig {
            psk_b64: PreSharedKey::generate_base64(),
            initial_sequence: 100,
            ..ServerConfig::default()
        };
        save(&path, &cfg, true).unwrap();
        assert_eq!(load(&path).unwrap(), cfg);
        assert!(save(&path, &cfg, false).is_err());
        fs::remove_file(&path).unwrap();
    }
}
