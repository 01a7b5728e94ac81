//! `config`: show or create the updater configuration file.

use suota_updater::settings::{ConfigManager, SuotaConfig};

/// Print the effective config as JSON.
pub fn show(manager: &ConfigManager) -> Result<(), String> {
    let config = manager
        .load()
        .map_err(|e| format!("Failed to load config: {}", e))?;
    let text = serde_json::to_string_pretty(&config)
        .map_err(|e| format!("Failed to encode config: {}", e))?;

    println!("# {}", manager.config_path().display());
    println!("{}", text);
    if !config.has_non_default_settings() {
        println!("# (all defaults)");
    }
    Ok(())
}

/// Write a default config file. Refuses to overwrite unless `force` is set.
pub fn init(manager: &ConfigManager, force: bool) -> Result<(), String> {
    let path = manager.config_path();
    if path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    manager
        .save(&SuotaConfig::default())
        .map_err(|e| format!("Failed to save config: {}", e))?;
    println!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_refuses_overwrite() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(dir.path());

        init(&manager, false).unwrap();
        assert!(manager.config_path().exists());
        assert!(init(&manager, false).unwrap_err().contains("already exists"));
        init(&manager, true).unwrap();
        assert_eq!(manager.load().unwrap(), SuotaConfig::default());
    }

    #[test]
    fn test_show_reports_malformed_file() {
        let dir = tempdir().unwrap();
        let manager = ConfigManager::new(dir.path());
        std::fs::write(manager.config_path(), "{ not json").unwrap();

        assert!(show(&manager).unwrap_err().starts_with("Failed to load config"));
    }
}
