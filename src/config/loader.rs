//! Loading and saving of the config file and the model catalog

use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use super::structs::{default_state_dir, Config, ModelCatalog};
use crate::error::{Error, Result};

pub fn default_config_path() -> PathBuf {
    default_state_dir().join("config.toml")
}

/// Read `config.toml`. A missing file yields the defaults; a malformed one is an error.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        warn!("Config {} not found, using defaults", path.display());
        return Ok(Config::default());
    }

    let text = fs::read_to_string(path).map_err(|e| Error::persistence(path, e))?;
    let config: Config =
        toml::from_str(&text).map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;

    if config.engine.mark_min > config.engine.mark_max {
        return Err(Error::InvalidConfig(format!(
            "mark_min {} exceeds mark_max {}",
            config.engine.mark_min, config.engine.mark_max
        )));
    }

    Ok(config)
}

/// Full rewrite of `config.toml`
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| Error::persistence(dir, e))?;
    }
    let text = toml::to_string_pretty(config).map_err(|e| Error::persistence(path, e))?;
    fs::write(path, text).map_err(|e| Error::persistence(path, e))?;
    info!("Saved config to {}", path.display());
    Ok(())
}

/// Read `models.yaml`. Absent or unreadable catalogs are empty.
pub fn load_models(path: &Path) -> ModelCatalog {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(_) => return ModelCatalog::default(),
    };

    match parse_models(&text) {
        Ok(catalog) => catalog,
        Err(e) => {
            error!("Error loading models from {}: {}", path.display(), e);
            ModelCatalog::default()
        }
    }
}

/// Parse catalog text, resolving `<<` merge keys against the anchors in
/// `components` before the models are typed.
pub fn parse_models(text: &str) -> serde_yaml::Result<ModelCatalog> {
    let mut value: serde_yaml::Value = serde_yaml::from_str(text)?;
    value.apply_merge()?;
    serde_yaml::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::scheduler::compile;

    #[test]
    fn test_missing_config_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert!(config.lan_interface.is_empty());
    }

    #[test]
    fn test_config_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.lan_interface = "eth0".into();
        config.wan_interface = "eth1".into();
        config.admin_password_hash = Some("5e884898da28".into());
        save_config(&path, &config).unwrap();

        assert_eq!(load_config(&path).unwrap(), config);
    }

    #[test]
    fn test_inverted_mark_range_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[engine]\nmark_min = 10\nmark_max = 5\n").unwrap();

        assert!(matches!(load_config(&path), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_unreadable_models_are_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.yaml");
        assert!(load_models(&path).models.is_empty());

        fs::write(&path, "invalid: yaml: content: [").unwrap();
        assert!(load_models(&path).models.is_empty());
    }

    #[test]
    fn test_models_resolve_merge_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.yaml");
        fs::write(
            &path,
            r#"
version: "1.0"
components:
  lan_delay: &lan_delay {delay: 2, rate_limit: 5000}
  wan_loss: &wan_loss {loss: 3}
models:
  mixed:
    global:
      uplink: {<<: *lan_delay, loss: 1}
      downlink: *wan_loss
    timeline:
      - {duration: 1, uplink: {<<: *lan_delay, delay: 40}}
"#,
        )
        .unwrap();

        let catalog = load_models(&path);
        let steps = compile("mixed", catalog.get("mixed").unwrap()).unwrap();
        assert_eq!(steps.len(), 1);

        let up = &steps[0].uplink.settings;
        assert_eq!(up.delay, Some(40));
        assert_eq!(up.rate_limit, Some(5000));
        assert_eq!(up.loss, Some(1.0));
        assert_eq!(steps[0].downlink.settings.loss, Some(3.0));
    }
}
