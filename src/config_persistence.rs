//! Loading and comment-preserving persistence of `nmplay.toml`.

use std::path::{Path, PathBuf};

use log::{info, warn};
use toml_edit::{DocumentMut, Item, Table};

use crate::config::Config;

const CONFIG_FILE_NAME: &str = "nmplay.toml";

/// Default config location under the platform config directory.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_FILE_NAME)
}

fn set_table_value_preserving_decor(table: &mut Table, key: &str, item: Item) {
    let existing_value_decor = table
        .get(key)
        .and_then(|current| current.as_value().map(|value| value.decor().clone()));
    table[key] = item;
    if let Some(existing_value_decor) = existing_value_decor {
        if let Some(next_value) = table[key].as_value_mut() {
            *next_value.decor_mut() = existing_value_decor;
        }
    }
}

fn values_equal(current: Option<&Item>, next: &Item) -> bool {
    match (current.and_then(Item::as_value), next.as_value()) {
        (Some(current), Some(next)) => current.to_string().trim() == next.to_string().trim(),
        _ => false,
    }
}

fn merge_table_with_targeted_updates(destination: &mut Table, source: &Table) {
    for (key, source_item) in source.iter() {
        match source_item {
            Item::Table(source_table) => {
                if !destination.get(key).is_some_and(Item::is_table) {
                    destination.insert(key, Item::Table(Table::new()));
                }
                if let Some(destination_table) = destination.get_mut(key).and_then(Item::as_table_mut)
                {
                    merge_table_with_targeted_updates(destination_table, source_table);
                }
            }
            _ => {
                if values_equal(destination.get(key), source_item) {
                    continue;
                }
                set_table_value_preserving_decor(destination, key, source_item.clone());
            }
        }
    }
}

/// Rewrites only the keys whose values changed, keeping user comments.
pub fn serialize_config_with_preserved_comments(
    existing_text: &str,
    config: &Config,
) -> Result<String, String> {
    let next_text = toml::to_string(config)
        .map_err(|err| format!("failed to serialize config to TOML: {}", err))?;
    let next_document = next_text
        .parse::<DocumentMut>()
        .map_err(|err| format!("failed to parse serialized config TOML document: {}", err))?;
    let mut existing_document = existing_text
        .parse::<DocumentMut>()
        .map_err(|err| format!("failed to parse existing config as TOML document: {}", err))?;

    merge_table_with_targeted_updates(existing_document.as_table_mut(), next_document.as_table());
    Ok(existing_document.to_string())
}

pub fn persist_config_file(config: &Config, path: &Path) {
    let existing_text = std::fs::read_to_string(path).ok();
    let config_text = if let Some(existing_text) = existing_text {
        match serialize_config_with_preserved_comments(&existing_text, config) {
            Ok(updated_text) => Some(updated_text),
            Err(err) => {
                warn!(
                    "Failed to preserve config comments for {} ({}). Falling back to plain serialization.",
                    path.display(),
                    err
                );
                toml::to_string(config).ok()
            }
        }
    } else {
        toml::to_string(config).ok()
    };

    let Some(config_text) = config_text else {
        log::error!("Failed to serialize config for {}", path.display());
        return;
    };

    if let Err(err) = std::fs::write(path, config_text) {
        log::error!("Failed to persist config to {}: {}", path.display(), err);
    }
}

/// Reads the config file, creating it with defaults on first run.
pub fn load_config_file(path: &Path) -> Config {
    if !path.exists() {
        info!(
            "Config file not found. Creating default config. path={}",
            path.display()
        );
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!("Failed to create config directory {}: {}", parent.display(), err);
            }
        }
        persist_config_file(&Config::default(), path);
        return Config::default();
    }

    let config_content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            warn!(
                "Failed to read config file {}. Using defaults. error={}",
                path.display(),
                err
            );
            return Config::default();
        }
    };

    match toml::from_str::<Config>(&config_content) {
        Ok(config) => config.sanitized(),
        Err(err) => {
            warn!(
                "Failed to parse config file {}. Using defaults. error={}",
                path.display(),
                err
            );
            Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_update_keeps_comments_and_untouched_keys() {
        let existing = r#"# my player settings
[playback]
# quieter by default
initial_volume = 80 # percent
load_timeout_ms = 20000
"#;
        let mut config: Config = toml::from_str(existing).expect("fixture should parse");
        config.playback.initial_volume = 35;

        let updated = serialize_config_with_preserved_comments(existing, &config)
            .expect("serialization should succeed");

        assert!(updated.contains("# my player settings"));
        assert!(updated.contains("# quieter by default"));
        assert!(updated.contains("initial_volume = 35 # percent"));
        assert!(updated.contains("load_timeout_ms = 20000"));

        let reparsed: Config = toml::from_str(&updated).expect("output should parse");
        assert_eq!(reparsed.playback.initial_volume, 35);
    }

    #[test]
    fn test_missing_sections_are_added() {
        let config = Config::default();
        let updated = serialize_config_with_preserved_comments("", &config)
            .expect("serialization should succeed");
        let reparsed: Config = toml::from_str(&updated).expect("output should parse");
        assert_eq!(reparsed, config);
        assert!(updated.contains("[media_controls]"));
    }

    #[test]
    fn test_invalid_existing_text_is_reported() {
        let result = serialize_config_with_preserved_comments("[playback", &Config::default());
        assert!(result.is_err());
    }
}
