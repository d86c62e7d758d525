use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::models::BoostParams;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Max level for the fmt subscriber (`error` .. `trace`).
    pub log_level: String,
    /// Glob patterns of request scripts; stdin is read when empty.
    pub scripts: Vec<String>,
    /// Hyperparameters every `new` model starts from.
    pub defaults: BoostParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            scripts: Vec::new(),
            defaults: BoostParams::default(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config
            .defaults
            .validate()
            .with_context(|| format!("invalid [defaults] in {}", path.display()))?;
        Ok(config)
    }

    pub fn level(&self) -> anyhow::Result<tracing::Level> {
        self.log_level
            .parse()
            .map_err(|_| anyhow::anyhow!("unknown log level {:?}", self.log_level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BoostType;
    use std::io::Write;

    #[test]
    fn test_load_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"
scripts = ["demos/*.jsonl"]

[defaults]
boost_type = "Gentle"
weak_count = 20
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.level().unwrap(), tracing::Level::DEBUG);
        assert_eq!(config.scripts, vec!["demos/*.jsonl".to_owned()]);
        assert_eq!(config.defaults.boost_type, BoostType::Gentle);
        assert_eq!(config.defaults.weak_count, 20);
        assert_eq!(config.defaults.max_depth, 1);
    }

    #[test]
    fn test_invalid_defaults_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[defaults]\nweight_trim_rate = 1.5").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.log_level, "info");
        assert!(config.scripts.is_empty());
        assert_eq!(config.defaults, BoostParams::default());
    }
}
