use anyhow::{Context, Result};
use audiohal_engine::HalOptions;
use audiohal_engine::options::flag;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "AUDIOHAL_CONFIG";
pub const JSON_ENV: &str = "AUDIOHAL_JSON";

/// Contents of the optional TOML configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub log_level: Option<String>,
    pub json: bool,
    pub simulated: bool,
    pub engine: HalOptions,
}

impl Settings {
    /// Read `path`, or the file named by `AUDIOHAL_CONFIG`. No file means
    /// defaults. Engine options are then overridden from the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    fn load_with(path: Option<&Path>, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| var(CONFIG_ENV).map(PathBuf::from));
        let mut settings = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                Self::parse(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => Self::default(),
        };
        settings.engine = settings.engine.with_vars(&var);
        settings.json |= flag(&var, JSON_ENV);
        Ok(settings)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
