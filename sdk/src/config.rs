use anyhow::{anyhow, Context as _, Result};
use config::{Config, ConfigError};
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// The table at `path` as a Config of its own.  A missing table gives an
/// empty Config; anything else that isn't a table is an error.
pub fn get_sub_config(config: &Config, path: &str) -> Result<Config> {
    match config.get_table(path) {
        Ok(table) => config_from_value(table)
            .with_context(|| format!("building [{path}] configuration")),
        Err(ConfigError::NotFound(_)) => Ok(Config::default()),
        Err(e) => Err(anyhow!("Bad [{path}] configuration: {e}")),
    }
}

/// Build a Config from a table of values
pub fn config_from_value(map: HashMap<String, config::Value>) -> Result<Config> {
    let builder = map.into_iter()
        .try_fold(Config::builder(), |builder, (key, value)| builder.set_override(key, value))?;
    Ok(builder.build()?)
}

/// Read a typed section.  A missing section gives the type's defaults, a
/// malformed one is an error.
pub fn get_section<T: DeserializeOwned + Default>(config: &Config, key: &str) -> Result<T> {
    match config.get::<T>(key) {
        Ok(section) => Ok(section),
        Err(ConfigError::NotFound(_)) => Ok(T::default()),
        Err(e) => Err(anyhow!("Bad [{key}] configuration: {e}")),
    }
}
