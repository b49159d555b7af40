use std::{
    collections::HashMap,
    fmt::Display,
    str::FromStr,
};

use thiserror::Error;

/// Per module configuration
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl ModuleConfig {
    /// Inserts a new configuration value.
    pub fn insert(&mut self, key: String, value: String) -> Option<String> {
        self.inner.insert(key, value)
    }

    /// Returns an option of raw configuration value.
    pub fn get_raw(&self, config_name: &str) -> Option<&str> {
        self.inner.get(config_name).map(String::as_str)
    }

    /// Returns a typed configuration value.
    pub fn required<T>(&self, config_name: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.inner.get(config_name) {
            None => Err(ConfigError::RequiredValue {
                field: config_name.to_string(),
            }),
            Some(value) => parse(value, config_name),
        }
    }

    /// Returns a typed configuration value, or `default` if missing.
    pub fn with_default<T>(&self, config_name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
    {
        Ok(self.optional(config_name)?.unwrap_or(default))
    }

    /// Returns an optional typed configuration value.
    pub fn optional<T>(&self, config_name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
    {
        self.inner
            .get(config_name)
            .map(|value| parse(value, config_name))
            .transpose()
    }

    /// Return a comma separed list of values. Return empty vector if field is missing.
    pub fn get_list<T>(&self, config_name: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .iter()
            .flat_map(|config| config.split(','))
            .filter(|item| !item.is_empty())
            .map(|item| parse(item.trim(), config_name))
            .collect()
    }

    /// Return a comma separed list of values. Return default vector if field is missing.
    pub fn get_list_with_default<T>(
        &self,
        config_name: &str,
        default: Vec<T>,
    ) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
    {
        if self.inner.contains_key(config_name) {
            self.get_list(config_name)
        } else {
            Ok(default)
        }
    }
}

fn parse<T>(value: &str, config_name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value).map_err(|err| ConfigError::InvalidValue {
        field: config_name.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(entries: &[(&str, &str)]) -> ModuleConfig {
        let mut config = ModuleConfig::default();
        for (key, value) in entries {
            config.insert(key.to_string(), value.to_string());
        }
        config
    }

    #[test]
    fn typed_values_and_defaults() {
        let config = config(&[("interval", "250"), ("enabled", "false")]);
        assert_eq!(config.required::<u64>("interval").unwrap(), 250);
        assert!(!config.with_default("enabled", true).unwrap());
        assert!(config.with_default("missing", true).unwrap());
        assert!(matches!(
            config.required::<u64>("missing"),
            Err(ConfigError::RequiredValue { .. })
        ));
    }

    #[test]
    fn lists_are_comma_separated() {
        let config = config(&[("pids", "1, 2,3,"), ("bad", "1,x")]);
        assert_eq!(config.get_list::<u32>("pids").unwrap(), vec![1, 2, 3]);
        assert!(config.get_list::<u32>("missing").unwrap().is_empty());
        assert!(matches!(
            config.get_list::<u32>("bad"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(
            config
                .get_list_with_default("families", vec!["approvers".to_string()])
                .unwrap(),
            vec!["approvers".to_string()]
        );
    }
}
