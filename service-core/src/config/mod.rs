use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;
use std::{env, str::FromStr};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Read an environment variable.
///
/// Outside production a missing variable falls back to `default`; in production
/// every variable must be set explicitly.
pub fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

/// Read and parse an environment variable, see [`get_env`].
pub fn get_env_parsed<T>(key: &str, default: Option<&str>, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, default, is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_env_default_outside_prod() {
        let val = get_env("SERVICE_CORE_TEST_UNSET_KEY", Some("fallback"), false).unwrap();
        assert_eq!(val, "fallback");
    }

    #[test]
    fn test_get_env_required_in_prod() {
        let err = get_env("SERVICE_CORE_TEST_UNSET_KEY", Some("fallback"), true).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn test_get_env_parsed_rejects_garbage() {
        let err = get_env_parsed::<u32>("SERVICE_CORE_TEST_UNSET_NUM", Some("ten"), false)
            .unwrap_err();
        assert!(err.to_string().contains("SERVICE_CORE_TEST_UNSET_NUM"));
    }
}
