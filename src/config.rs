use crate::Error;
use serde::Deserialize;
use std::env;

pub const ENV_SINGLE_THREADED: &str = "DATAPATH_SINGLE_THREADED";
pub const ENV_WQE_MODE: &str = "DATAPATH_WQE_MODE";
pub const ENV_DBR_RECOVERY: &str = "DATAPATH_DBR_RECOVERY";
pub const ENV_PUSH: &str = "DATAPATH_PUSH";

/// How send queue slots are accounted per WQE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WqeMode {
    /// Every WQE takes a fixed number of slots.
    #[default]
    Static,
    /// A WQE takes as many slots as its header and payload need.
    Variable,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Caller guarantees no concurrent access to any queue.
    pub single_threaded: bool,
    pub wqe_mode: WqeMode,
    pub drop_recovery: bool,
    pub push: bool,
    pub max_inline: u32,
    /// Replays between yields in the recovery walk.
    pub recovery_yield_interval: u32,
    pub resize_retry_count: u32,
    pub resize_wait_us: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            single_threaded: false,
            wqe_mode: WqeMode::Static,
            drop_recovery: true,
            push: false,
            max_inline: 96,
            recovery_yield_interval: 32,
            resize_retry_count: 1000,
            resize_wait_us: 100,
        }
    }
}

impl Config {
    pub fn from_json(s: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(s)?)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();
        if let Some(v) = env_flag(ENV_SINGLE_THREADED)? {
            config.single_threaded = v;
        }
        if let Some(v) = env_flag(ENV_DBR_RECOVERY)? {
            config.drop_recovery = v;
        }
        if let Some(v) = env_flag(ENV_PUSH)? {
            config.push = v;
        }
        if let Ok(mode) = env::var(ENV_WQE_MODE) {
            config.wqe_mode = match mode.to_ascii_lowercase().as_str() {
                "static" | "0" => WqeMode::Static,
                "variable" | "1" => WqeMode::Variable,
                other => {
                    return Err(Error::InvalidConfig(format!("{ENV_WQE_MODE}={other}")));
                }
            };
        }
        Ok(config)
    }
}

fn env_flag(name: &str) -> Result<Option<bool>, Error> {
    let Ok(val) = env::var(name) else {
        return Ok(None);
    };
    match val.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => Err(Error::InvalidConfig(format!("{name}={other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_from_json_fills_defaults() {
        let config = Config::from_json(r#"{"wqe_mode": "variable", "push": true}"#).unwrap();
        assert_eq!(config.wqe_mode, WqeMode::Variable);
        assert!(config.push);
        assert!(config.drop_recovery);
        assert_eq!(config.recovery_yield_interval, 32);
    }

    #[test]
    fn test_from_json_rejects_unknown_mode() {
        assert!(matches!(
            Config::from_json(r#"{"wqe_mode": "dynamic"}"#),
            Err(Error::Json(_))
        ));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        env::set_var(ENV_SINGLE_THREADED, "1");
        env::set_var(ENV_WQE_MODE, "variable");
        let config = Config::from_env().unwrap();
        assert!(config.single_threaded);
        assert_eq!(config.wqe_mode, WqeMode::Variable);

        env::set_var(ENV_DBR_RECOVERY, "maybe");
        assert!(matches!(Config::from_env(), Err(Error::InvalidConfig(_))));

        env::remove_var(ENV_SINGLE_THREADED);
        env::remove_var(ENV_WQE_MODE);
        env::remove_var(ENV_DBR_RECOVERY);
    }
}
