// src/strategies/mod.rs
pub mod bollinger;
pub mod consecutive_ratio;
pub mod kwatoko;
pub mod signal;
pub mod traits;

use serde::de::DeserializeOwned;

use crate::error::ConfigError;
use bollinger::{BollingerParams, BollingerStrategy};
use consecutive_ratio::{ConsecutiveRatioParams, ConsecutiveRatioStrategy};
use kwatoko::{KwatokoParams, KwatokoStrategy};
use traits::Strategy;

/// Builds strategies by name. Missing params fall back to each strategy's
/// defaults; unknown params are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrategyFactory;

impl StrategyFactory {
    pub const NAMES: [&'static str; 3] = ["bollinger", "consecutive_ratio", "kwatoko"];

    pub fn create(&self, name: &str, params: &serde_json::Value) -> Result<Box<dyn Strategy>, ConfigError> {
        match name {
            "bollinger" => Ok(Box::new(BollingerStrategy::new(parse::<BollingerParams>(name, params)?))),
            "consecutive_ratio" => Ok(Box::new(ConsecutiveRatioStrategy::new(parse::<
                ConsecutiveRatioParams,
            >(name, params)?))),
            "kwatoko" => Ok(Box::new(KwatokoStrategy::new(parse::<KwatokoParams>(name, params)?))),
            _ => Err(ConfigError::UnknownStrategy(name.to_string())),
        }
    }
}

fn parse<P: DeserializeOwned>(name: &str, params: &serde_json::Value) -> Result<P, ConfigError> {
    let params = match params {
        serde_json::Value::Null => serde_json::Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(params).map_err(|e| ConfigError::InvalidStrategyParams {
        name: name.to_string(),
        reason: e.to_string(),
    })
}
