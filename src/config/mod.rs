//! Matrix configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MatrixError, Result};
use crate::registry::Level;
use crate::treasury::{Amount, MILLI_UNIT};

pub const DEFAULT_WIDTH: u32 = 3;

/// How the resolver treats ancestors during a reinvestment.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPolicy {
    /// First ancestor that owns the level and is not full.
    #[default]
    Capacity,
    /// As `Capacity`, and the ancestor must have cycled the level at least as
    /// many times as the purchaser.
    CycleMatched,
}

/// Matrix configuration, read from TOML.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MatrixConfig {
    /// Direct sponsees per level slot
    pub width: u32,

    /// Price of each level, level 1 first
    pub prices: Vec<Amount>,

    pub routing: RoutingPolicy,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            prices: vec![
                50 * MILLI_UNIT,
                150 * MILLI_UNIT,
                450 * MILLI_UNIT,
                1_350 * MILLI_UNIT,
            ],
            routing: RoutingPolicy::Capacity,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] MatrixError),
}

impl MatrixConfig {
    /// Load configuration from file, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents)?
        } else {
            MatrixConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 {
            return Err(MatrixError::InvalidWidth);
        }
        PriceTable::new(self.prices.clone()).map(|_| ())
    }

    pub fn price_table(&self) -> Result<PriceTable> {
        PriceTable::new(self.prices.clone())
    }
}

/// Immutable, strictly increasing level prices indexed from level 1.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriceTable(Vec<Amount>);

impl PriceTable {
    pub fn new(prices: Vec<Amount>) -> Result<Self> {
        if prices.is_empty() {
            return Err(MatrixError::InvalidPriceTable("no levels".into()));
        }
        if prices.len() > Level::MAX as usize {
            return Err(MatrixError::InvalidPriceTable(format!(
                "at most {} levels",
                Level::MAX
            )));
        }
        if prices[0] == 0 {
            return Err(MatrixError::InvalidPriceTable(
                "prices must be positive".into(),
            ));
        }
        if prices.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(MatrixError::InvalidPriceTable(
                "prices must strictly increase".into(),
            ));
        }
        Ok(Self(prices))
    }

    pub fn level_count(&self) -> Level {
        self.0.len() as Level
    }

    /// Price of `level`, or `None` outside `[1, level_count]`.
    pub fn price(&self, level: Level) -> Option<Amount> {
        let idx = usize::from(level).checked_sub(1)?;
        self.0.get(idx).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Level, Amount)> + '_ {
        self.0
            .iter()
            .enumerate()
            .map(|(idx, price)| (idx as Level + 1, *price))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_the_four_level_table() {
        let config = MatrixConfig::default();
        config.validate().unwrap();
        let table = config.price_table().unwrap();
        assert_eq!(table.level_count(), 4);
        assert_eq!(table.price(1), Some(50_000_000_000_000_000));
        assert_eq!(table.price(4), Some(1_350_000_000_000_000_000));
        assert_eq!(table.price(0), None);
        assert_eq!(table.price(5), None);
    }

    #[test]
    fn price_table_must_strictly_increase() {
        assert!(PriceTable::new(vec![]).is_err());
        assert!(PriceTable::new(vec![0, 1]).is_err());
        assert!(PriceTable::new(vec![5, 5]).is_err());
        assert!(PriceTable::new(vec![5, 4]).is_err());
        assert!(PriceTable::new(vec![1, 2, 3]).is_ok());
    }

    #[test]
    fn load_missing_config_returns_defaults() {
        let config = MatrixConfig::load(Path::new("/nonexistent/matrix.toml")).unwrap();
        assert_eq!(config, MatrixConfig::default());
    }

    #[test]
    fn load_reads_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.toml");
        std::fs::write(&path, "width = 2\nrouting = \"cycle_matched\"\n").unwrap();
        let config = MatrixConfig::load(&path).unwrap();
        assert_eq!(config.width, 2);
        assert_eq!(config.routing, RoutingPolicy::CycleMatched);
        assert_eq!(config.prices, MatrixConfig::default().prices);
    }

    #[test]
    fn load_rejects_invalid_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.toml");
        std::fs::write(&path, "prices = [10, 5]\n").unwrap();
        assert!(matches!(
            MatrixConfig::load(&path),
            Err(ConfigError::Invalid(MatrixError::InvalidPriceTable(_)))
        ));
    }
}
