use std::str::FromStr;

use envconfig::Envconfig;

use phone_common::config::NonEmptyString;
use phone_common::pg::PoolConfig;

/// Largest number of records a single unfiltered listing may return.
pub const MAX_SCAN_LIMIT: usize = 100;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3300")]
    pub port: u16,

    #[envconfig(default = "phone_numbers")]
    pub table_name: NonEmptyString,

    #[envconfig(default = "100")]
    pub scan_limit: ScanLimit,

    #[envconfig(default = "100")]
    pub concurrency_limit: usize,

    #[envconfig(nested = true)]
    pub pool: PoolConfig,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanLimit(pub usize);

#[derive(Debug, PartialEq, Eq)]
pub struct ScanLimitOutOfRangeError;

impl FromStr for ScanLimit {
    type Err = ScanLimitOutOfRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<usize>() {
            Ok(limit) if (1..=MAX_SCAN_LIMIT).contains(&limit) => Ok(ScanLimit(limit)),
            _ => Err(ScanLimitOutOfRangeError),
        }
    }
}
