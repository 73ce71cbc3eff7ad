use envconfig::Envconfig;

use phone_common::config::{EnvMsDuration, NonEmptyString};
use phone_common::pg::PoolConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "numbers.fifo")]
    pub queue_name: NonEmptyString,

    #[envconfig(default = "200")]
    pub batch_size: usize,

    #[envconfig(default = "numbers")]
    pub group_key: NonEmptyString,

    /// A file with one raw candidate per line. Random numbers are generated when unset.
    pub input_path: Option<String>,

    #[envconfig(default = "250")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(nested = true)]
    pub pool: PoolConfig,
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.queue_name.as_str(), "numbers.fifo");
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.group_key.as_str(), "numbers");
        assert!(config.input_path.is_none());
    }

    #[test]
    fn test_input_path() {
        let mut env = HashMap::new();
        env.insert("INPUT_PATH".to_owned(), "/tmp/numbers.txt".to_owned());

        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.input_path.as_deref(), Some("/tmp/numbers.txt"));
    }
}
