use envconfig::Envconfig;

use phone_common::config::{EnvMsDuration, NonEmptyString};
use phone_common::consumer::ConsumerSettings;
use phone_common::pg::PoolConfig;
use phone_common::queue::QueueError;
use phone_common::retry::{RetryPolicy, RetryPolicyConfig};

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3303")]
    pub port: u16,

    #[envconfig(default = "enriched.fifo")]
    pub input_queue_name: NonEmptyString,

    #[envconfig(default = "phone_numbers")]
    pub table_name: NonEmptyString,

    #[envconfig(default = "10")]
    pub max_messages: usize,

    #[envconfig(default = "10000")]
    pub wait_time: EnvMsDuration,

    #[envconfig(default = "250")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub liveness_deadline: EnvMsDuration,

    #[envconfig(nested = true)]
    pub pool: PoolConfig,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn consumer_settings(&self) -> Result<ConsumerSettings, QueueError> {
        ConsumerSettings::new(
            self.max_messages,
            self.wait_time.0,
            RetryPolicy::from(&self.retry_policy),
        )
    }
}
