use burn::config::Config;
use digit_network::NetworkConfig;

#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = "NetworkConfig::new()")]
    pub network: NetworkConfig,
    #[config(default = 1e-4)]
    pub learning_rate: f64,
    #[config(default = 100000)]
    pub decay_steps: usize,
    #[config(default = 0.75)]
    pub decay_rate: f64,
    #[config(default = 0.9)]
    pub momentum: f64,
    #[config(default = 10)]
    pub batch_size: usize,
    #[config(default = 3000)]
    pub max_steps: usize,
    #[config(default = 100)]
    pub log_interval: usize,
    #[config(default = 1000)]
    pub checkpoint_interval: usize,
    #[config(default = 5000)]
    pub validation_size: usize,
    #[config(default = 42)]
    pub seed: u64,
}
