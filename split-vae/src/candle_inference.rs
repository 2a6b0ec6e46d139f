use crate::candle_data_loader::DEFAULT_BATCH_SIZE;

pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    /// linearly increase the KL weight from 0 to 1 over these epochs
    pub kl_warmup_epochs: usize,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            batch_size: DEFAULT_BATCH_SIZE,
            num_epochs: 400,
            kl_warmup_epochs: 0,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: true,
        }
    }
}

impl TrainConfig {
    /// min(1, epoch / warmup), or 1 without warmup
    pub fn kl_weight(&self, epoch: usize) -> f64 {
        if self.kl_warmup_epochs == 0 {
            1.
        } else {
            (epoch as f64 / self.kl_warmup_epochs as f64).min(1.)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kl_warmup_schedule() {
        let mut config = TrainConfig::default();
        assert_eq!(config.kl_weight(0), 1.);
        config.kl_warmup_epochs = 4;
        assert_eq!(config.kl_weight(0), 0.);
        assert_eq!(config.kl_weight(2), 0.5);
        assert_eq!(config.kl_weight(10), 1.);
    }
}
