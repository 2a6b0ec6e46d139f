use crate::candle_data_loader::*;
use crate::candle_inference::TrainConfig;
use crate::candle_model_traits::ExecMode;
use crate::candle_split_vae::SplitVaeModule;

use candle_nn::{AdamW, Optimizer};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

pub struct Vae<'a> {
    pub module: &'a SplitVaeModule,
    pub variable_map: &'a candle_nn::VarMap,
}

pub trait VaeT<'a> {
    /// Train the VAE model
    /// * `data` - data loader should have `minibatch_data`
    /// * `train_config` - training configuration
    ///
    /// # Returns the average loss per epoch
    fn train_encoder_decoder<DataL>(
        &mut self,
        data: &mut DataL,
        train_config: &TrainConfig,
    ) -> anyhow::Result<Vec<f32>>
    where
        DataL: DataLoader;

    /// Build a VAE model
    /// * `module` - generative module
    /// * `variable_map` - all the trainable variables of `module`
    fn build(module: &'a SplitVaeModule, variable_map: &'a candle_nn::VarMap) -> Self;
}

impl<'a> VaeT<'a> for Vae<'a> {
    fn train_encoder_decoder<DataL>(
        &mut self,
        data: &mut DataL,
        train_config: &TrainConfig,
    ) -> anyhow::Result<Vec<f32>>
    where
        DataL: DataLoader,
    {
        let device = &train_config.device;
        let mut adam = AdamW::new_lr(
            self.variable_map.all_vars(),
            train_config.learning_rate.into(),
        )?;

        let pb = ProgressBar::new(train_config.num_epochs as u64);

        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut loss_trace = vec![];

        for epoch in 0..train_config.num_epochs {
            data.shuffle_minibatch(train_config.batch_size)?;
            let kl_weight = train_config.kl_weight(epoch);

            let mut loss_tot = 0f32;
            let num_minibatches = data.num_minibatch();

            for b in 0..num_minibatches {
                let batch = data.minibatch_data(b, device)?;
                let out = self.module.forward(&batch, kl_weight, ExecMode::Train)?;
                let loss = out
                    .loss
                    .ok_or(anyhow::anyhow!("forward pass without a loss"))?
                    .loss;
                adam.backward_step(&loss)?;
                loss_tot += loss.to_scalar::<f32>()?;
            }

            loss_trace.push(loss_tot / num_minibatches.max(1) as f32);
            pb.inc(1);

            if train_config.verbose {
                info!(
                    "[{}] loss: {} (kl weight {:.3})",
                    epoch + 1,
                    loss_trace.last().ok_or(anyhow::anyhow!("loss"))?,
                    kl_weight
                );
            }
        }
        pb.finish_and_clear();
        Ok(loss_trace)
    }

    fn build(module: &'a SplitVaeModule, variable_map: &'a candle_nn::VarMap) -> Self {
        Self {
            module,
            variable_map,
        }
    }
}
