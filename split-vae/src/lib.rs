pub mod candle_aux_layers;
pub mod candle_aux_linear;
pub mod candle_covariate;
pub mod candle_data_loader;
pub mod candle_data_loader_util;
pub mod candle_decoder_split;
pub mod candle_encoder_covariate;
pub mod candle_inference;
pub mod candle_loss_functions;
pub mod candle_model_config;
pub mod candle_model_traits;
pub mod candle_noise_model;
pub mod candle_prior;
pub mod candle_split_analysis;
pub mod candle_split_vae;
pub mod candle_vae_inference;
pub mod cli;

pub use candle_core;
pub use candle_nn;
