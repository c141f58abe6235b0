pub mod config;
pub mod constants;

pub use config::{
    BackgroundBand, BackgroundConfig, BackgroundMethod, CoiConfig, CoiModel, ExtractionConfig,
};
