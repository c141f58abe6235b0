use super::helpers::{quality_bits, OrderRecord, ResultRecord, Scene, TraceSpec};
use super::CliError;
use anyhow::Context;
use clap::Args;
use grism_core::{
    reduce, Anchor, BackgroundMethod, CenterlineOverrides, ExtractionConfig, Exposure,
    NominalCalibration, ReductionInputs, SpectralOrder,
};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Args)]
pub struct SimulateArgs {
    /// Destination scene file
    #[arg(long, value_name = "FILE")]
    pub output: PathBuf,
    /// Image rows (cross-dispersion)
    #[arg(long, default_value_t = 200)]
    pub rows: usize,
    /// Image columns (dispersion)
    #[arg(long, default_value_t = 2000)]
    pub columns: usize,
    /// Flat sky background in counts per pixel
    #[arg(long, default_value_t = 5.0)]
    pub background: f64,
    /// First-order trace amplitude in counts
    #[arg(long, default_value_t = 1000.0)]
    pub amplitude: f64,
    /// Trace sigma in pixels
    #[arg(long, default_value_t = 3.2)]
    pub sigma: f64,
    /// Exposure time in seconds
    #[arg(long, default_value_t = 1000.0)]
    pub exposure: f64,
}

pub fn run_simulate(args: SimulateArgs) -> Result<i32, CliError> {
    let row = args.rows as f64 / 2.0;
    let scene = Scene {
        rows: args.rows,
        columns: args.columns,
        background: args.background,
        anchor: [args.columns as f64 / 2.0, row],
        exposure: args.exposure,
        traces: vec![TraceSpec {
            order: SpectralOrder::First,
            amplitude: args.amplitude,
            row,
            sigma: args.sigma,
            slope: 0.0,
            quadratic: 0.0,
        }],
    };
    let serialized =
        serde_json::to_string_pretty(&scene).context("failed to serialize the scene")?;
    fs::write(&args.output, serialized)
        .with_context(|| format!("failed to write scene '{}'", args.output.display()))?;
    info!(path = %args.output.display(), "scene written");
    Ok(0)
}

#[derive(Args)]
pub struct ExtractArgs {
    /// Scene file produced by `simulate` (or written by hand)
    #[arg(long, value_name = "FILE")]
    pub scene: PathBuf,
    /// Destination result file
    #[arg(long, value_name = "FILE")]
    pub output: PathBuf,
    /// Extraction half-width in sigma
    #[arg(long, default_value_t = 2.5)]
    pub track_width: f64,
    /// Background method
    #[arg(long, value_enum, default_value_t = BackgroundArg::Boxcar)]
    pub background_method: BackgroundArg,
    /// Refine the order tracks against the image before extraction
    #[arg(long)]
    pub refine: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackgroundArg {
    Boxcar,
    Splinefit,
}

pub fn run_extract(args: ExtractArgs) -> Result<i32, CliError> {
    let source = fs::read_to_string(&args.scene)
        .with_context(|| format!("failed to read scene '{}'", args.scene.display()))?;
    let scene: Scene = serde_json::from_str(&source)
        .with_context(|| format!("failed to parse scene '{}'", args.scene.display()))?;
    let image = scene.render();
    info!(
        rows = scene.rows,
        columns = scene.columns,
        traces = scene.traces.len(),
        "scene rendered"
    );

    let mut config = ExtractionConfig {
        track_width: args.track_width,
        refine_tracks: args.refine,
        ..ExtractionConfig::default()
    };
    config.background.method = match args.background_method {
        BackgroundArg::Boxcar => BackgroundMethod::Boxcar,
        BackgroundArg::Splinefit => BackgroundMethod::SplineFit,
    };

    let inputs = ReductionInputs {
        image: &image,
        anchor: Anchor::new(scene.anchor[0], scene.anchor[1]),
        provider: &NominalCalibration,
        overrides: CenterlineOverrides::none(),
        exposure: Exposure::Constant(scene.exposure),
        contamination: None,
        dispersion: None,
        response: None,
    };
    let result = reduce(&inputs, &config)?;

    for warning in result.warnings.entries() {
        warn!("{warning}");
    }

    let record = ResultRecord {
        background_mean: result.background.mean,
        background_sigma: result.background.sigma,
        warnings: result.warnings.entries().to_vec(),
        orders: SpectralOrder::ALL
            .into_iter()
            .map(|order| {
                let data = result.order(order);
                OrderRecord {
                    order,
                    present: data.present,
                    flux_simple: data.flux_simple.clone(),
                    flux_optimal: data.flux_optimal.clone(),
                    variance_optimal: data.variance_optimal.clone(),
                    background: data.background.clone(),
                    aperture_correction: data.aperture_correction.clone(),
                    quality: quality_bits(&data.quality),
                }
            })
            .collect(),
    };
    let serialized =
        serde_json::to_string_pretty(&record).context("failed to serialize the result")?;
    fs::write(&args.output, serialized)
        .with_context(|| format!("failed to write result '{}'", args.output.display()))?;
    info!(path = %args.output.display(), "result written");
    Ok(0)
}
