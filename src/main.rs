use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use asl_corrections::distortion::{NonlinearRegistration, PhaseReversedEstimator};
use asl_corrections::enums::DistortionSource;
use asl_corrections::{
    CorrectionConfig, CorrectionOrchestrator, DistortionCorrection, DistortionEstimators,
    DistortionOutcome, MotionCorrection, PrecomputedMotion, PrecomputedWarp, SensitivityMap,
    TopupParams, TransformRegistry, VolumeLoader, keys,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Apply precomputed motion and distortion corrections to ASL data in a
/// single resampling pass.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// JSON run configuration
    config: PathBuf,

    /// Override the configured output directory
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = CorrectionConfig::from_file(&cli.config)
        .with_context(|| format!("reading configuration {}", cli.config.display()))?;
    if let Some(output) = cli.output {
        config.output_dir = output;
    }
    config.validate().context("configuration check failed")?;
    tracing::info!(bolus = ?config.bolus_durations()?, tis = ?config.tis, "timing");

    let mut registry = TransformRegistry::new();
    load_inputs(&config, &mut registry)?;

    if let Some(path) = &config.transforms.motion_matrices {
        let mats = VolumeLoader::read_motion_matrices(path)
            .with_context(|| format!("reading motion matrices {}", path.display()))?;
        MotionCorrection::run(&mut registry, &PrecomputedMotion::new(mats))?;
    }

    let fmap_warp = load_precomputed_warp(config.transforms.fmap_warp.as_deref())?;
    let cblip_warp = load_precomputed_warp(config.transforms.cblip_warp.as_deref())?;
    let estimators = DistortionEstimators {
        registration: fmap_warp.as_ref().map(|w| w as &dyn NonlinearRegistration),
        fieldmap_registration: None,
        phase_reversed: cblip_warp.as_ref().map(|w| w as &dyn PhaseReversedEstimator),
    };
    let distortion = DistortionCorrection::run(&mut registry, &config.distortion, estimators)?;

    if let Some(path) = &config.transforms.gdc_warp {
        registry.insert_warp(keys::GDC_WARP, VolumeLoader::load_warp(path)?)?;
    }

    let mut orchestrator = CorrectionOrchestrator::new(config.interpolation);
    if let Some(path) = &config.inputs.reference {
        let reference = VolumeLoader::load(path, "reference")
            .with_context(|| format!("loading reference grid from {}", path.display()))?;
        orchestrator = orchestrator.with_reference(reference.grid().clone());
    }
    let outcome = orchestrator.run(&mut registry)?;
    tracing::info!(?outcome, "corrections applied");

    if config.senscorr {
        SensitivityMap::run(&mut registry)?;
    }

    write_outputs(&config, &registry, &distortion)?;
    for warning in registry.warnings() {
        tracing::warn!(%warning, "completed with degraded correction");
    }
    Ok(())
}

fn load_inputs(config: &CorrectionConfig, registry: &mut TransformRegistry) -> Result<()> {
    let inputs = &config.inputs;
    let asl = VolumeLoader::load(&inputs.asldata, keys::ASLDATA)?;
    registry.insert_volume(keys::ASLDATA_ORIG, asl)?;

    let optional = [
        (keys::CALIB_ORIG, keys::CALIB, &inputs.calib),
        (keys::CREF_ORIG, keys::CREF, &inputs.cref),
        (keys::CBLIP_ORIG, keys::CBLIP, &inputs.cblip),
        (keys::STRUCTURAL, keys::STRUCTURAL, &inputs.structural),
        (keys::MASK, keys::MASK, &inputs.mask),
        (keys::FMAP, keys::FMAP, &inputs.fmap),
        (keys::FMAPMAG, keys::FMAPMAG, &inputs.fmapmag),
        (keys::FMAPMAGBRAIN, keys::FMAPMAGBRAIN, &inputs.fmapmagbrain),
        (keys::BIASFIELD, keys::BIASFIELD, &inputs.biasfield),
        (keys::ISEN, keys::ISEN, &inputs.isen),
    ];
    for (key, name, path) in optional {
        if let Some(path) = path {
            let volume = VolumeLoader::load(path, name)
                .with_context(|| format!("loading {key} from {}", path.display()))?;
            registry.insert_volume(key, volume)?;
        }
    }

    if let Some(path) = &config.transforms.asl2struct {
        registry.insert_rigid(keys::ASL2STRUCT, VolumeLoader::read_matrix(path)?)?;
    }
    Ok(())
}

fn load_precomputed_warp(path: Option<&Path>) -> Result<Option<PrecomputedWarp>> {
    path.map(|p| {
        VolumeLoader::load_warp(p)
            .map(PrecomputedWarp::new)
            .with_context(|| format!("loading warp {}", p.display()))
    })
    .transpose()
}

fn write_outputs(
    config: &CorrectionConfig,
    registry: &TransformRegistry,
    distortion: &DistortionOutcome,
) -> Result<()> {
    let out = &config.output_dir;
    fs::create_dir_all(out).with_context(|| format!("creating {}", out.display()))?;

    for key in [keys::ASLDATA, keys::CALIB, keys::CREF, keys::CBLIP, keys::SENSITIVITY] {
        if let Some(volume) = registry.volume(key)? {
            VolumeLoader::save(&volume, out.join(format!("{key}.nii.gz")))?;
        }
    }
    if let Some(warp) = registry.warp(keys::TOTAL_WARP)? {
        VolumeLoader::save_warp(&warp, out.join(format!("{}.nii.gz", keys::TOTAL_WARP)))?;
    }
    if let Some(jacobian) = registry.jacobian(keys::JACOBIAN)? {
        VolumeLoader::save_jacobian(&jacobian, out.join(format!("{}.nii.gz", keys::JACOBIAN)))?;
    }

    if let Some(mats) = registry.rigid_series(keys::ASLDATA_MC_MATS)? {
        let path = out.join(format!("{}.mat", keys::ASLDATA_MC_MATS));
        VolumeLoader::write_motion_matrices(path, &mats)?;
    }
    for key in [keys::ASL2CALIB, keys::CALIB2ASL, keys::FMAP2STRUCT] {
        if let Some(t) = registry.rigid(key)? {
            VolumeLoader::write_matrix(out.join(format!("{key}.mat")), &t)?;
        }
    }

    let phase_reversed = distortion
        .warp()
        .is_some_and(|w| w.source == DistortionSource::PhaseReversed);
    let timing = (config.distortion.echo_spacing, config.distortion.pe_dir);
    if let (true, (Some(es), Some(dir))) = (phase_reversed, timing) {
        let params = TopupParams::new(dir, es)?;
        VolumeLoader::write_topup_params(out.join("topup_params.txt"), &params)?;
    }

    tracing::info!(dir = %out.display(), "outputs written");
    Ok(())
}
