mod common;

use std::sync::Arc;

use asl_corrections::enums::{
    DistortionSource, InterpolationKernel, PhaseEncodeDirection, WarpSpace,
};
use asl_corrections::motion::PerVolumeEstimator;
use asl_corrections::{
    ApplyOutcome, CorrectionError, CorrectionOrchestrator, CorrectionPlan, DistortionCorrection,
    DistortionEstimators, DistortionOptions, DistortionOutcome, Metadata, MotionCorrection,
    PrecomputedMotion, PrecomputedWarp, ReferenceGrid, RigidTransform, TransformRegistry, Volume,
    VolumeLoader, WarpField, Warning, keys,
};
use common::{
    CentroidEstimator, FieldmapOffsetRegistration, ShiftTopup, grid, moving_block_series,
};
use nalgebra::Vector3;
use ndarray::Axis;

fn block_image(g: &ReferenceGrid, start: usize, name: &str) -> Volume {
    let frame = moving_block_series(g, 1, start, 0).data().index_axis(Axis(3), 0).to_owned();
    Volume::from_frame(frame, g.clone(), Metadata::named(name)).unwrap()
}

fn registry_with_calibration_pair() -> TransformRegistry {
    let g = grid([16, 8, 8], 2.0);
    let mut registry = TransformRegistry::new();
    registry
        .insert_volume(keys::ASLDATA_ORIG, moving_block_series(&g, 4, 3, 2))
        .unwrap();
    registry.insert_volume(keys::CALIB_ORIG, block_image(&g, 5, "calib")).unwrap();
    registry.insert_volume(keys::CBLIP_ORIG, block_image(&g, 5, "cblip")).unwrap();
    registry
}

/// ASL series, structural image and fieldmap triplet on one grid, with an
/// identity ASL→structural matrix. The fieldmap block sits 2 voxels left of
/// the structural block.
fn registry_with_fieldmap() -> TransformRegistry {
    let g = grid([16, 8, 8], 2.0);
    let mut registry = TransformRegistry::new();
    registry
        .insert_volume(keys::ASLDATA_ORIG, moving_block_series(&g, 4, 3, 2))
        .unwrap();
    registry.insert_volume(keys::STRUCTURAL, block_image(&g, 7, "struc")).unwrap();
    for key in [keys::FMAP, keys::FMAPMAG, keys::FMAPMAGBRAIN] {
        registry.insert_volume(key, block_image(&g, 5, key)).unwrap();
    }
    registry
        .insert_rigid(keys::ASL2STRUCT, RigidTransform::identity())
        .unwrap();
    registry
}

fn fieldmap_options(nofmapreg: bool) -> DistortionOptions {
    DistortionOptions {
        echo_spacing: Some(0.0005),
        pe_dir: Some(PhaseEncodeDirection::X),
        nofmapreg,
    }
}

#[test]
fn missing_echo_spacing_skips_phase_reversed_correction() {
    let mut registry = registry_with_calibration_pair();
    let options = DistortionOptions {
        pe_dir: Some(PhaseEncodeDirection::Y),
        ..Default::default()
    };
    let topup = ShiftTopup { mm_per_unit: 2.0 };
    let estimators = DistortionEstimators {
        phase_reversed: Some(&topup),
        ..Default::default()
    };

    let outcome = DistortionCorrection::run(&mut registry, &options, estimators).unwrap();
    let warning = match outcome {
        DistortionOutcome::Skipped(warning) => warning,
        other => panic!("expected skip, got {other:?}"),
    };
    assert!(matches!(
        &warning,
        Warning::PhaseReversedSkipped { reason } if reason.contains("echo spacing")
    ));
    assert_eq!(registry.warnings(), &[warning]);
    assert!(!registry.contains(keys::CBLIP_WARP));

    let plan = CorrectionPlan::collect(&registry).unwrap();
    assert!(!plan.has_distortion());
    assert!(plan.series_tail().is_empty());

    // remaining pipeline completes without distortion correction
    let outcome = CorrectionOrchestrator::default().run(&mut registry).unwrap();
    assert_eq!(outcome, ApplyOutcome::PassedThrough);
    let original = registry.volume(keys::ASLDATA_ORIG).unwrap().unwrap();
    let corrected = registry.volume(keys::ASLDATA).unwrap().unwrap();
    assert!(Arc::ptr_eq(&original, &corrected));
    assert!(registry.contains(keys::CBLIP));
}

#[test]
fn phase_reversed_warp_is_bracketed_by_calibration_transforms() {
    let mut registry = registry_with_calibration_pair();
    MotionCorrection::run(&mut registry, &PerVolumeEstimator::new(CentroidEstimator)).unwrap();

    let options = DistortionOptions {
        echo_spacing: Some(0.0005),
        pe_dir: Some(PhaseEncodeDirection::X),
        nofmapreg: false,
    };
    let topup = ShiftTopup { mm_per_unit: 2.0 };
    let estimators = DistortionEstimators {
        phase_reversed: Some(&topup),
        ..Default::default()
    };
    let outcome = DistortionCorrection::run(&mut registry, &options, estimators).unwrap();
    let applied = outcome.warp().unwrap();
    assert_eq!(applied.source, DistortionSource::PhaseReversed);
    assert_eq!(applied.space, WarpSpace::Calibration);
    assert!(registry.warnings().is_empty());

    let plan = CorrectionPlan::collect(&registry).unwrap();
    assert_eq!(plan.series_tail().len(), 3);
    assert_eq!(plan.calibration_elements().len(), 2);

    let outcome = CorrectionOrchestrator::new(InterpolationKernel::Sinc)
        .run(&mut registry)
        .unwrap();
    assert_eq!(
        outcome,
        ApplyOutcome::Resampled {
            volumes: 4,
            calibration_images: 2
        }
    );

    // a constant warp has unit Jacobian
    let jacobian = registry.jacobian(keys::JACOBIAN).unwrap().unwrap();
    assert!((jacobian.mean() - 1.0).abs() < 1e-6);
    assert!(registry.warp(keys::TOTAL_WARP).unwrap().is_some());

    // every volume and both calibration images end up with the block at x = 6
    let original = registry.require_volume(keys::ASLDATA_ORIG).unwrap();
    let expected = block_image(original.grid(), 6, "expected");
    let asl = registry.require_volume(keys::ASLDATA).unwrap();
    for t in 0..4 {
        let diff = (&asl.frame(t) - &expected.frame(0)).mapv(f32::abs);
        assert!(diff.iter().all(|&d| d < 1e-3), "volume {t}");
    }
    for key in [keys::CALIB, keys::CBLIP] {
        let image = registry.require_volume(key).unwrap();
        let diff = (&image.frame(0) - &expected.frame(0)).mapv(f32::abs);
        assert!(diff.iter().all(|&d| d < 1e-3), "{key}");
    }
}

#[test]
fn precomputed_inputs_round_trip_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let g = grid([16, 8, 8], 2.0);
    let asl = moving_block_series(&g, 4, 3, 2);
    let estimator = PerVolumeEstimator::new(CentroidEstimator);
    let motion = MotionCorrection::estimate(&asl, None, &estimator).unwrap();

    let asl_path = dir.path().join("asl.nii");
    let mats_path = dir.path().join("asl_mc.mat");
    VolumeLoader::save(&asl, &asl_path).unwrap();
    VolumeLoader::write_motion_matrices(&mats_path, motion.transforms()).unwrap();

    let mut registry = TransformRegistry::new();
    registry
        .insert_volume(keys::ASLDATA_ORIG, VolumeLoader::load(&asl_path, keys::ASLDATA).unwrap())
        .unwrap();
    let mats = VolumeLoader::read_motion_matrices(&mats_path).unwrap();
    MotionCorrection::run(&mut registry, &PrecomputedMotion::new(mats)).unwrap();
    CorrectionOrchestrator::default().run(&mut registry).unwrap();

    let out_path = dir.path().join("asl_corrected.nii");
    let written = registry.require_volume(keys::ASLDATA).unwrap();
    VolumeLoader::save(&written, &out_path).unwrap();
    let corrected = VolumeLoader::load(&out_path, "asldata").unwrap();
    assert!(corrected.grid().same_geometry(&g));
    for t in 0..4 {
        let diff = (&corrected.frame(t) - &asl.frame(2)).mapv(f32::abs);
        assert!(diff.iter().all(|&d| d < 1e-3), "volume {t}");
    }
}

#[test]
fn fieldmap_registration_feeds_the_distortion_estimate() {
    let registration = FieldmapOffsetRegistration;
    let fmap_to_struct = CentroidEstimator;

    let mut registry = registry_with_fieldmap();
    let estimators = DistortionEstimators {
        registration: Some(&registration),
        fieldmap_registration: Some(&fmap_to_struct),
        ..Default::default()
    };
    let outcome =
        DistortionCorrection::run(&mut registry, &fieldmap_options(false), estimators).unwrap();
    let applied = outcome.warp().unwrap();
    assert_eq!(applied.source, DistortionSource::Fieldmap);
    assert_eq!(applied.space, WarpSpace::Analysis);

    let fmap2struct = registry.rigid(keys::FMAP2STRUCT).unwrap().unwrap();
    assert!((fmap2struct.translation_part() - Vector3::new(4.0, 0.0, 0.0)).norm() < 1e-9);
    let warp = registry.warp(keys::FMAP_WARP).unwrap().unwrap();
    assert!((warp.displacement_at_voxel(3, 3, 3) - Vector3::new(4.0, 0.0, 0.0)).norm() < 1e-5);

    // with nofmapreg the fieldmap is taken as already aligned
    let mut registry = registry_with_fieldmap();
    DistortionCorrection::run(&mut registry, &fieldmap_options(true), estimators).unwrap();
    assert!(!registry.contains(keys::FMAP2STRUCT));
    let warp = registry.warp(keys::FMAP_WARP).unwrap().unwrap();
    assert!(warp.displacement_at_voxel(3, 3, 3).norm() < 1e-5);
}

#[test]
fn fieldmap_warp_follows_calib2asl_for_calibration_images() {
    let g = grid([16, 8, 8], 2.0);
    let mut registry = registry_with_fieldmap();
    registry.insert_volume(keys::CALIB_ORIG, block_image(&g, 5, "calib")).unwrap();
    MotionCorrection::run(&mut registry, &PerVolumeEstimator::new(CentroidEstimator)).unwrap();

    // shifts only voxels from x = 6 on, so warp and calib2asl do not commute
    let step = WarpField::from_fn(g.clone(), |x| {
        Vector3::new(if x.x >= 11.0 { 2.0 } else { 0.0 }, 0.0, 0.0)
    });
    let precomputed = PrecomputedWarp::new(step);
    let estimators = DistortionEstimators {
        registration: Some(&precomputed),
        ..Default::default()
    };
    DistortionCorrection::run(&mut registry, &fieldmap_options(true), estimators).unwrap();

    let plan = CorrectionPlan::collect(&registry).unwrap();
    let calibration = plan.calibration_elements();
    assert_eq!(calibration.len(), 2);
    assert!(!calibration[0].is_warp());
    assert!(calibration[1].is_warp());

    CorrectionOrchestrator::new(InterpolationKernel::Sinc)
        .run(&mut registry)
        .unwrap();
    let asl = registry.require_volume(keys::ASLDATA).unwrap();
    let calib = registry.require_volume(keys::CALIB).unwrap();

    let middle = asl.frame(2);
    assert!(middle[[6, 3, 3]] > 0.0 && middle[[7, 3, 3]] > 0.0);
    assert_eq!(middle[[5, 3, 3]], 0.0);
    assert_eq!(middle[[8, 3, 3]], 0.0);
    for t in 0..4 {
        let diff = (&asl.frame(t) - &middle).mapv(f32::abs);
        assert!(diff.iter().all(|&d| d < 1e-3), "volume {t}");
    }
    let diff = (&calib.frame(0) - &middle).mapv(f32::abs);
    assert!(diff.iter().all(|&d| d < 1e-3));
}

#[test]
fn warp_on_an_empty_grid_is_a_configuration_error() {
    let mut registry = TransformRegistry::new();
    registry
        .insert_volume(keys::ASLDATA_ORIG, moving_block_series(&grid([16, 8, 8], 2.0), 4, 3, 2))
        .unwrap();
    registry
        .insert_warp(keys::GDC_WARP, WarpField::zeros(grid([0, 8, 8], 2.0)))
        .unwrap();

    let err = CorrectionOrchestrator::default().run(&mut registry).unwrap_err();
    assert!(matches!(err, CorrectionError::EmptyReferenceGrid));
    assert!(!registry.contains(keys::ASLDATA));
    assert!(!registry.contains(keys::REFERENCE));
}
