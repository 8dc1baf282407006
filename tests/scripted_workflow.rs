use medbundle::prelude::*;
use ndarray::Array3;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn write_case(dir: &Path, name: &str) -> Result<PathBuf, BundleError> {
    let path = dir.join(name);
    let data = Array3::from_shape_fn((20, 20, 12), |(x, y, z)| {
        let d2 =
            (x as f32 - 10.0).powi(2) + (y as f32 - 10.0).powi(2) + (z as f32 - 6.0).powi(2);
        if d2 < 25.0 { 200.0 } else { -50.0 }
    });
    let mut affine = medbundle_core::domain::identity_affine();
    affine[0][0] = 1.5;
    affine[1][1] = 1.5;
    affine[2][2] = 3.0;
    let meta = VolumeMeta::new(vec![20, 20, 12], ChannelDim::NoChannel).with_affine(affine);
    write_nifti(&Volume::new(data.into_dyn(), meta), &path)?;
    Ok(path)
}

fn files_under(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            files.extend(files_under(&path)?);
        } else {
            files.push(path);
        }
    }
    Ok(files)
}

#[test]
fn default_workflow_segments_a_volume() -> Result<(), BundleError> {
    let dir = tempfile::tempdir()?;
    let input = write_case(dir.path(), "spleen_10.nii")?;
    let output_dir = dir.path().join("eval");

    let mut workflow = ScriptedInferenceWorkflow::new(&input, &output_dir);
    workflow.initialize(&Determinism::default())?;
    workflow.run()?;

    let saved = output_dir.join("spleen_10").join("spleen_10_seg.nii");
    assert_eq!(files_under(&output_dir)?, vec![saved.clone()]);
    let label = read_nifti(&saved)?;
    assert_eq!(label.shape(), &[20, 20, 12]);
    assert!(label.data.iter().all(|&v| v == 0.0 || v == 1.0));
    assert_eq!(label.meta.affine[0][0], 1.5);
    assert_eq!(label.meta.affine[2][2], 3.0);

    let outputs = workflow.evaluator().map(|e| e.state().output.len());
    assert_eq!(outputs, Some(1));
    assert!(workflow.finalize());
    Ok(())
}

#[test]
fn same_seed_builds_same_prediction() -> Result<(), BundleError> {
    let dir = tempfile::tempdir()?;
    let input = write_case(dir.path(), "case.nii")?;

    let mut labels = Vec::new();
    for run in ["a", "b"] {
        let output_dir = dir.path().join(run);
        let mut workflow = ScriptedInferenceWorkflow::new(&input, &output_dir);
        workflow.initialize(&Determinism::seeded(42))?;
        workflow.run()?;
        labels.push(read_nifti(output_dir.join("case").join("case_seg.nii"))?.data);
    }
    assert_eq!(labels[0], labels[1]);
    Ok(())
}

#[test]
fn assigned_properties_round_trip_and_are_used() -> Result<(), BundleError> {
    let dir = tempfile::tempdir()?;
    let input = write_case(dir.path(), "case.nii")?;
    let mut workflow = ScriptedInferenceWorkflow::new(&input, dir.path().join("out"));

    let network: SharedNetwork = Arc::new(UNet::new(
        UNetConfig::default().with_num_res_units(0),
        &mut Determinism::seeded(1).rng(),
    )?);
    let inferer: SharedInferer = Arc::new(SlidingWindowInferer::new(
        SlidingWindowConfig::new([32, 32, 16])
            .with_sw_batch_size(2)
            .with_mode(BlendMode::Gaussian),
    )?);
    let pre = Arc::new(
        Compose::default()
            .then(LoadImaged::new(["image"]))
            .then(EnsureChannelFirstd::new(["image"])),
    );
    let post = Arc::new(Compose::default().then(AsDiscreted::argmax(["pred"])));

    let cases = [
        ("bundle_root", PropertyValue::from(dir.path())),
        ("device", PropertyValue::from(Device::Cpu)),
        ("network_def", PropertyValue::from(network.clone())),
        ("inferer", PropertyValue::from(inferer.clone())),
        ("preprocessing", PropertyValue::from(pre.clone())),
        ("postprocessing", PropertyValue::from(post.clone())),
    ];
    for (name, value) in cases {
        assert_eq!(
            workflow.set_property_by_name(name, value.clone())?,
            PropertyAssignment::Assigned
        );
        assert_eq!(workflow.property(name)?, PropertyLookup::Value(value));
    }

    // Assigned components survive initialize untouched.
    workflow.initialize(&Determinism::default())?;
    let kept = [
        ("network_def", PropertyValue::Network(network)),
        ("inferer", PropertyValue::Inferer(inferer)),
        ("preprocessing", PropertyValue::Transform(pre)),
        ("postprocessing", PropertyValue::Transform(post)),
    ];
    for (name, value) in kept {
        assert_eq!(workflow.property(name)?, PropertyLookup::Value(value));
    }

    workflow.run()?;
    let state = workflow.evaluator().map(|e| e.state().clone());
    let pred = state.as_ref().map(|s| s.output[0].volume("pred").map(|v| v.shape().to_vec()));
    assert_eq!(pred.transpose()?, Some(vec![1, 20, 20, 12]));
    // No save step was configured.
    assert!(!dir.path().join("out").exists());
    Ok(())
}

#[test]
fn unknown_properties_follow_their_declaration() -> Result<(), BundleError> {
    let mut workflow = ScriptedInferenceWorkflow::new("in.nii", "out");

    let err = workflow.property("dataset").unwrap_err();
    assert_eq!(
        err.to_string(),
        "unsupported property 'dataset' is required in the bundle properties."
    );
    assert!(workflow.property("key_metric")?.is_unsupported());
    assert_eq!(
        workflow.set_property_by_name("handlers", PropertyValue::from("x"))?,
        PropertyAssignment::Ignored
    );
    assert!(matches!(
        workflow.property("not_declared"),
        Err(BundleError::UnknownProperty { .. })
    ));

    workflow.add_property("my_required", true, "a custom requirement");
    assert!(workflow.property("my_required").is_err());
    assert!(workflow.check_properties().iter().any(|n| n == "my_required"));
    Ok(())
}

#[test]
fn lifecycle_is_enforced() -> Result<(), BundleError> {
    let dir = tempfile::tempdir()?;
    let input = write_case(dir.path(), "case.nii")?;
    let mut workflow = ScriptedInferenceWorkflow::new(&input, dir.path().join("out"));

    assert!(matches!(workflow.run(), Err(BundleError::NotInitialized { .. })));
    assert!(workflow.finalize());
    assert_eq!(workflow.state(), WorkflowState::Finalized);
    assert!(matches!(
        workflow.initialize(&Determinism::default()),
        Err(BundleError::InvalidState { .. })
    ));
    Ok(())
}

#[test]
fn unavailable_device_fails_initialize() -> Result<(), BundleError> {
    let dir = tempfile::tempdir()?;
    let input = write_case(dir.path(), "case.nii")?;
    let mut workflow = ScriptedInferenceWorkflow::new(&input, dir.path().join("out"));
    workflow.set_property_by_name("device", "cuda:0".parse::<Device>()?.into())?;

    let err = workflow.initialize(&Determinism::default()).unwrap_err();
    assert!(matches!(err, BundleError::DeviceUnavailable { .. }));
    assert_eq!(workflow.state(), WorkflowState::Uninitialized);
    Ok(())
}

#[test]
fn missing_input_surfaces_on_run() -> Result<(), BundleError> {
    let dir = tempfile::tempdir()?;
    let mut workflow =
        ScriptedInferenceWorkflow::new(dir.path().join("absent.nii"), dir.path().join("out"))
            .with_loader_config(LoaderConfig::default());
    workflow.initialize(&Determinism::default())?;
    assert!(workflow.run().is_err());
    Ok(())
}
