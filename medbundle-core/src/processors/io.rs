//! Loading and saving volumes referenced by sample keys.

use crate::core::config::{ConfigError, ConfigValidator};
use crate::core::{BundleError, BundleResult, Transform, VolumeReader, VolumeWriter};
use crate::domain::{ChannelDim, Field, Sample, Volume};
use crate::utils::{NiftiReader, NiftiWriter};
use ndarray::{Axis, IxDyn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Replaces path fields with the volumes they point to.
#[derive(Debug, Clone)]
pub struct LoadImaged {
    keys: Vec<String>,
    readers: Vec<Arc<dyn VolumeReader>>,
}

impl LoadImaged {
    /// Creates a loader for `keys` with the NIfTI reader registered.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            readers: vec![Arc::new(NiftiReader::new())],
        }
    }

    /// Registers a reader that takes precedence over the existing ones.
    pub fn register<R: VolumeReader + 'static>(mut self, reader: R) -> Self {
        self.readers.insert(0, Arc::new(reader));
        self
    }

    fn load(&self, path: &Path) -> BundleResult<Volume> {
        let reader = self
            .readers
            .iter()
            .find(|r| r.supports(path))
            .ok_or_else(|| {
                let hint = if path.extension().is_some_and(|e| e == "gz") {
                    " (compressed NIfTI is not supported, decompress to .nii)"
                } else {
                    ""
                };
                BundleError::invalid_input(format!(
                    "no registered reader supports '{}'{hint}",
                    path.display()
                ))
            })?;
        reader.read(path)
    }
}

impl Transform for LoadImaged {
    fn name(&self) -> &'static str {
        "LoadImaged"
    }

    fn apply(&self, mut sample: Sample) -> BundleResult<Sample> {
        for key in &self.keys {
            match sample.remove(key) {
                Some(Field::Path(path)) => {
                    let volume = self.load(&path)?;
                    debug!(
                        key = %key,
                        path = %path.display(),
                        shape = ?volume.shape(),
                        "loaded volume"
                    );
                    sample.insert(key.clone(), Field::Volume(volume));
                }
                Some(loaded @ Field::Volume(_)) => {
                    sample.insert(key.clone(), loaded);
                }
                None => {
                    return Err(BundleError::invalid_input(format!(
                        "key '{key}' is not present in the sample"
                    )));
                }
            }
        }
        Ok(sample)
    }
}

/// Configuration for [`SaveImaged`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveImageConfig {
    /// Root directory for written files.
    pub output_dir: PathBuf,
    /// Suffix appended to the source stem, e.g. `image` -> `image_seg`.
    #[serde(default = "SaveImageConfig::default_output_postfix")]
    pub output_postfix: String,
    /// Whether each volume gets its own sub-directory named after its stem.
    #[serde(default = "SaveImageConfig::default_separate_folder")]
    pub separate_folder: bool,
}

impl SaveImageConfig {
    fn default_output_postfix() -> String {
        "trans".to_string()
    }

    fn default_separate_folder() -> bool {
        true
    }

    /// Creates a configuration writing under `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            output_postfix: Self::default_output_postfix(),
            separate_folder: Self::default_separate_folder(),
        }
    }

    /// Sets the output postfix.
    pub fn with_postfix(mut self, postfix: impl Into<String>) -> Self {
        self.output_postfix = postfix.into();
        self
    }

    /// Sets whether outputs are grouped per source stem.
    pub fn with_separate_folder(mut self, separate_folder: bool) -> Self {
        self.separate_folder = separate_folder;
        self
    }

    /// Destination of the file derived from `stem`.
    pub fn output_path(&self, stem: &str, extension: &str) -> PathBuf {
        let dir = if self.separate_folder {
            self.output_dir.join(stem)
        } else {
            self.output_dir.clone()
        };
        let name = if self.output_postfix.is_empty() {
            format!("{stem}{extension}")
        } else {
            format!("{stem}_{}{extension}", self.output_postfix)
        };
        dir.join(name)
    }
}

impl ConfigValidator for SaveImageConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidConfig {
                message: "output_dir must not be empty".to_string(),
            });
        }
        if self.output_postfix.contains(std::path::is_separator) {
            return Err(ConfigError::InvalidConfig {
                message: format!(
                    "output_postfix '{}' must not contain path separators",
                    self.output_postfix
                ),
            });
        }
        Ok(())
    }
}

/// Writes volumes to disk, named after the file they were derived from.
///
/// Channel-first volumes are written spatial-first: a single channel is
/// squeezed away, several channels end up on the last axis. After writing,
/// the destination is recorded in the sample under `<key>_saved_path`.
#[derive(Debug, Clone)]
pub struct SaveImaged {
    keys: Vec<String>,
    config: SaveImageConfig,
    writer: Arc<dyn VolumeWriter>,
}

impl SaveImaged {
    /// Creates a saver for `keys` using the NIfTI writer.
    pub fn new<I, S>(keys: I, config: SaveImageConfig) -> BundleResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        config.validate()?;
        Ok(Self {
            keys: keys.into_iter().map(Into::into).collect(),
            config,
            writer: Arc::new(NiftiWriter::new()),
        })
    }

    /// Replaces the writer.
    pub fn with_writer<W: VolumeWriter + 'static>(mut self, writer: W) -> Self {
        self.writer = Arc::new(writer);
        self
    }

    /// The output configuration.
    pub fn config(&self) -> &SaveImageConfig {
        &self.config
    }

    fn to_spatial_first(volume: &Volume) -> Volume {
        let data = match volume.meta.channel_dim {
            ChannelDim::NoChannel => volume.data.clone(),
            ChannelDim::Axis(axis) if volume.data.len_of(Axis(axis)) == 1 => {
                volume.data.index_axis(Axis(axis), 0).to_owned()
            }
            ChannelDim::Axis(axis) => {
                let ndim = volume.data.ndim();
                let mut order: Vec<usize> = (0..ndim).filter(|&a| a != axis).collect();
                order.push(axis);
                volume
                    .data
                    .view()
                    .permuted_axes(IxDyn(&order))
                    .as_standard_layout()
                    .into_owned()
            }
        };
        let channel_dim = if data.ndim() > volume.meta.spatial_shape.len() {
            ChannelDim::Axis(data.ndim() - 1)
        } else {
            ChannelDim::NoChannel
        };
        let mut meta = volume.meta.clone();
        meta.channel_dim = channel_dim;
        Volume::new(data, meta)
    }
}

impl Transform for SaveImaged {
    fn name(&self) -> &'static str {
        "SaveImaged"
    }

    fn apply(&self, mut sample: Sample) -> BundleResult<Sample> {
        for key in &self.keys {
            let volume = sample.volume(key)?;
            let stem = volume.meta.stem().ok_or_else(|| {
                BundleError::invalid_input(format!(
                    "volume under '{key}' has no source filename to derive an output name from"
                ))
            })?;
            let path = self.config.output_path(&stem, self.writer.extension());
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            self.writer.write(&Self::to_spatial_first(volume), &path)?;
            info!(key = %key, path = %path.display(), "saved volume");
            sample.insert(format!("{key}_saved_path"), Field::Path(path));
        }
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::VolumeMeta;
    use crate::utils::read_nifti;
    use ndarray::{Array3, Array4};

    fn source_volume(path: &Path) -> Volume {
        let data = Array3::from_shape_fn((3, 2, 2), |(x, y, z)| (x + 2 * y + 4 * z) as f32);
        Volume::new(
            data.into_dyn(),
            VolumeMeta::new(vec![3, 2, 2], ChannelDim::NoChannel).with_filename(path),
        )
    }

    #[test]
    fn output_path_layouts() {
        let config = SaveImageConfig::new("/out").with_postfix("seg");
        assert_eq!(
            config.output_path("image", ".nii"),
            PathBuf::from("/out/image/image_seg.nii")
        );
        let flat = config.clone().with_separate_folder(false).with_postfix("");
        assert_eq!(flat.output_path("image", ".nii"), PathBuf::from("/out/image.nii"));
    }

    #[test]
    fn config_defaults_from_json() -> Result<(), Box<dyn std::error::Error>> {
        let config: SaveImageConfig = serde_json::from_str(r#"{"output_dir": "/tmp/out"}"#)?;
        assert_eq!(config.output_postfix, "trans");
        assert!(config.separate_folder);
        Ok(())
    }

    #[test]
    fn rejects_separator_in_postfix() {
        let config = SaveImageConfig::new("/out").with_postfix("a/b");
        assert!(SaveImaged::new(["pred"], config).is_err());
    }

    #[test]
    fn load_then_save_round_trips_through_disk() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("scan.nii");
        crate::utils::write_nifti(&source_volume(&input), &input)?;

        let loaded = LoadImaged::new(["image"]).apply(Sample::new().with_path("image", &input))?;
        assert_eq!(loaded.volume("image")?.shape(), &[3, 2, 2]);

        let out_dir = dir.path().join("out");
        let saver =
            SaveImaged::new(["image"], SaveImageConfig::new(&out_dir).with_postfix("copy"))?;
        let saved = saver.apply(loaded)?;

        let expected = out_dir.join("scan").join("scan_copy.nii");
        assert!(expected.exists());
        assert_eq!(
            saved.get("image_saved_path"),
            Some(&Field::Path(expected.clone()))
        );
        assert_eq!(read_nifti(&expected)?.data, source_volume(&input).data);
        Ok(())
    }

    #[test]
    fn multi_channel_volumes_are_written_channel_last() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let data = Array4::from_shape_fn((2, 3, 2, 2), |(c, x, _, _)| (c * 10 + x) as f32);
        let mut volume = Volume::from_channel_first(data);
        volume.meta = volume.meta.with_filename(dir.path().join("pred.nii"));

        let saver = SaveImaged::new(["pred"], SaveImageConfig::new(dir.path()))?;
        saver.apply(Sample::new().with_volume("pred", volume))?;

        let written = read_nifti(dir.path().join("pred").join("pred_trans.nii"))?;
        assert_eq!(written.shape(), &[3, 2, 2, 2]);
        assert_eq!(written.data[[2, 0, 0, 1]], 12.0);
        Ok(())
    }

    #[test]
    fn single_channel_volumes_are_squeezed() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let mut volume = Volume::from_channel_first(Array4::ones((1, 2, 2, 2)));
        volume.meta = volume.meta.with_filename("/data/case.nii");

        let saver = SaveImaged::new(["pred"], SaveImageConfig::new(dir.path()))?;
        saver.apply(Sample::new().with_volume("pred", volume))?;

        let written = read_nifti(dir.path().join("case").join("case_trans.nii"))?;
        assert_eq!(written.shape(), &[2, 2, 2]);
        Ok(())
    }

    #[test]
    fn missing_filename_is_an_error() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let volume = Volume::from_channel_first(Array4::zeros((1, 2, 2, 2)));
        let saver = SaveImaged::new(["pred"], SaveImageConfig::new(dir.path()))?;
        assert!(saver.apply(Sample::new().with_volume("pred", volume)).is_err());
        Ok(())
    }

    #[test]
    fn compressed_inputs_get_a_hint() {
        let err = LoadImaged::new(["image"])
            .apply(Sample::new().with_path("image", "/data/image.nii.gz"))
            .unwrap_err();
        assert!(err.to_string().contains("compressed NIfTI"));
    }
}
