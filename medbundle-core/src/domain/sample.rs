//! Keyed samples flowing through dictionary transforms.

use super::volume::Volume;
use crate::core::{BundleError, BundleResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A single entry of a sample.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// A file that has not been loaded yet.
    Path(PathBuf),
    /// A loaded volume.
    Volume(Volume),
}

impl Field {
    /// Short name of the field kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Field::Path(_) => "path",
            Field::Volume(_) => "volume",
        }
    }
}

/// A dictionary of named fields, e.g. `{"image": ..., "pred": ...}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    fields: BTreeMap<String, Field>,
}

impl Sample {
    /// Creates an empty sample.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a path field.
    pub fn with_path(mut self, key: impl Into<String>, path: impl AsRef<Path>) -> Self {
        self.fields
            .insert(key.into(), Field::Path(path.as_ref().to_path_buf()));
        self
    }

    /// Adds a volume field.
    pub fn with_volume(mut self, key: impl Into<String>, volume: Volume) -> Self {
        self.fields.insert(key.into(), Field::Volume(volume));
        self
    }

    /// Inserts a field, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, field: Field) -> Option<Field> {
        self.fields.insert(key.into(), field)
    }

    /// Returns the field stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Field> {
        self.fields.get(key)
    }

    /// Removes and returns the field stored under `key`.
    pub fn remove(&mut self, key: &str) -> Option<Field> {
        self.fields.remove(key)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Iterates over the keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the sample has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the volume stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the key is missing or holds an unloaded path.
    pub fn volume(&self, key: &str) -> BundleResult<&Volume> {
        match self.fields.get(key) {
            Some(Field::Volume(volume)) => Ok(volume),
            Some(other) => Err(wrong_kind(key, other)),
            None => Err(missing_key(key)),
        }
    }

    /// Mutable access to the volume stored under `key`.
    pub fn volume_mut(&mut self, key: &str) -> BundleResult<&mut Volume> {
        match self.fields.get_mut(key) {
            Some(Field::Volume(volume)) => Ok(volume),
            Some(other) => Err(wrong_kind(key, other)),
            None => Err(missing_key(key)),
        }
    }

    /// Removes the volume stored under `key` and returns it.
    pub fn take_volume(&mut self, key: &str) -> BundleResult<Volume> {
        match self.fields.remove(key) {
            Some(Field::Volume(volume)) => Ok(volume),
            Some(other) => {
                let err = wrong_kind(key, &other);
                self.fields.insert(key.to_string(), other);
                Err(err)
            }
            None => Err(missing_key(key)),
        }
    }
}

fn missing_key(key: &str) -> BundleError {
    BundleError::invalid_input(format!("key '{key}' is not present in the sample"))
}

fn wrong_kind(key: &str, field: &Field) -> BundleError {
    BundleError::invalid_input(format!(
        "key '{key}' holds a {} but a volume is required",
        field.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn volume_lookup_reports_unloaded_paths() {
        let sample = Sample::new().with_path("image", "/tmp/image.nii");
        let err = sample.volume("image").unwrap_err();
        assert!(err.to_string().contains("holds a path"));
        assert!(sample.volume("label").is_err());
    }

    #[test]
    fn take_volume_keeps_path_on_error() {
        let mut sample = Sample::new().with_path("image", "/tmp/image.nii");
        assert!(sample.take_volume("image").is_err());
        assert!(sample.contains_key("image"));
    }

    #[test]
    fn take_volume_removes_entry() -> Result<(), BundleError> {
        let volume = Volume::from_channel_first(Array4::zeros((1, 2, 2, 2)));
        let mut sample = Sample::new().with_volume("pred", volume.clone());
        assert_eq!(sample.take_volume("pred")?, volume);
        assert!(sample.is_empty());
        Ok(())
    }
}
