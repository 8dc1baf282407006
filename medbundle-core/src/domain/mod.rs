//! Domain types: volumes, their metadata, and keyed samples.

pub mod sample;
pub mod volume;

pub use sample::{Field, Sample};
pub use volume::{ChannelDim, Volume, VolumeMeta, file_stem, identity_affine};
