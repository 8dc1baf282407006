//! NIfTI-1 volume reader and writer.
//!
//! Only single-file (`n+1`) uncompressed images are handled. Voxels are
//! stored on disk with the first axis varying fastest; arrays returned by the
//! reader are in standard (row-major) layout with axes ordered `x, y, z, ...`.

use crate::core::{BundleError, BundleResult, VolumeReader, VolumeWriter};
use crate::domain::{ChannelDim, Volume, VolumeMeta};
use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Write};
use std::ops::Range;
use std::path::Path;
use tracing::debug;

/// Size of a NIfTI-1 header in bytes.
const HEADER_SIZE: i32 = 348;
/// Offset of voxel data in files written by [`NiftiWriter`].
const VOX_OFFSET: usize = 352;
/// Magic of single-file NIfTI-1 images.
const MAGIC_SINGLE: &[u8; 4] = b"n+1\0";
/// Magic of header/image pairs (`.hdr` + `.img`).
const MAGIC_PAIR: &[u8; 4] = b"ni1\0";
/// Units code: millimetres and seconds.
const UNITS_MM_SEC: u8 = 2 | 8;
/// sform code for "aligned to another file or anatomical truth".
const SFORM_ALIGNED: i16 = 2;

/// Voxel storage types understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NiftiDataType {
    U8,
    I8,
    I16,
    U16,
    I32,
    F32,
    F64,
}

impl NiftiDataType {
    /// Maps a header datatype code to a storage type.
    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            2 => Some(Self::U8),
            4 => Some(Self::I16),
            8 => Some(Self::I32),
            16 => Some(Self::F32),
            64 => Some(Self::F64),
            256 => Some(Self::I8),
            512 => Some(Self::U16),
            _ => None,
        }
    }

    /// Header datatype code.
    pub fn code(self) -> i16 {
        match self {
            Self::U8 => 2,
            Self::I16 => 4,
            Self::I32 => 8,
            Self::F32 => 16,
            Self::F64 => 64,
            Self::I8 => 256,
            Self::U16 => 512,
        }
    }

    /// Bytes per voxel.
    pub fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// The subset of the NIfTI-1 header the codec relies on.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    pub dim: [i16; 8],
    pub datatype: i16,
    pub pixdim: [f32; 8],
    pub vox_offset: f32,
    pub scl_slope: f32,
    pub scl_inter: f32,
    pub qform_code: i16,
    pub sform_code: i16,
    pub quatern: [f32; 3],
    pub qoffset: [f32; 3],
    pub srow: [[f32; 4]; 3],
    pub magic: [u8; 4],
    pub little_endian: bool,
}

impl NiftiHeader {
    /// Parses a header, detecting the byte order from `sizeof_hdr`.
    pub fn parse(bytes: &[u8], path: &Path) -> BundleResult<Self> {
        if bytes.len() < HEADER_SIZE as usize {
            return Err(BundleError::nifti(
                path,
                format!("file is {} bytes, shorter than a header", bytes.len()),
            ));
        }
        let header = if LittleEndian::read_i32(&bytes[0..4]) == HEADER_SIZE {
            Self::parse_with::<LittleEndian>(bytes, true)?
        } else if BigEndian::read_i32(&bytes[0..4]) == HEADER_SIZE {
            Self::parse_with::<BigEndian>(bytes, false)?
        } else {
            return Err(BundleError::nifti(path, "sizeof_hdr is not 348"));
        };

        if &header.magic == MAGIC_PAIR {
            return Err(BundleError::nifti(
                path,
                "header/image pairs are not supported, use a single .nii file",
            ));
        }
        if &header.magic != MAGIC_SINGLE {
            return Err(BundleError::nifti(path, "bad magic, not a NIfTI-1 file"));
        }
        Ok(header)
    }

    fn parse_with<B: ByteOrder>(bytes: &[u8], little_endian: bool) -> std::io::Result<Self> {
        let mut cur = Cursor::new(bytes);

        cur.set_position(40);
        let mut dim = [0i16; 8];
        for d in dim.iter_mut() {
            *d = cur.read_i16::<B>()?;
        }

        cur.set_position(70);
        let datatype = cur.read_i16::<B>()?;

        cur.set_position(76);
        let mut pixdim = [0f32; 8];
        for p in pixdim.iter_mut() {
            *p = cur.read_f32::<B>()?;
        }
        let vox_offset = cur.read_f32::<B>()?;
        let scl_slope = cur.read_f32::<B>()?;
        let scl_inter = cur.read_f32::<B>()?;

        cur.set_position(252);
        let qform_code = cur.read_i16::<B>()?;
        let sform_code = cur.read_i16::<B>()?;
        let mut quatern = [0f32; 3];
        for q in quatern.iter_mut() {
            *q = cur.read_f32::<B>()?;
        }
        let mut qoffset = [0f32; 3];
        for q in qoffset.iter_mut() {
            *q = cur.read_f32::<B>()?;
        }
        let mut srow = [[0f32; 4]; 3];
        for row in srow.iter_mut() {
            for v in row.iter_mut() {
                *v = cur.read_f32::<B>()?;
            }
        }

        cur.set_position(344);
        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic)?;

        Ok(Self {
            dim,
            datatype,
            pixdim,
            vox_offset,
            scl_slope,
            scl_inter,
            qform_code,
            sform_code,
            quatern,
            qoffset,
            srow,
            magic,
            little_endian,
        })
    }

    /// Array shape declared by `dim`.
    pub fn shape(&self, path: &Path) -> BundleResult<Vec<usize>> {
        let ndim = self.dim[0];
        if !(1..=7).contains(&ndim) {
            return Err(BundleError::nifti(path, format!("invalid dim[0] = {ndim}")));
        }
        self.dim[1..=ndim as usize]
            .iter()
            .map(|&d| {
                if d < 1 {
                    Err(BundleError::nifti(path, format!("invalid dimension {d}")))
                } else {
                    Ok(d as usize)
                }
            })
            .collect()
    }

    /// Byte range of the voxel data in a file of `file_len` bytes.
    ///
    /// # Errors
    ///
    /// Returns a NIfTI error when `vox_offset` is not finite, points into the
    /// header or past the end of the file, or when the declared shape does
    /// not fit in the file.
    pub fn voxel_range(
        &self,
        shape: &[usize],
        datatype: NiftiDataType,
        file_len: usize,
        path: &Path,
    ) -> BundleResult<Range<usize>> {
        let vox_offset = self.vox_offset;
        if !vox_offset.is_finite()
            || vox_offset < HEADER_SIZE as f32
            || vox_offset as f64 > file_len as f64
        {
            return Err(BundleError::nifti(
                path,
                format!("invalid vox_offset {vox_offset} for a file of {file_len} bytes"),
            ));
        }
        let offset = vox_offset as usize;

        let end = shape
            .iter()
            .try_fold(datatype.size(), |bytes, &d| bytes.checked_mul(d))
            .and_then(|len| offset.checked_add(len))
            .ok_or_else(|| {
                BundleError::nifti(path, format!("dimensions {shape:?} overflow the address space"))
            })?;
        if end > file_len {
            return Err(BundleError::nifti(
                path,
                format!("expected {end} bytes of voxel data, file has {file_len}"),
            ));
        }
        Ok(offset..end)
    }

    /// Voxel-to-world affine: sform when set, else qform, else pixdim scaling.
    pub fn affine(&self) -> [[f64; 4]; 4] {
        let mut affine = crate::domain::identity_affine();

        if self.sform_code > 0 {
            for (row, srow) in affine.iter_mut().zip(self.srow.iter()) {
                for (dst, &src) in row.iter_mut().zip(srow.iter()) {
                    *dst = src as f64;
                }
            }
            return affine;
        }

        let spacing = |i: usize| {
            let p = self.pixdim[i] as f64;
            if p == 0.0 { 1.0 } else { p.abs() }
        };

        if self.qform_code > 0 {
            let [b, c, d] = self.quatern.map(f64::from);
            let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
            let rotation = [
                [
                    a * a + b * b - c * c - d * d,
                    2.0 * (b * c - a * d),
                    2.0 * (b * d + a * c),
                ],
                [
                    2.0 * (b * c + a * d),
                    a * a + c * c - b * b - d * d,
                    2.0 * (c * d - a * b),
                ],
                [
                    2.0 * (b * d - a * c),
                    2.0 * (c * d + a * b),
                    a * a + d * d - b * b - c * c,
                ],
            ];
            let qfac = if self.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
            let scale = [spacing(1), spacing(2), qfac * spacing(3)];
            for r in 0..3 {
                for col in 0..3 {
                    affine[r][col] = rotation[r][col] * scale[col];
                }
                affine[r][3] = self.qoffset[r] as f64;
            }
            return affine;
        }

        for i in 0..3 {
            affine[i][i] = spacing(i + 1);
        }
        affine
    }
}

fn decode_with<B: ByteOrder>(raw: &[u8], datatype: NiftiDataType) -> Vec<f32> {
    let size = datatype.size();
    raw.chunks_exact(size)
        .map(|chunk| match datatype {
            NiftiDataType::U8 => chunk[0] as f32,
            NiftiDataType::I8 => chunk[0] as i8 as f32,
            NiftiDataType::I16 => B::read_i16(chunk) as f32,
            NiftiDataType::U16 => B::read_u16(chunk) as f32,
            NiftiDataType::I32 => B::read_i32(chunk) as f32,
            NiftiDataType::F32 => B::read_f32(chunk),
            NiftiDataType::F64 => B::read_f64(chunk) as f32,
        })
        .collect()
}

/// Reads single-file NIfTI-1 volumes (`.nii`).
#[derive(Debug, Clone, Copy, Default)]
pub struct NiftiReader;

impl NiftiReader {
    /// Creates a new reader.
    pub fn new() -> Self {
        Self
    }
}

impl VolumeReader for NiftiReader {
    fn supports(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.to_ascii_lowercase().ends_with(".nii"))
    }

    fn read(&self, path: &Path) -> BundleResult<Volume> {
        let bytes = std::fs::read(path)?;
        let header = NiftiHeader::parse(&bytes, path)?;
        let shape = header.shape(path)?;
        let datatype = NiftiDataType::from_code(header.datatype).ok_or_else(|| {
            BundleError::nifti(path, format!("unsupported datatype {}", header.datatype))
        })?;

        let raw = &bytes[header.voxel_range(&shape, datatype, bytes.len(), path)?];
        let mut voxels = if header.little_endian {
            decode_with::<LittleEndian>(raw, datatype)
        } else {
            decode_with::<BigEndian>(raw, datatype)
        };

        let slope = header.scl_slope;
        let inter = header.scl_inter;
        if slope.is_finite() && slope != 0.0 && (slope != 1.0 || inter != 0.0) {
            voxels.iter_mut().for_each(|v| *v = *v * slope + inter);
        }

        let data = ArrayD::from_shape_vec(IxDyn(&shape).f(), voxels)?
            .as_standard_layout()
            .into_owned();

        let channel_dim = match shape.len() {
            0..=3 => ChannelDim::NoChannel,
            n => ChannelDim::Axis(n - 1),
        };
        let spatial_shape = shape.iter().take(3).copied().collect();
        debug!(path = %path.display(), ?shape, ?datatype, "read nifti volume");

        Ok(Volume::new(
            data,
            VolumeMeta::new(spatial_shape, channel_dim)
                .with_filename(path)
                .with_affine(header.affine()),
        ))
    }
}

/// Writes volumes as little-endian float32 single-file NIfTI-1 images.
#[derive(Debug, Clone, Copy, Default)]
pub struct NiftiWriter;

impl NiftiWriter {
    /// Creates a new writer.
    pub fn new() -> Self {
        Self
    }

    fn encode_header(shape: &[usize], affine: &[[f64; 4]; 4]) -> std::io::Result<Vec<u8>> {
        let mut cur = Cursor::new(vec![0u8; VOX_OFFSET]);
        cur.write_i32::<LittleEndian>(HEADER_SIZE)?;

        cur.set_position(40);
        cur.write_i16::<LittleEndian>(shape.len() as i16)?;
        for i in 0..7 {
            let d = shape.get(i).copied().unwrap_or(1);
            cur.write_i16::<LittleEndian>(d as i16)?;
        }

        cur.set_position(70);
        cur.write_i16::<LittleEndian>(NiftiDataType::F32.code())?;
        cur.write_i16::<LittleEndian>(32)?;

        cur.set_position(76);
        cur.write_f32::<LittleEndian>(1.0)?;
        for col in 0..3 {
            let norm = (0..3)
                .map(|r| affine[r][col] * affine[r][col])
                .sum::<f64>()
                .sqrt();
            cur.write_f32::<LittleEndian>(if norm > 0.0 { norm as f32 } else { 1.0 })?;
        }
        for _ in 4..8 {
            cur.write_f32::<LittleEndian>(1.0)?;
        }
        cur.write_f32::<LittleEndian>(VOX_OFFSET as f32)?;
        cur.write_f32::<LittleEndian>(1.0)?;
        cur.write_f32::<LittleEndian>(0.0)?;

        cur.set_position(123);
        cur.write_u8(UNITS_MM_SEC)?;

        cur.set_position(252);
        cur.write_i16::<LittleEndian>(0)?;
        cur.write_i16::<LittleEndian>(SFORM_ALIGNED)?;

        cur.set_position(280);
        for row in affine.iter().take(3) {
            for &v in row {
                cur.write_f32::<LittleEndian>(v as f32)?;
            }
        }

        cur.set_position(344);
        cur.write_all(MAGIC_SINGLE)?;
        Ok(cur.into_inner())
    }
}

impl VolumeWriter for NiftiWriter {
    fn extension(&self) -> &'static str {
        ".nii"
    }

    fn write(&self, volume: &Volume, path: &Path) -> BundleResult<()> {
        let shape = volume.data.shape();
        if shape.is_empty() || shape.len() > 7 {
            return Err(BundleError::nifti(
                path,
                format!("cannot store a {}-dimensional array", shape.len()),
            ));
        }
        if shape.iter().any(|&d| d > i16::MAX as usize) {
            return Err(BundleError::nifti(path, format!("shape {shape:?} is too large")));
        }

        let header = Self::encode_header(shape, &volume.meta.affine)?;
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&header)?;
        // Reversing the axes makes the first axis vary fastest.
        for &v in volume.data.t().iter() {
            out.write_f32::<LittleEndian>(v)?;
        }
        out.flush()?;
        debug!(path = %path.display(), ?shape, "wrote nifti volume");
        Ok(())
    }
}

/// Reads the NIfTI volume at `path`.
pub fn read_nifti(path: impl AsRef<Path>) -> BundleResult<Volume> {
    NiftiReader.read(path.as_ref())
}

/// Writes `volume` to `path` as NIfTI.
pub fn write_nifti(volume: &Volume, path: impl AsRef<Path>) -> BundleResult<()> {
    NiftiWriter.write(volume, path.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn ramp(shape: (usize, usize, usize)) -> Array3<f32> {
        Array3::from_shape_fn(shape, |(x, y, z)| (x * 100 + y * 10 + z) as f32)
    }

    #[test]
    fn write_then_read_preserves_voxel_order_and_affine() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ramp.nii");

        let mut affine = crate::domain::identity_affine();
        affine[0][0] = 2.0;
        affine[2][3] = -5.0;
        let volume = Volume::new(
            ramp((4, 3, 2)).into_dyn(),
            VolumeMeta::new(vec![4, 3, 2], ChannelDim::NoChannel).with_affine(affine),
        );
        write_nifti(&volume, &path)?;

        let read = read_nifti(&path)?;
        assert_eq!(read.data, volume.data);
        assert_eq!(read.meta.affine, affine);
        assert_eq!(read.meta.channel_dim, ChannelDim::NoChannel);
        assert_eq!(read.meta.filename.as_deref(), Some(path.as_path()));
        Ok(())
    }

    #[test]
    fn first_axis_varies_fastest_on_disk() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("order.nii");
        write_nifti(
            &Volume::new(
                ramp((2, 2, 1)).into_dyn(),
                VolumeMeta::new(vec![2, 2, 1], ChannelDim::NoChannel),
            ),
            &path,
        )?;

        let bytes = std::fs::read(&path)?;
        let voxels: Vec<f32> = bytes[VOX_OFFSET..]
            .chunks_exact(4)
            .map(LittleEndian::read_f32)
            .collect();
        assert_eq!(voxels, vec![0.0, 100.0, 10.0, 110.0]);
        Ok(())
    }

    #[test]
    fn four_dimensional_files_report_trailing_channel() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("multi.nii");
        let data = ndarray::Array4::<f32>::zeros((3, 3, 2, 2)).into_dyn();
        write_nifti(
            &Volume::new(data, VolumeMeta::new(vec![3, 3, 2], ChannelDim::NoChannel)),
            &path,
        )?;

        let read = read_nifti(&path)?;
        assert_eq!(read.meta.channel_dim, ChannelDim::Axis(3));
        assert_eq!(read.meta.spatial_shape, vec![3, 3, 2]);
        Ok(())
    }

    #[test]
    fn rejects_files_that_are_not_nifti() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("junk.nii");
        std::fs::write(&path, vec![7u8; 400])?;
        assert!(matches!(read_nifti(&path), Err(BundleError::Nifti { .. })));
        Ok(())
    }

    /// Writes a valid 2x2x2 image and lets `edit` corrupt its header bytes.
    fn corrupted(
        dir: &Path,
        edit: impl FnOnce(&mut [u8]),
    ) -> Result<std::path::PathBuf, BundleError> {
        let path = dir.join("corrupt.nii");
        write_nifti(
            &Volume::new(
                ramp((2, 2, 2)).into_dyn(),
                VolumeMeta::new(vec![2, 2, 2], ChannelDim::NoChannel),
            ),
            &path,
        )?;
        let mut bytes = std::fs::read(&path)?;
        edit(&mut bytes);
        std::fs::write(&path, bytes)?;
        Ok(path)
    }

    fn set_vox_offset(bytes: &mut [u8], value: f32) {
        LittleEndian::write_f32(&mut bytes[108..112], value);
    }

    #[test]
    fn overflowing_dimensions_are_rejected() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let path = corrupted(dir.path(), |bytes| {
            LittleEndian::write_i16(&mut bytes[40..42], 7);
            for i in 1..8 {
                LittleEndian::write_i16(&mut bytes[40 + 2 * i..42 + 2 * i], i16::MAX);
            }
        })?;
        assert!(matches!(read_nifti(&path), Err(BundleError::Nifti { .. })));
        Ok(())
    }

    #[test]
    fn dimensions_larger_than_file_are_rejected() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        let path = corrupted(dir.path(), |bytes| {
            LittleEndian::write_i16(&mut bytes[42..44], 1000);
        })?;
        let err = read_nifti(&path).unwrap_err();
        assert!(err.to_string().contains("bytes of voxel data"), "{err}");
        Ok(())
    }

    #[test]
    fn out_of_range_vox_offset_is_rejected() -> Result<(), BundleError> {
        let dir = tempfile::tempdir()?;
        for value in [1e30, f32::NAN, f32::INFINITY, -4.0, 100.0, 4096.0] {
            let path = corrupted(dir.path(), |bytes| set_vox_offset(bytes, value))?;
            assert!(
                matches!(read_nifti(&path), Err(BundleError::Nifti { .. })),
                "vox_offset {value} was accepted"
            );
        }
        Ok(())
    }

    #[test]
    fn missing_file_propagates_io_error() {
        let err = read_nifti("/no/such/volume.nii").unwrap_err();
        assert!(matches!(err, BundleError::Io(_)));
    }

    #[test]
    fn qform_without_rotation_scales_by_pixdim() {
        let header = NiftiHeader {
            dim: [3, 2, 2, 2, 1, 1, 1, 1],
            datatype: 16,
            pixdim: [1.0, 0.5, 0.5, 2.0, 1.0, 1.0, 1.0, 1.0],
            vox_offset: 352.0,
            scl_slope: 1.0,
            scl_inter: 0.0,
            qform_code: 1,
            sform_code: 0,
            quatern: [0.0, 0.0, 0.0],
            qoffset: [10.0, 20.0, 30.0],
            srow: [[0.0; 4]; 3],
            magic: *MAGIC_SINGLE,
            little_endian: true,
        };
        let affine = header.affine();
        assert_eq!(affine[0][0], 0.5);
        assert_eq!(affine[2][2], 2.0);
        assert_eq!(affine[1][3], 20.0);
    }

    #[test]
    fn reader_supports_only_uncompressed_files() {
        let reader = NiftiReader::new();
        assert!(reader.supports(Path::new("/data/IMAGE.NII")));
        assert!(!reader.supports(Path::new("/data/image.nii.gz")));
        assert!(!reader.supports(Path::new("/data/image.png")));
    }
}
