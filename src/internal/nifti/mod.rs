//! NIfTI object model: a fixed typed header record (one field per known
//! header entry), the voxel data type code table, and the `NiftiImage`
//! value the rest of the crate passes around.
//!
//! Header fields are held at the widest width the two standards use (`i64`
//! dims, `f64` reals) so a single record represents both NIfTI-1 and
//! NIfTI-2; the codec narrows on write. Voxel bytes are kept little-endian
//! in on-disk (column-major) order, which makes one time frame a contiguous
//! byte range and axis-3 concatenation a byte append.

pub mod codec;

use bincode::{Decode, Encode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::BidsError;

/// NIfTI standard revision an image was parsed from and will be written as.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Encode, Decode,
)]
pub enum NiftiVersion {
    #[default]
    Nifti1,
    Nifti2,
}

/// Voxel element types from the NIfTI datatype code table.
///
/// Each code fixes the element width (`bitpix`); the complex and RGB types
/// are carried for completeness so anatomical pass-through images survive a
/// round trip, but the streaming core never interprets their elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Uint8,
    Int16,
    Int32,
    Float32,
    Complex64,
    Float64,
    Rgb24,
    Int8,
    Uint16,
    Uint32,
    Int64,
    Uint64,
}

impl DataType {
    /// Decode a NIfTI datatype code.
    pub fn from_code(code: i16) -> Result<DataType, BidsError> {
        match code {
            2 => Ok(DataType::Uint8),
            4 => Ok(DataType::Int16),
            8 => Ok(DataType::Int32),
            16 => Ok(DataType::Float32),
            32 => Ok(DataType::Complex64),
            64 => Ok(DataType::Float64),
            128 => Ok(DataType::Rgb24),
            256 => Ok(DataType::Int8),
            512 => Ok(DataType::Uint16),
            768 => Ok(DataType::Uint32),
            1024 => Ok(DataType::Int64),
            1280 => Ok(DataType::Uint64),
            _ => Err(BidsError::InvalidNifti(format!(
                "unsupported datatype code: {code}"
            ))),
        }
    }

    /// The NIfTI datatype code.
    pub fn code(&self) -> i16 {
        match self {
            DataType::Uint8 => 2,
            DataType::Int16 => 4,
            DataType::Int32 => 8,
            DataType::Float32 => 16,
            DataType::Complex64 => 32,
            DataType::Float64 => 64,
            DataType::Rgb24 => 128,
            DataType::Int8 => 256,
            DataType::Uint16 => 512,
            DataType::Uint32 => 768,
            DataType::Int64 => 1024,
            DataType::Uint64 => 1280,
        }
    }

    /// Bits per voxel element, the header's `bitpix`.
    pub fn bitpix(&self) -> i16 {
        match self {
            DataType::Uint8 | DataType::Int8 => 8,
            DataType::Int16 | DataType::Uint16 => 16,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 32,
            DataType::Complex64
            | DataType::Float64
            | DataType::Int64
            | DataType::Uint64 => 64,
            DataType::Rgb24 => 24,
        }
    }

    /// Bytes per voxel element.
    pub fn size_bytes(&self) -> usize {
        self.bitpix() as usize / 8
    }

    /// Width of the scalar components inside one element, used when
    /// byte-swapping big-endian sources.
    pub fn component_bytes(&self) -> usize {
        match self {
            DataType::Complex64 => 4,
            DataType::Rgb24 => 1,
            _ => self.size_bytes(),
        }
    }
}

/// `f64` equality with NaN treated as equal to itself, the closeness rule
/// every header comparison uses (absolute tolerance zero).
pub(crate) fn f64_close(a: f64, b: f64) -> bool {
    (a.is_nan() && b.is_nan()) || a == b
}

fn f64_slice_close(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| f64_close(*x, *y))
}

/// Fixed typed record covering every header entry the core queries.
///
/// One struct represents both standards; `version` records which wire
/// layout the image came from. Text fields are stored as owned strings and
/// truncated to their fixed widths on write.
#[derive(Clone, Debug, Serialize, Deserialize, Encode, Decode)]
pub struct NiftiHeader {
    pub version: NiftiVersion,
    pub dim_info: u8,
    /// `dim[0]` is the axis count; `dim[1..=dim[0]]` are extents.
    pub dim: [i64; 8],
    pub intent_p1: f64,
    pub intent_p2: f64,
    pub intent_p3: f64,
    pub intent_code: i32,
    pub datatype: DataType,
    pub bitpix: i16,
    pub slice_start: i64,
    /// `pixdim[0]` is the qfac sign; `pixdim[4]` is the time step.
    pub pixdim: [f64; 8],
    pub scl_slope: f64,
    pub scl_inter: f64,
    pub slice_end: i64,
    pub slice_code: i32,
    pub xyzt_units: i32,
    pub cal_max: f64,
    pub cal_min: f64,
    pub slice_duration: f64,
    pub toffset: f64,
    pub descrip: String,
    pub aux_file: String,
    pub qform_code: i32,
    pub sform_code: i32,
    pub quatern_b: f64,
    pub quatern_c: f64,
    pub quatern_d: f64,
    pub qoffset_x: f64,
    pub qoffset_y: f64,
    pub qoffset_z: f64,
    pub srow_x: [f64; 4],
    pub srow_y: [f64; 4],
    pub srow_z: [f64; 4],
    pub intent_name: String,
}

impl NiftiHeader {
    /// A minimal valid header for the given shape and datatype; spatial
    /// steps default to unit millimeters with an identity orientation.
    pub fn for_shape(shape: &[i64], datatype: DataType) -> Result<NiftiHeader, BidsError> {
        let mut dim = [1i64; 8];
        if shape.is_empty() || shape.len() > 7 {
            return Err(BidsError::InvalidNifti(format!(
                "shape must have 1..=7 axes, got {}",
                shape.len()
            )));
        }
        dim[0] = shape.len() as i64;
        dim[1..=shape.len()].copy_from_slice(shape);

        let mut pixdim = [1.0f64; 8];
        pixdim[0] = 1.0;

        let header = NiftiHeader {
            version: NiftiVersion::Nifti1,
            dim_info: 0,
            dim,
            intent_p1: 0.0,
            intent_p2: 0.0,
            intent_p3: 0.0,
            intent_code: 0,
            datatype,
            bitpix: datatype.bitpix(),
            slice_start: 0,
            pixdim,
            scl_slope: 0.0,
            scl_inter: 0.0,
            slice_end: 0,
            slice_code: 0,
            // NIFTI_UNITS_MM | NIFTI_UNITS_SEC
            xyzt_units: 2 | 8,
            cal_max: 0.0,
            cal_min: 0.0,
            slice_duration: 0.0,
            toffset: 0.0,
            descrip: String::new(),
            aux_file: String::new(),
            qform_code: 0,
            sform_code: 1,
            quatern_b: 0.0,
            quatern_c: 0.0,
            quatern_d: 0.0,
            qoffset_x: 0.0,
            qoffset_y: 0.0,
            qoffset_z: 0.0,
            srow_x: [1.0, 0.0, 0.0, 0.0],
            srow_y: [0.0, 1.0, 0.0, 0.0],
            srow_z: [0.0, 0.0, 1.0, 0.0],
            intent_name: String::new(),
        };
        header.validate_dims()?;
        Ok(header)
    }

    /// Number of meaningful axes (`dim[0]`).
    pub fn ndim(&self) -> usize {
        self.dim[0] as usize
    }

    /// Extents of the meaningful axes.
    pub fn shape(&self) -> Vec<i64> {
        self.dim[1..=self.ndim()].to_vec()
    }

    /// Replace the shape, keeping trailing `dim` slots at 1.
    pub fn set_shape(&mut self, shape: &[i64]) -> Result<(), BidsError> {
        if shape.is_empty() || shape.len() > 7 {
            return Err(BidsError::InvalidNifti(format!(
                "shape must have 1..=7 axes, got {}",
                shape.len()
            )));
        }
        self.dim = [1i64; 8];
        self.dim[0] = shape.len() as i64;
        self.dim[1..=shape.len()].copy_from_slice(shape);
        self.validate_dims()
    }

    /// Enforce `dim[0]` coherence: axis count within 1..=7 and every
    /// meaningful extent at least 1.
    pub fn validate_dims(&self) -> Result<(), BidsError> {
        let ndim = self.dim[0];
        if !(1..=7).contains(&ndim) {
            return Err(BidsError::InvalidNifti(format!(
                "header dim[0] must be within 1..=7, got {ndim}"
            )));
        }
        for axis in 1..=ndim as usize {
            if self.dim[axis] < 1 {
                return Err(BidsError::InvalidNifti(format!(
                    "header dim[{axis}] must be >= 1, got {}",
                    self.dim[axis]
                )));
            }
        }
        Ok(())
    }

    /// Voxel count of one spatial volume (axes 1..=3, missing axes count 1).
    pub fn frame_voxels(&self) -> usize {
        let spatial = self.ndim().min(3);
        self.dim[1..=spatial].iter().product::<i64>() as usize
    }

    /// Number of frames along the time axis; 1 for 3-D images.
    pub fn num_frames(&self) -> usize {
        if self.ndim() >= 4 { self.dim[4] as usize } else { 1 }
    }

    /// Total voxel count across all meaningful axes.
    pub fn total_voxels(&self) -> usize {
        self.dim[1..=self.ndim()].iter().product::<i64>() as usize
    }

    /// The 4×4 voxel-to-world affine: sform when declared, else qform, else
    /// a pixdim-scaled identity.
    pub fn affine(&self) -> [[f64; 4]; 4] {
        if self.sform_code > 0 {
            return [
                self.srow_x,
                self.srow_y,
                self.srow_z,
                [0.0, 0.0, 0.0, 1.0],
            ];
        }
        if self.qform_code > 0 {
            return self.qform_affine();
        }
        [
            [self.pixdim[1], 0.0, 0.0, 0.0],
            [0.0, self.pixdim[2], 0.0, 0.0],
            [0.0, 0.0, self.pixdim[3], 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }

    fn qform_affine(&self) -> [[f64; 4]; 4] {
        let (b, c, d) = (self.quatern_b, self.quatern_c, self.quatern_d);
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let qfac = if self.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let (sx, sy, sz) = (self.pixdim[1], self.pixdim[2], qfac * self.pixdim[3]);

        [
            [
                (a * a + b * b - c * c - d * d) * sx,
                (2.0 * b * c - 2.0 * a * d) * sy,
                (2.0 * b * d + 2.0 * a * c) * sz,
                self.qoffset_x,
            ],
            [
                (2.0 * b * c + 2.0 * a * d) * sx,
                (a * a - b * b + c * c - d * d) * sy,
                (2.0 * c * d - 2.0 * a * b) * sz,
                self.qoffset_y,
            ],
            [
                (2.0 * b * d - 2.0 * a * c) * sx,
                (2.0 * c * d + 2.0 * a * b) * sy,
                (a * a - b * b - c * c + d * d) * sz,
                self.qoffset_z,
            ],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }

    /// Field-wise equality with NaN-equal semantics, covering every entry
    /// of the record. This is the equality incrementals use.
    pub fn same_fields(&self, other: &NiftiHeader) -> bool {
        self.version == other.version
            && self.dim_info == other.dim_info
            && self.dim == other.dim
            && f64_close(self.intent_p1, other.intent_p1)
            && f64_close(self.intent_p2, other.intent_p2)
            && f64_close(self.intent_p3, other.intent_p3)
            && self.intent_code == other.intent_code
            && self.datatype == other.datatype
            && self.bitpix == other.bitpix
            && self.slice_start == other.slice_start
            && f64_slice_close(&self.pixdim, &other.pixdim)
            && f64_close(self.scl_slope, other.scl_slope)
            && f64_close(self.scl_inter, other.scl_inter)
            && self.slice_end == other.slice_end
            && self.slice_code == other.slice_code
            && self.xyzt_units == other.xyzt_units
            && f64_close(self.cal_max, other.cal_max)
            && f64_close(self.cal_min, other.cal_min)
            && f64_close(self.slice_duration, other.slice_duration)
            && f64_close(self.toffset, other.toffset)
            && self.descrip == other.descrip
            && self.aux_file == other.aux_file
            && self.qform_code == other.qform_code
            && self.sform_code == other.sform_code
            && f64_close(self.quatern_b, other.quatern_b)
            && f64_close(self.quatern_c, other.quatern_c)
            && f64_close(self.quatern_d, other.quatern_d)
            && f64_close(self.qoffset_x, other.qoffset_x)
            && f64_close(self.qoffset_y, other.qoffset_y)
            && f64_close(self.qoffset_z, other.qoffset_z)
            && f64_slice_close(&self.srow_x, &other.srow_x)
            && f64_slice_close(&self.srow_y, &other.srow_y)
            && f64_slice_close(&self.srow_z, &other.srow_z)
            && self.intent_name == other.intent_name
    }
}

impl PartialEq for NiftiHeader {
    fn eq(&self, other: &Self) -> bool {
        self.same_fields(other)
    }
}

/// A parsed NIfTI image: the typed header plus raw little-endian voxel
/// bytes in on-disk order.
#[derive(Clone, Debug)]
pub struct NiftiImage {
    header: NiftiHeader,
    data: Bytes,
}

impl PartialEq for NiftiImage {
    fn eq(&self, other: &Self) -> bool {
        self.header.same_fields(&other.header) && self.data == other.data
    }
}

impl NiftiImage {
    /// Build an image from a header and voxel bytes, checking that the byte
    /// length matches the header's shape and datatype.
    pub fn new(header: NiftiHeader, data: Bytes) -> Result<NiftiImage, BidsError> {
        header.validate_dims()?;
        let expected = header.total_voxels() * header.datatype.size_bytes();
        if data.len() != expected {
            return Err(BidsError::InvalidNifti(format!(
                "voxel buffer holds {} bytes but header shape {:?} with datatype {:?} requires {}",
                data.len(),
                header.shape(),
                header.datatype,
                expected
            )));
        }
        Ok(NiftiImage { header, data })
    }

    pub fn header(&self) -> &NiftiHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut NiftiHeader {
        &mut self.header
    }

    /// Raw little-endian voxel bytes in on-disk order.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Extents of the meaningful axes.
    pub fn dims(&self) -> Vec<i64> {
        self.header.shape()
    }

    pub fn ndim(&self) -> usize {
        self.header.ndim()
    }

    /// Frames along the time axis; 1 for 3-D images.
    pub fn num_frames(&self) -> usize {
        self.header.num_frames()
    }

    /// Byte length of one time frame (one spatial volume).
    pub fn frame_len(&self) -> usize {
        self.header.frame_voxels() * self.header.datatype.size_bytes()
    }

    /// The voxel bytes of frame `index` (no copy; the buffer is shared).
    pub fn frame_bytes(&self, index: usize) -> Result<Bytes, BidsError> {
        if index >= self.num_frames() {
            return Err(BidsError::IndexOutOfBounds(format!(
                "frame {index} out of bounds for image with {} frame(s)",
                self.num_frames()
            )));
        }
        let len = self.frame_len();
        Ok(self.data.slice(index * len..(index + 1) * len))
    }

    /// A 4-D single-frame image holding frame `index` of this image, with
    /// the header otherwise unchanged.
    pub fn slice_frame(&self, index: usize) -> Result<NiftiImage, BidsError> {
        let bytes = self.frame_bytes(index)?;
        let mut header = self.header.clone();
        let spatial: Vec<i64> = {
            let shape = self.header.shape();
            shape[..shape.len().min(3)].to_vec()
        };
        let mut new_shape = spatial;
        while new_shape.len() < 3 {
            new_shape.push(1);
        }
        new_shape.push(1);
        header.set_shape(&new_shape)?;
        NiftiImage::new(header, bytes)
    }

    /// Remove singleton axes. The voxel bytes are untouched; only the
    /// header shape changes.
    pub fn squeezed(&self) -> Result<NiftiImage, BidsError> {
        let shape = self.header.shape();
        let mut squeezed: Vec<i64> = shape.iter().copied().filter(|&d| d != 1).collect();
        if squeezed.is_empty() {
            squeezed.push(1);
        }
        let mut header = self.header.clone();
        header.set_shape(&squeezed)?;
        NiftiImage::new(header, self.data.clone())
    }

    /// Append a trailing singleton axis to a 3-D image.
    pub fn promoted_to_4d(&self) -> Result<NiftiImage, BidsError> {
        let mut shape = self.header.shape();
        if shape.len() != 3 {
            return Err(BidsError::InvalidNifti(format!(
                "only a 3-D image can be promoted to 4-D, got {} axes",
                shape.len()
            )));
        }
        shape.push(1);
        let mut header = self.header.clone();
        header.set_shape(&shape)?;
        NiftiImage::new(header, self.data.clone())
    }

    /// Concatenate `other`'s frames after this image's frames along axis 3.
    /// Both images must already be 4-D; header fields other than `dim[4]`
    /// are taken from `self`.
    pub fn concat_frames(&self, other: &NiftiImage) -> Result<NiftiImage, BidsError> {
        if self.ndim() != 4 || other.ndim() != 4 {
            return Err(BidsError::Runtime(format!(
                "frame concatenation requires two 4-D images, got {}-D and {}-D",
                self.ndim(),
                other.ndim()
            )));
        }
        if self.frame_len() != other.frame_len() {
            return Err(BidsError::Runtime(format!(
                "frame byte lengths differ: {} vs {}",
                self.frame_len(),
                other.frame_len()
            )));
        }
        let mut merged = Vec::with_capacity(self.data.len() + other.data.len());
        merged.extend_from_slice(&self.data);
        merged.extend_from_slice(&other.data);

        let mut header = self.header.clone();
        let mut shape = header.shape();
        shape[3] += other.header.shape()[3];
        header.set_shape(&shape)?;
        NiftiImage::new(header, Bytes::from(merged))
    }
}
