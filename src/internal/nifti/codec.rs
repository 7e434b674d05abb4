//! NIfTI-1/2 byte-stream codec.
//!
//! Readers accept single-file `.nii` streams in either standard and either
//! endianness, plus gzip-compressed `.nii.gz`. Writers emit the stream
//! little-endian in the revision recorded in the header. Voxel bytes are
//! normalized to little-endian on read so the in-memory form is canonical.

use std::{fs, io::Read, path::Path};

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::Bytes;
use flate2::read::GzDecoder;
use tracing::debug;

use crate::{
    errors::BidsError,
    internal::nifti::{DataType, NiftiHeader, NiftiImage, NiftiVersion},
};

const NIFTI1_HEADER_LEN: usize = 348;
const NIFTI2_HEADER_LEN: usize = 540;
const NIFTI1_VOX_OFFSET: usize = 352;
const NIFTI2_VOX_OFFSET: usize = 544;

const NIFTI1_MAGIC: &[u8; 4] = b"n+1\0";
const NIFTI2_MAGIC: &[u8; 8] = b"n+2\0\r\n\x1a\n";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Read and parse an image file, inflating `.nii.gz` transparently.
pub fn read_image(path: &Path) -> Result<NiftiImage, BidsError> {
    let bytes = fs::read(path)?;
    parse(&bytes).map_err(|e| match e {
        BidsError::InvalidNifti(msg) => {
            BidsError::InvalidNifti(format!("{}: {msg}", path.display()))
        }
        other => other,
    })
}

/// Parse a NIfTI-1/2 stream, gzip-compressed or raw.
pub fn parse(bytes: &[u8]) -> Result<NiftiImage, BidsError> {
    if bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC {
        let mut inflated = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut inflated)?;
        return parse_raw(&inflated);
    }
    parse_raw(bytes)
}

fn parse_raw(bytes: &[u8]) -> Result<NiftiImage, BidsError> {
    if bytes.len() < 4 {
        return Err(BidsError::InvalidNifti(
            "stream shorter than the sizeof_hdr field".to_string(),
        ));
    }
    match LittleEndian::read_i32(&bytes[0..4]) {
        348 => return assemble(parse_v1::<LittleEndian>(bytes)?, bytes, false),
        540 => return assemble(parse_v2::<LittleEndian>(bytes)?, bytes, false),
        _ => {}
    }
    match BigEndian::read_i32(&bytes[0..4]) {
        348 => assemble(parse_v1::<BigEndian>(bytes)?, bytes, true),
        540 => assemble(parse_v2::<BigEndian>(bytes)?, bytes, true),
        _ => Err(BidsError::InvalidNifti(
            "sizeof_hdr matches neither NIfTI-1 (348) nor NIfTI-2 (540)".to_string(),
        )),
    }
}

fn assemble(
    parsed: (NiftiHeader, usize),
    bytes: &[u8],
    big_endian: bool,
) -> Result<NiftiImage, BidsError> {
    let (header, vox_offset) = parsed;
    header.validate_dims()?;

    let data_len = header.total_voxels() * header.datatype.size_bytes();
    let end = vox_offset
        .checked_add(data_len)
        .ok_or_else(|| BidsError::InvalidNifti("voxel extent overflows".to_string()))?;
    if bytes.len() < end {
        return Err(BidsError::InvalidNifti(format!(
            "stream holds {} bytes but header promises voxels up to byte {end}",
            bytes.len()
        )));
    }

    let mut data = bytes[vox_offset..end].to_vec();
    if big_endian {
        debug!(
            "normalizing big-endian voxel data ({} bytes) to little-endian",
            data.len()
        );
        swap_to_little_endian(&mut data, header.datatype);
    }
    NiftiImage::new(header, Bytes::from(data))
}

fn swap_to_little_endian(data: &mut [u8], datatype: DataType) {
    let width = datatype.component_bytes();
    if width > 1 {
        for component in data.chunks_exact_mut(width) {
            component.reverse();
        }
    }
}

fn fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn parse_v1<E: ByteOrder>(bytes: &[u8]) -> Result<(NiftiHeader, usize), BidsError> {
    if bytes.len() < NIFTI1_HEADER_LEN {
        return Err(BidsError::InvalidNifti(
            "truncated NIfTI-1 header".to_string(),
        ));
    }
    if &bytes[344..348] != NIFTI1_MAGIC {
        return Err(BidsError::InvalidNifti(
            "NIfTI-1 magic is not `n+1` (two-file images are unsupported)".to_string(),
        ));
    }

    let mut dim = [0i64; 8];
    for (axis, slot) in dim.iter_mut().enumerate() {
        *slot = E::read_i16(&bytes[40 + axis * 2..]) as i64;
    }
    let mut pixdim = [0f64; 8];
    for (axis, slot) in pixdim.iter_mut().enumerate() {
        *slot = E::read_f32(&bytes[76 + axis * 4..]) as f64;
    }
    let read_row = |offset: usize| -> [f64; 4] {
        [
            E::read_f32(&bytes[offset..]) as f64,
            E::read_f32(&bytes[offset + 4..]) as f64,
            E::read_f32(&bytes[offset + 8..]) as f64,
            E::read_f32(&bytes[offset + 12..]) as f64,
        ]
    };

    let datatype = DataType::from_code(E::read_i16(&bytes[70..]))?;
    let vox_offset = E::read_f32(&bytes[108..]) as usize;
    let vox_offset = vox_offset.max(NIFTI1_VOX_OFFSET);

    let header = NiftiHeader {
        version: NiftiVersion::Nifti1,
        dim_info: bytes[39],
        dim,
        intent_p1: E::read_f32(&bytes[56..]) as f64,
        intent_p2: E::read_f32(&bytes[60..]) as f64,
        intent_p3: E::read_f32(&bytes[64..]) as f64,
        intent_code: E::read_i16(&bytes[68..]) as i32,
        datatype,
        bitpix: E::read_i16(&bytes[72..]),
        slice_start: E::read_i16(&bytes[74..]) as i64,
        pixdim,
        scl_slope: E::read_f32(&bytes[112..]) as f64,
        scl_inter: E::read_f32(&bytes[116..]) as f64,
        slice_end: E::read_i16(&bytes[120..]) as i64,
        slice_code: bytes[122] as i32,
        xyzt_units: bytes[123] as i32,
        cal_max: E::read_f32(&bytes[124..]) as f64,
        cal_min: E::read_f32(&bytes[128..]) as f64,
        slice_duration: E::read_f32(&bytes[132..]) as f64,
        toffset: E::read_f32(&bytes[136..]) as f64,
        descrip: fixed_str(&bytes[148..228]),
        aux_file: fixed_str(&bytes[228..252]),
        qform_code: E::read_i16(&bytes[252..]) as i32,
        sform_code: E::read_i16(&bytes[254..]) as i32,
        quatern_b: E::read_f32(&bytes[256..]) as f64,
        quatern_c: E::read_f32(&bytes[260..]) as f64,
        quatern_d: E::read_f32(&bytes[264..]) as f64,
        qoffset_x: E::read_f32(&bytes[268..]) as f64,
        qoffset_y: E::read_f32(&bytes[272..]) as f64,
        qoffset_z: E::read_f32(&bytes[276..]) as f64,
        srow_x: read_row(280),
        srow_y: read_row(296),
        srow_z: read_row(312),
        intent_name: fixed_str(&bytes[328..344]),
    };
    Ok((header, vox_offset))
}

fn parse_v2<E: ByteOrder>(bytes: &[u8]) -> Result<(NiftiHeader, usize), BidsError> {
    if bytes.len() < NIFTI2_HEADER_LEN {
        return Err(BidsError::InvalidNifti(
            "truncated NIfTI-2 header".to_string(),
        ));
    }
    if &bytes[4..12] != NIFTI2_MAGIC {
        return Err(BidsError::InvalidNifti(
            "NIfTI-2 magic bytes are malformed".to_string(),
        ));
    }

    let mut dim = [0i64; 8];
    for (axis, slot) in dim.iter_mut().enumerate() {
        *slot = E::read_i64(&bytes[16 + axis * 8..]);
    }
    let mut pixdim = [0f64; 8];
    for (axis, slot) in pixdim.iter_mut().enumerate() {
        *slot = E::read_f64(&bytes[104 + axis * 8..]);
    }
    let read_row = |offset: usize| -> [f64; 4] {
        [
            E::read_f64(&bytes[offset..]),
            E::read_f64(&bytes[offset + 8..]),
            E::read_f64(&bytes[offset + 16..]),
            E::read_f64(&bytes[offset + 24..]),
        ]
    };

    let datatype = DataType::from_code(E::read_i16(&bytes[12..]))?;
    let vox_offset = E::read_i64(&bytes[168..]);
    if vox_offset < NIFTI2_HEADER_LEN as i64 {
        return Err(BidsError::InvalidNifti(format!(
            "NIfTI-2 vox_offset {vox_offset} points inside the header"
        )));
    }

    let header = NiftiHeader {
        version: NiftiVersion::Nifti2,
        dim_info: bytes[524],
        dim,
        intent_p1: E::read_f64(&bytes[80..]),
        intent_p2: E::read_f64(&bytes[88..]),
        intent_p3: E::read_f64(&bytes[96..]),
        intent_code: E::read_i32(&bytes[504..]),
        datatype,
        bitpix: E::read_i16(&bytes[14..]),
        slice_start: E::read_i64(&bytes[224..]),
        pixdim,
        scl_slope: E::read_f64(&bytes[176..]),
        scl_inter: E::read_f64(&bytes[184..]),
        slice_end: E::read_i64(&bytes[232..]),
        slice_code: E::read_i32(&bytes[496..]),
        xyzt_units: E::read_i32(&bytes[500..]),
        cal_max: E::read_f64(&bytes[192..]),
        cal_min: E::read_f64(&bytes[200..]),
        slice_duration: E::read_f64(&bytes[208..]),
        toffset: E::read_f64(&bytes[216..]),
        descrip: fixed_str(&bytes[240..320]),
        aux_file: fixed_str(&bytes[320..344]),
        qform_code: E::read_i32(&bytes[344..]),
        sform_code: E::read_i32(&bytes[348..]),
        quatern_b: E::read_f64(&bytes[352..]),
        quatern_c: E::read_f64(&bytes[360..]),
        quatern_d: E::read_f64(&bytes[368..]),
        qoffset_x: E::read_f64(&bytes[376..]),
        qoffset_y: E::read_f64(&bytes[384..]),
        qoffset_z: E::read_f64(&bytes[392..]),
        srow_x: read_row(400),
        srow_y: read_row(432),
        srow_z: read_row(464),
        intent_name: fixed_str(&bytes[508..524]),
    };
    Ok((header, vox_offset as usize))
}

/// Serialize an image to an uncompressed little-endian single-file stream
/// in the revision recorded in its header.
pub fn serialize(image: &NiftiImage) -> Result<Vec<u8>, BidsError> {
    match image.header().version {
        NiftiVersion::Nifti1 => serialize_v1(image),
        NiftiVersion::Nifti2 => serialize_v2(image),
    }
}

fn put_i16(buf: &mut Vec<u8>, v: i16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_f32(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&(v as f32).to_le_bytes());
}

fn put_f64(buf: &mut Vec<u8>, v: f64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_fixed_str(buf: &mut Vec<u8>, s: &str, width: usize) {
    let mut field = vec![0u8; width];
    let bytes = s.as_bytes();
    let len = bytes.len().min(width);
    field[..len].copy_from_slice(&bytes[..len]);
    buf.extend_from_slice(&field);
}

fn narrow_i16(value: i64, what: &str) -> Result<i16, BidsError> {
    i16::try_from(value).map_err(|_| {
        BidsError::InvalidNifti(format!(
            "{what} value {value} does not fit the NIfTI-1 16-bit field"
        ))
    })
}

fn serialize_v1(image: &NiftiImage) -> Result<Vec<u8>, BidsError> {
    let header = image.header();
    let mut buf = Vec::with_capacity(NIFTI1_VOX_OFFSET + image.data().len());

    put_i32(&mut buf, NIFTI1_HEADER_LEN as i32); // sizeof_hdr
    buf.extend_from_slice(&[0u8; 35]); // data_type, db_name, extents, session_error, regular
    buf.push(header.dim_info);
    for axis in 0..8 {
        put_i16(&mut buf, narrow_i16(header.dim[axis], "dim")?);
    }
    put_f32(&mut buf, header.intent_p1);
    put_f32(&mut buf, header.intent_p2);
    put_f32(&mut buf, header.intent_p3);
    put_i16(&mut buf, header.intent_code as i16);
    put_i16(&mut buf, header.datatype.code());
    put_i16(&mut buf, header.bitpix);
    put_i16(&mut buf, narrow_i16(header.slice_start, "slice_start")?);
    for axis in 0..8 {
        put_f32(&mut buf, header.pixdim[axis]);
    }
    put_f32(&mut buf, NIFTI1_VOX_OFFSET as f64);
    put_f32(&mut buf, header.scl_slope);
    put_f32(&mut buf, header.scl_inter);
    put_i16(&mut buf, narrow_i16(header.slice_end, "slice_end")?);
    buf.push(header.slice_code as u8);
    buf.push(header.xyzt_units as u8);
    put_f32(&mut buf, header.cal_max);
    put_f32(&mut buf, header.cal_min);
    put_f32(&mut buf, header.slice_duration);
    put_f32(&mut buf, header.toffset);
    put_i32(&mut buf, 0); // glmax
    put_i32(&mut buf, 0); // glmin
    put_fixed_str(&mut buf, &header.descrip, 80);
    put_fixed_str(&mut buf, &header.aux_file, 24);
    put_i16(&mut buf, header.qform_code as i16);
    put_i16(&mut buf, header.sform_code as i16);
    put_f32(&mut buf, header.quatern_b);
    put_f32(&mut buf, header.quatern_c);
    put_f32(&mut buf, header.quatern_d);
    put_f32(&mut buf, header.qoffset_x);
    put_f32(&mut buf, header.qoffset_y);
    put_f32(&mut buf, header.qoffset_z);
    for row in [&header.srow_x, &header.srow_y, &header.srow_z] {
        for &v in row {
            put_f32(&mut buf, v);
        }
    }
    put_fixed_str(&mut buf, &header.intent_name, 16);
    buf.extend_from_slice(NIFTI1_MAGIC);
    debug_assert_eq!(buf.len(), NIFTI1_HEADER_LEN);

    buf.extend_from_slice(&[0u8; 4]); // no extensions
    buf.extend_from_slice(image.data());
    Ok(buf)
}

fn serialize_v2(image: &NiftiImage) -> Result<Vec<u8>, BidsError> {
    let header = image.header();
    let mut buf = Vec::with_capacity(NIFTI2_VOX_OFFSET + image.data().len());

    put_i32(&mut buf, NIFTI2_HEADER_LEN as i32);
    buf.extend_from_slice(NIFTI2_MAGIC);
    put_i16(&mut buf, header.datatype.code());
    put_i16(&mut buf, header.bitpix);
    for axis in 0..8 {
        put_i64(&mut buf, header.dim[axis]);
    }
    put_f64(&mut buf, header.intent_p1);
    put_f64(&mut buf, header.intent_p2);
    put_f64(&mut buf, header.intent_p3);
    for axis in 0..8 {
        put_f64(&mut buf, header.pixdim[axis]);
    }
    put_i64(&mut buf, NIFTI2_VOX_OFFSET as i64);
    put_f64(&mut buf, header.scl_slope);
    put_f64(&mut buf, header.scl_inter);
    put_f64(&mut buf, header.cal_max);
    put_f64(&mut buf, header.cal_min);
    put_f64(&mut buf, header.slice_duration);
    put_f64(&mut buf, header.toffset);
    put_i64(&mut buf, header.slice_start);
    put_i64(&mut buf, header.slice_end);
    put_fixed_str(&mut buf, &header.descrip, 80);
    put_fixed_str(&mut buf, &header.aux_file, 24);
    put_i32(&mut buf, header.qform_code);
    put_i32(&mut buf, header.sform_code);
    put_f64(&mut buf, header.quatern_b);
    put_f64(&mut buf, header.quatern_c);
    put_f64(&mut buf, header.quatern_d);
    put_f64(&mut buf, header.qoffset_x);
    put_f64(&mut buf, header.qoffset_y);
    put_f64(&mut buf, header.qoffset_z);
    for row in [&header.srow_x, &header.srow_y, &header.srow_z] {
        for &v in row {
            put_f64(&mut buf, v);
        }
    }
    put_i32(&mut buf, header.slice_code);
    put_i32(&mut buf, header.xyzt_units);
    put_i32(&mut buf, header.intent_code);
    put_fixed_str(&mut buf, &header.intent_name, 16);
    buf.push(header.dim_info);
    buf.extend_from_slice(&[0u8; 15]);
    debug_assert_eq!(buf.len(), NIFTI2_HEADER_LEN);

    buf.extend_from_slice(&[0u8; 4]); // no extensions
    buf.extend_from_slice(image.data());
    Ok(buf)
}
