//! NIfTI-1 image adapter
//!
//! Reads `.nii` / `.nii.gz` into [`Volume`] and writes volumes back as
//! float32, int16 or uint8 single-file NIfTI. The classification engine
//! never touches files; only the demo driver and callers use this module.

use std::io::{Cursor, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiHeader, NiftiObject};
use tracing::debug;

use crate::error::{AbcError, Result};
use crate::volume::{Geometry, Volume};

const HEADER_SIZE: usize = 348;
const VOX_OFFSET: usize = 352;

/// Voxel types that can be written to NIfTI
pub trait NiftiScalar: Copy {
    /// NIfTI datatype code
    const DATATYPE: i16;
    const BITPIX: i16;
    fn write_le(self, out: &mut Vec<u8>);
}

/// Stored as FLOAT32
impl NiftiScalar for f64 {
    const DATATYPE: i16 = 16;
    const BITPIX: i16 = 32;
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self as f32).to_le_bytes());
    }
}

impl NiftiScalar for i16 {
    const DATATYPE: i16 = 4;
    const BITPIX: i16 = 16;
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl NiftiScalar for u8 {
    const DATATYPE: i16 = 2;
    const BITPIX: i16 = 8;
    fn write_le(self, out: &mut Vec<u8>) {
        out.push(self);
    }
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Header fields worth printing when a file fails to parse
fn header_summary(bytes: &[u8]) -> String {
    if bytes.len() < HEADER_SIZE {
        return format!("file too small ({} bytes, need at least {})", bytes.len(), HEADER_SIZE);
    }
    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);
    format!("sizeof_hdr={}, magic='{}', datatype={}", sizeof_hdr, magic, datatype)
}

/// Voxel-to-world affine: sform if set, else a scaling by the voxel size
fn header_affine(header: &NiftiHeader) -> [f64; 16] {
    if header.sform_code > 0 {
        let (x, y, z) = (&header.srow_x, &header.srow_y, &header.srow_z);
        [
            x[0] as f64, x[1] as f64, x[2] as f64, x[3] as f64,
            y[0] as f64, y[1] as f64, y[2] as f64, y[3] as f64,
            z[0] as f64, z[1] as f64, z[2] as f64, z[3] as f64,
            0.0, 0.0, 0.0, 1.0,
        ]
    } else {
        Geometry::new(
            (1, 1, 1),
            (header.pixdim[1] as f64, header.pixdim[2] as f64, header.pixdim[3] as f64),
        )
        .affine
    }
}

/// Decode a NIfTI image (gzip auto-detected) into a 3D volume
///
/// 4D images keep their first volume. Intensity scaling from the header is
/// applied by the reader.
pub fn decode_volume(bytes: &[u8]) -> Result<Volume<f64>> {
    let obj: InMemNiftiObject = if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes))).map_err(|e| {
            let mut raw = Vec::new();
            let info = match std::io::Read::read_to_end(&mut GzDecoder::new(Cursor::new(bytes)), &mut raw) {
                Ok(_) => header_summary(&raw),
                Err(_) => "could not decompress".to_string(),
            };
            AbcError::Io(format!("failed to read gzipped NIfTI: {} ({})", e, info))
        })?
    } else {
        InMemNiftiObject::from_reader(Cursor::new(bytes))
            .map_err(|e| AbcError::Io(format!("failed to read NIfTI: {} ({})", e, header_summary(bytes))))?
    };

    let header = obj.header();
    if (header.dim[0] as usize) < 3 {
        return Err(AbcError::Io(format!("expected a 3D volume, got {}D", header.dim[0])));
    }
    let voxel_size = (header.pixdim[1] as f64, header.pixdim[2] as f64, header.pixdim[3] as f64);
    let affine = header_affine(header);

    let array: Array<f64, _> = obj
        .into_volume()
        .into_ndarray()
        .map_err(|e| AbcError::Io(format!("failed to convert NIfTI volume: {}", e)))?;
    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(AbcError::Io(format!("expected a 3D array, got {}D", shape.len())));
    }

    // Fortran order: x varies fastest
    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);
    let mut data = Vec::with_capacity(nx * ny * nz);
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                data.push(if shape.len() == 3 { array[[i, j, k]] } else { array[[i, j, k, 0]] });
            }
        }
    }
    debug!(dims = ?(nx, ny, nz), ?voxel_size, "decoded NIfTI volume");

    Volume::from_vec(data, Geometry { dims: (nx, ny, nz), voxel_size, affine })
}

/// Encode a volume as an uncompressed single-file NIfTI-1 image
pub fn encode_volume<T: NiftiScalar>(volume: &Volume<T>) -> Result<Vec<u8>> {
    let (nx, ny, nz) = volume.dims();
    if [nx, ny, nz].iter().any(|&d| d > i16::MAX as usize) {
        return Err(AbcError::Io(format!("dimensions {:?} exceed the NIfTI-1 limit", (nx, ny, nz))));
    }
    let (vsx, vsy, vsz) = volume.geometry.voxel_size;
    let affine = &volume.geometry.affine;

    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&(HEADER_SIZE as i32).to_le_bytes());

    let dim: [i16; 8] = [3, nx as i16, ny as i16, nz as i16, 1, 1, 1, 1];
    for (i, d) in dim.iter().enumerate() {
        header[40 + i * 2..42 + i * 2].copy_from_slice(&d.to_le_bytes());
    }
    header[70..72].copy_from_slice(&T::DATATYPE.to_le_bytes());
    header[72..74].copy_from_slice(&T::BITPIX.to_le_bytes());

    let pixdim: [f32; 8] = [1.0, vsx as f32, vsy as f32, vsz as f32, 1.0, 1.0, 1.0, 1.0];
    for (i, p) in pixdim.iter().enumerate() {
        header[76 + i * 4..80 + i * 4].copy_from_slice(&p.to_le_bytes());
    }
    header[108..112].copy_from_slice(&(VOX_OFFSET as f32).to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes()); // scl_slope
    header[254..256].copy_from_slice(&1i16.to_le_bytes()); // sform_code: scanner anat

    for row in 0..3 {
        for col in 0..4 {
            let offset = 280 + row * 16 + col * 4;
            header[offset..offset + 4].copy_from_slice(&(affine[row * 4 + col] as f32).to_le_bytes());
        }
    }
    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(VOX_OFFSET + volume.len() * (T::BITPIX as usize / 8));
    buffer.extend_from_slice(&header);
    buffer.extend_from_slice(&[0u8; 4]); // no extension
    for &v in &volume.data {
        v.write_le(&mut buffer);
    }
    Ok(buffer)
}

/// Encode and gzip a volume (.nii.gz)
pub fn encode_volume_gz<T: NiftiScalar>(volume: &Volume<T>) -> Result<Vec<u8>> {
    let raw = encode_volume(volume)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&raw)
        .map_err(|e| AbcError::Io(format!("gzip compression failed: {}", e)))?;
    encoder.finish().map_err(|e| AbcError::Io(format!("gzip finish failed: {}", e)))
}

/// Read a `.nii` or `.nii.gz` file
pub fn read_volume(path: &Path) -> Result<Volume<f64>> {
    let bytes = std::fs::read(path)
        .map_err(|e| AbcError::Io(format!("failed to read '{}': {}", path.display(), e)))?;
    decode_volume(&bytes)
}

/// Write a volume; paths ending in `.nii.gz` are compressed
pub fn write_volume<T: NiftiScalar>(path: &Path, volume: &Volume<T>) -> Result<()> {
    let bytes = if path.to_string_lossy().ends_with(".nii.gz") {
        encode_volume_gz(volume)?
    } else {
        encode_volume(volume)?
    };
    std::fs::write(path, &bytes).map_err(|e| AbcError::Io(format!("failed to write '{}': {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            dims: (4, 3, 2),
            voxel_size: (1.0, 2.0, 3.0),
            affine: [
                1.0, 0.1, 0.2, 10.0,
                0.3, 2.0, 0.4, 20.0,
                0.5, 0.6, 3.0, 30.0,
                0.0, 0.0, 0.0, 1.0,
            ],
        }
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("abc_core_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_gzip_detection() {
        assert!(is_gzip(&[0x1f, 0x8b, 0x00]));
        assert!(!is_gzip(&[0x00, 0x00, 0x00]));
        assert!(!is_gzip(&[0x1f]));
    }

    #[test]
    fn test_affine_without_sform() {
        let mut header = NiftiHeader::default();
        header.pixdim[1] = 1.0;
        header.pixdim[2] = 2.0;
        header.pixdim[3] = 3.0;
        header.sform_code = 0;
        let affine = header_affine(&header);
        assert_eq!((affine[0], affine[5], affine[10], affine[15]), (1.0, 2.0, 3.0, 1.0));
    }

    #[test]
    fn test_header_fields_per_datatype() {
        let labels = Volume::filled(geometry(), 3u8);
        let bytes = encode_volume(&labels).unwrap();
        assert_eq!(bytes.len(), VOX_OFFSET + 24);
        assert_eq!(i16::from_le_bytes([bytes[70], bytes[71]]), 2);
        assert_eq!(i16::from_le_bytes([bytes[72], bytes[73]]), 8);
        assert_eq!(&bytes[344..348], b"n+1\0");

        let posteriors = Volume::filled(geometry(), -7i16);
        let bytes = encode_volume(&posteriors).unwrap();
        assert_eq!(bytes.len(), VOX_OFFSET + 48);
        assert_eq!(i16::from_le_bytes([bytes[70], bytes[71]]), 4);
        assert_eq!(i16::from_le_bytes([bytes[VOX_OFFSET], bytes[VOX_OFFSET + 1]]), -7);
    }

    #[test]
    fn test_float_volume_through_file() {
        let g = geometry();
        let data: Vec<f64> = (0..g.len()).map(|i| i as f64 * 0.5 + 1.0).collect();
        let volume = Volume::from_vec(data, g.clone()).unwrap();
        let path = temp_path("float.nii");

        write_volume(&path, &volume).unwrap();
        let loaded = read_volume(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.dims(), g.dims);
        assert!(loaded.geometry.matches(&g));
        for (a, b) in loaded.data.iter().zip(&volume.data) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_compressed_labels_through_file() {
        let g = geometry();
        let labels = Volume::from_vec((0..g.len()).map(|i| (i % 4) as u8).collect(), g).unwrap();
        let path = temp_path("labels.nii.gz");

        write_volume(&path, &labels).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert!(is_gzip(&bytes));

        let loaded = decode_volume(&bytes).unwrap();
        let expected: Vec<f64> = labels.data.iter().map(|&l| l as f64).collect();
        assert_eq!(loaded.data, expected);
    }

    #[test]
    fn test_invalid_input_is_io_error() {
        assert!(matches!(decode_volume(&[0u8; 10]), Err(AbcError::Io(_))));
        assert!(matches!(decode_volume(&[0x1f, 0x8b, 0x00, 0x00, 0x00]), Err(AbcError::Io(_))));
        let err = read_volume(Path::new("/nonexistent/abc_core_missing.nii")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
        assert!(header_summary(&[0u8; 10]).contains("too small"));
    }
}
