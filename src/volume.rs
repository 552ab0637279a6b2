//! Dense 3D volumes with voxel-grid geometry
//!
//! Voxel data is stored flat in Fortran (column-major) order to match the
//! NIfTI convention: index = x + y*nx + z*nx*ny.

use crate::error::{AbcError, Result};

/// Relative tolerance used when comparing spacing and affine entries
const GEOMETRY_TOLERANCE: f64 = 1e-4;

/// Voxel grid of a volume: dimensions, voxel size and voxel-to-world affine
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    /// Dimensions (nx, ny, nz)
    pub dims: (usize, usize, usize),
    /// Voxel sizes in mm
    pub voxel_size: (f64, f64, f64),
    /// Affine transformation matrix (4x4, row-major)
    pub affine: [f64; 16],
}

impl Geometry {
    /// Axis-aligned geometry with the given voxel size and zero origin
    pub fn new(dims: (usize, usize, usize), voxel_size: (f64, f64, f64)) -> Self {
        let (vx, vy, vz) = voxel_size;
        Self {
            dims,
            voxel_size,
            affine: [
                vx, 0.0, 0.0, 0.0,
                0.0, vy, 0.0, 0.0,
                0.0, 0.0, vz, 0.0,
                0.0, 0.0, 0.0, 1.0,
            ],
        }
    }

    pub fn len(&self) -> usize {
        self.dims.0 * self.dims.1 * self.dims.2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// World coordinates of voxel (0, 0, 0)
    pub fn origin(&self) -> (f64, f64, f64) {
        (self.affine[3], self.affine[7], self.affine[11])
    }

    /// Voxel (i, j, k) of a linear index
    #[inline]
    pub fn coords(&self, index: usize) -> (usize, usize, usize) {
        let (nx, ny, _) = self.dims;
        (index % nx, (index / nx) % ny, index / (nx * ny))
    }

    /// Same dims exactly, same spacing and affine within tolerance
    pub fn matches(&self, other: &Geometry) -> bool {
        if self.dims != other.dims {
            return false;
        }
        let close = |a: f64, b: f64| (a - b).abs() <= GEOMETRY_TOLERANCE * a.abs().max(b.abs()).max(1.0);
        let (a, b) = (self.voxel_size, other.voxel_size);
        close(a.0, b.0)
            && close(a.1, b.1)
            && close(a.2, b.2)
            && self.affine.iter().zip(other.affine.iter()).all(|(&x, &y)| close(x, y))
    }

    /// Fail with a configuration error naming `what` if the grids differ
    pub fn ensure_matches(&self, other: &Geometry, what: &str) -> Result<()> {
        if self.matches(other) {
            Ok(())
        } else {
            Err(AbcError::config(format!(
                "{} geometry {:?} / {:?} does not match reference {:?} / {:?}",
                what, other.dims, other.voxel_size, self.dims, self.voxel_size
            )))
        }
    }
}

/// A dense 3D volume
#[derive(Debug, Clone, PartialEq)]
pub struct Volume<T = f64> {
    /// Voxel values, Fortran order
    pub data: Vec<T>,
    pub geometry: Geometry,
}

/// Binary foreground mask, non-zero voxels are inside
pub type Mask = Volume<u8>;

impl<T: Clone> Volume<T> {
    /// Volume filled with a constant value
    pub fn filled(geometry: Geometry, value: T) -> Self {
        Self { data: vec![value; geometry.len()], geometry }
    }
}

impl<T> Volume<T> {
    /// Wrap voxel data, checking its length against the geometry
    pub fn from_vec(data: Vec<T>, geometry: Geometry) -> Result<Self> {
        if data.len() != geometry.len() {
            return Err(AbcError::config(format!(
                "volume has {} voxels, geometry {:?} needs {}",
                data.len(),
                geometry.dims,
                geometry.len()
            )));
        }
        Ok(Self { data, geometry })
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.geometry.dims
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Apply `f` to every voxel, keeping the geometry
    pub fn map<U, F: FnMut(&T) -> U>(&self, f: F) -> Volume<U> {
        Volume { data: self.data.iter().map(f).collect(), geometry: self.geometry.clone() }
    }
}

impl Mask {
    /// Mask of voxels whose value exceeds `threshold`
    pub fn from_threshold(volume: &Volume<f64>, threshold: f64) -> Mask {
        volume.map(|&v| if v > threshold { 1 } else { 0 })
    }

    /// Number of foreground voxels
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&m| m != 0).count()
    }

    /// Linear indices of foreground voxels, ascending
    pub fn foreground_indices(&self) -> Vec<usize> {
        self.data.iter()
            .enumerate()
            .filter(|(_, &m)| m != 0)
            .map(|(i, _)| i)
            .collect()
    }
}
