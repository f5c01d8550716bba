//! Voxel grid extents (job descriptors).

use std::fmt;
use std::str::FromStr;

use crate::{ComputeError, ComputeResult};

/// Size in bytes of one voxel cell (`i32`).
pub const CELL_BYTES: u64 = 4;

/// Width, height and depth of a voxel grid.
///
/// A job is fully described by its extent. Every dimension is positive and
/// fits an `i32`, since the dimensions are passed to kernels as 32-bit
/// integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent {
    width: u32,
    height: u32,
    depth: u32,
}

impl Extent {
    /// Largest accepted value for a single dimension.
    pub const MAX_DIM: u32 = i32::MAX as u32;

    /// Create an extent, rejecting zero or oversized dimensions.
    pub fn new(width: u32, height: u32, depth: u32) -> ComputeResult<Self> {
        for (axis, value) in [("width", width), ("height", height), ("depth", depth)] {
            if value == 0 {
                return Err(ComputeError::InvalidExtent(format!("{axis} must be positive")));
            }
            if value > Self::MAX_DIM {
                return Err(ComputeError::InvalidExtent(format!(
                    "{axis} {value} exceeds {}",
                    Self::MAX_DIM
                )));
            }
        }

        let extent = Self { width, height, depth };
        extent.cells_usize()?;
        Ok(extent)
    }

    /// Cube extent `n x n x n`.
    pub fn cube(n: u32) -> ComputeResult<Self> {
        Self::new(n, n, n)
    }

    pub fn width(&self) -> u32 { self.width }
    pub fn height(&self) -> u32 { self.height }
    pub fn depth(&self) -> u32 { self.depth }

    /// Number of voxels.
    pub fn cells(&self) -> u64 {
        // `new` rejects extents whose byte size overflows.
        (self.width as u64) * (self.height as u64) * (self.depth as u64)
    }

    /// Number of voxels as a host-side length.
    pub fn cells_usize(&self) -> ComputeResult<usize> {
        (self.width as u64)
            .checked_mul(self.height as u64)
            .and_then(|wh| wh.checked_mul(self.depth as u64))
            .and_then(|n| n.checked_mul(CELL_BYTES).map(|_| n))
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| ComputeError::InvalidExtent(format!("{self} has too many cells")))
    }

    /// Buffer size in bytes needed to hold the grid.
    pub fn size_bytes(&self) -> u64 {
        self.cells() * CELL_BYTES
    }

    /// Global work size for a 3D dispatch, one work item per voxel.
    pub fn global_size(&self) -> [usize; 3] {
        [self.width as usize, self.height as usize, self.depth as usize]
    }

    /// Dimensions as kernel arguments, in binding order.
    pub fn as_kernel_args(&self) -> [i32; 3] {
        // MAX_DIM guarantees the casts are lossless.
        [self.width as i32, self.height as i32, self.depth as i32]
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.depth)
    }
}

impl FromStr for Extent {
    type Err = ComputeError;

    /// Parse `WxHxD`, or `N` for a cube.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_dim = |part: &str| {
            part.trim()
                .parse::<u32>()
                .map_err(|e| ComputeError::InvalidExtent(format!("'{s}': {e}")))
        };

        let parts: Vec<&str> = s.split(['x', 'X']).collect();
        match parts.as_slice() {
            [n] => Self::cube(parse_dim(n)?),
            [w, h, d] => Self::new(parse_dim(w)?, parse_dim(h)?, parse_dim(d)?),
            _ => Err(ComputeError::InvalidExtent(format!(
                "'{s}': expected WxHxD or a single size"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cells_and_bytes() {
        let e = Extent::new(4, 8, 2).unwrap();
        assert_eq!(e.cells(), 64);
        assert_eq!(e.size_bytes(), 256);
        assert_eq!(e.global_size(), [4, 8, 2]);
        assert_eq!(e.as_kernel_args(), [4, 8, 2]);
    }

    #[test]
    fn test_rejects_zero() {
        assert!(matches!(Extent::new(0, 1, 1), Err(ComputeError::InvalidExtent(_))));
        assert!(matches!(Extent::new(1, 1, 0), Err(ComputeError::InvalidExtent(_))));
    }

    #[test]
    fn test_rejects_oversized_dimension() {
        assert!(Extent::new(Extent::MAX_DIM + 1, 1, 1).is_err());
        assert!(Extent::new(Extent::MAX_DIM, 1, 1).is_ok());
    }

    #[test]
    fn test_rejects_cell_overflow() {
        let max = Extent::MAX_DIM;
        assert!(Extent::new(max, max, max).is_err());
    }

    #[test]
    fn test_parse() {
        assert_eq!("64".parse::<Extent>().unwrap(), Extent::cube(64).unwrap());
        assert_eq!("4x8x16".parse::<Extent>().unwrap(), Extent::new(4, 8, 16).unwrap());
        assert_eq!("2X3X4".parse::<Extent>().unwrap().to_string(), "2x3x4");
        assert!("4x8".parse::<Extent>().is_err());
        assert!("ax1x1".parse::<Extent>().is_err());
        assert!("0x1x1".parse::<Extent>().is_err());
    }
}
