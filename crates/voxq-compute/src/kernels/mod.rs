//! Kernel sources for the voxel increment program.
//!
//! Every source exposes a single entry point, [`ENTRY_POINT`], taking
//! `(buffer, width, height, depth)`. Programs are treated as opaque text:
//! the compute resource only checks that they build, that the entry point
//! resolves and that the arguments bind.

use std::fs;
use std::path::Path;

use crate::backend::Backend;
use crate::{ComputeError, ComputeResult, ResourceStage};

/// Name of the kernel entry point every program must export.
pub const ENTRY_POINT: &str = "increment_voxels";

/// WGSL rendition for the wgpu backend.
///
/// wgpu binds resources rather than positional scalars, so the three
/// dimensions live in a uniform at binding 1. The workgroup size must match
/// `WgpuConfig::workgroup_size`. The cell index is a `u32`; buffers are
/// capped at the storage binding size, which keeps it in range.
pub const INCREMENT_VOXELS_WGSL: &str = r#"
struct Dims {
    width: i32,
    height: i32,
    depth: i32,
    _pad: i32,
}

@group(0) @binding(0) var<storage, read_write> voxels: array<i32>;
@group(0) @binding(1) var<uniform> dims: Dims;

@compute @workgroup_size(4, 4, 4)
fn increment_voxels(@builtin(global_invocation_id) id: vec3<u32>) {
    let w = u32(dims.width);
    let h = u32(dims.height);
    let d = u32(dims.depth);
    if id.x >= w || id.y >= h || id.z >= d { return; }

    let index = id.x + id.y * w + id.z * w * h;
    voxels[index] = voxels[index] + 1;
}
"#;

/// CUDA C rendition, compiled at runtime via NVRTC.
///
/// Coordinates and the cell index are 64-bit so grids past 2^31 cells stay
/// addressable.
///
/// Also accepted by the host backend, which resolves the entry point to its
/// native implementation.
pub const INCREMENT_VOXELS_CUDA: &str = r#"
extern "C" __global__ void increment_voxels(int* voxels, int width, int height, int depth) {
    unsigned long long x = (unsigned long long)blockIdx.x * blockDim.x + threadIdx.x;
    unsigned long long y = (unsigned long long)blockIdx.y * blockDim.y + threadIdx.y;
    unsigned long long z = (unsigned long long)blockIdx.z * blockDim.z + threadIdx.z;
    unsigned long long w = width, h = height, d = depth;
    if (x >= w || y >= h || z >= d) return;

    unsigned long long index = x + y * w + z * w * h;
    voxels[index] += 1;
}
"#;

/// Program text plus a label used in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    label: String,
    text: String,
}

impl KernelSource {
    /// Wrap in-memory program text.
    pub fn from_text(label: impl Into<String>, text: impl Into<String>) -> Self {
        Self { label: label.into(), text: text.into() }
    }

    /// Load program text from a file.
    ///
    /// A missing or unreadable file is a program creation failure, reported
    /// the same way as a build error.
    pub fn from_file(path: impl AsRef<Path>) -> ComputeResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            ComputeError::resource(
                ResourceStage::Program,
                "host",
                format!("failed to read kernel source {}: {e}", path.display()),
            )
        })?;
        Ok(Self::from_text(path.display().to_string(), text))
    }

    /// Built-in increment program for a backend.
    pub fn builtin(backend: Backend) -> Self {
        match backend {
            Backend::Wgpu => Self::from_text("increment_voxels.wgsl", INCREMENT_VOXELS_WGSL),
            Backend::Cuda | Backend::Host | Backend::Auto => {
                Self::from_text("increment_voxels.cu", INCREMENT_VOXELS_CUDA)
            }
        }
    }

    pub fn label(&self) -> &str { &self.label }
    pub fn text(&self) -> &str { &self.text }

    /// Whether `name` appears as a called/declared identifier (`name(`).
    pub fn declares(&self, name: &str) -> bool {
        let bytes = self.text.as_bytes();
        self.text.match_indices(name).any(|(start, _)| {
            let before_ok = start == 0 || !is_ident_byte(bytes[start - 1]);
            let rest = &self.text[start + name.len()..];
            before_ok && rest.trim_start().starts_with('(')
        })
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtins_declare_entry_point() {
        for backend in [Backend::Host, Backend::Wgpu, Backend::Cuda] {
            let src = KernelSource::builtin(backend);
            assert!(src.declares(ENTRY_POINT), "{} missing entry", src.label());
        }
    }

    #[test]
    fn test_builtin_index_is_unsigned() {
        // 32-bit signed index arithmetic wraps for grids past 2^31 cells.
        assert!(INCREMENT_VOXELS_CUDA.contains("unsigned long long index = x + y * w + z * w * h;"));
        assert!(!INCREMENT_VOXELS_CUDA.contains("int index"));
        assert!(INCREMENT_VOXELS_WGSL.contains("let index = id.x + id.y * w + id.z * w * h;"));
        assert!(!INCREMENT_VOXELS_WGSL.contains("i32(id."));
    }

    #[test]
    fn test_declares_requires_identifier_boundary() {
        let src = KernelSource::from_text("t", "void my_increment_voxels(int a) {}");
        assert!(!src.declares(ENTRY_POINT));
        let src = KernelSource::from_text("t", "void increment_voxels_v2 (int a) {}");
        assert!(!src.declares(ENTRY_POINT));
        let src = KernelSource::from_text("t", "void increment_voxels (int a) {}");
        assert!(src.declares(ENTRY_POINT));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(INCREMENT_VOXELS_CUDA.as_bytes()).unwrap();

        let src = KernelSource::from_file(file.path()).unwrap();
        assert_eq!(src.text(), INCREMENT_VOXELS_CUDA);
        assert!(src.label().contains(&*file.path().display().to_string()));
    }

    #[test]
    fn test_from_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = KernelSource::from_file(dir.path().join("nope.cl")).unwrap_err();
        assert!(matches!(
            err,
            ComputeError::ResourceCreation { stage: ResourceStage::Program, .. }
        ));
    }
}
