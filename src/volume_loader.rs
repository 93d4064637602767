use std::fs;
use std::path::Path;

use nalgebra::Matrix4;
use ndarray::{Array2, Array4, ArrayD, Axis, Ix3, Ix4, Ix5};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::distortion::TopupParams;
use crate::error::{CorrectionError, Result};
use crate::geometry::{Jacobian, ReferenceGrid, RigidTransform, WarpField};
use crate::motion::{stack_matrices, unstack_matrices};
use crate::volume::{Metadata, Volume};

/// Metadata attribute holding the repetition time (NIfTI `pixdim[4]`).
pub const TR_ATTRIBUTE: &str = "tr";

pub struct VolumeLoader;

impl VolumeLoader {
    /// Load a 3D or 4D NIfTI image.
    ///
    /// The voxel→world affine is taken from the sform when set, then the
    /// qform, and otherwise built from the voxel sizes alone.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or is not 3D/4D
    pub fn load(path: impl AsRef<Path>, name: impl Into<String>) -> Result<Volume> {
        let path = path.as_ref();
        let obj = ReaderOptions::new().read_file(path)?;
        let header = obj.header().clone();
        let data = obj.into_volume().into_ndarray::<f32>()?;

        let data = Self::as_series(data, path)?;
        let (nx, ny, nz, nt) = data.dim();
        let grid = ReferenceGrid::new([nx, ny, nz], Self::affine(&header))?;

        let mut metadata = Metadata::named(name);
        if nt > 1 && header.pixdim[4] > 0.0 {
            metadata = metadata.with_attribute(TR_ATTRIBUTE, header.pixdim[4].to_string());
        }
        tracing::debug!(path = %path.display(), shape = ?data.dim(), "loaded image");
        Volume::new(data, grid, metadata)
    }

    /// Save a volume. Single-timepoint volumes are written as 3D images.
    pub fn save(volume: &Volume, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut header = Self::header(volume.grid());
        if let Some(tr) = volume
            .metadata()
            .attributes
            .get(TR_ATTRIBUTE)
            .and_then(|tr| tr.parse::<f32>().ok())
        {
            header.pixdim[4] = tr;
        }

        let writer = WriterOptions::new(path).reference_header(&header);
        if volume.n_volumes() == 1 {
            writer.write_nifti(&volume.frame(0))?;
        } else {
            writer.write_nifti(volume.data())?;
        }
        tracing::debug!(path = %path.display(), name = volume.name(), "saved image");
        Ok(())
    }

    /// Load a relative displacement warp, stored either as `(x, y, z, 3)` or
    /// as `(x, y, z, 1, 3)`.
    pub fn load_warp(path: impl AsRef<Path>) -> Result<WarpField> {
        let path = path.as_ref();
        let obj = ReaderOptions::new().read_file(path)?;
        let header = obj.header().clone();
        let data = obj.into_volume().into_ndarray::<f32>()?;

        let displacement: Array4<f32> = match data.ndim() {
            4 => data.into_dimensionality::<Ix4>()?,
            5 if data.shape()[3] == 1 => data
                .into_dimensionality::<Ix5>()?
                .index_axis_move(Axis(3), 0),
            _ => return Err(Self::bad_shape(path, data.shape(), "(x, y, z, 3)")),
        };
        let (nx, ny, nz, _) = displacement.dim();
        let grid = ReferenceGrid::new([nx, ny, nz], Self::affine(&header))?;
        WarpField::new(grid, displacement)
    }

    /// Save a warp as a 4D `(x, y, z, 3)` image.
    pub fn save_warp(warp: &WarpField, path: impl AsRef<Path>) -> Result<()> {
        let header = Self::header(warp.grid());
        WriterOptions::new(path.as_ref())
            .reference_header(&header)
            .write_nifti(warp.displacement())?;
        Ok(())
    }

    pub fn save_jacobian(jacobian: &Jacobian, path: impl AsRef<Path>) -> Result<()> {
        let header = Self::header(jacobian.grid());
        WriterOptions::new(path.as_ref())
            .reference_header(&header)
            .write_nifti(jacobian.values())?;
        Ok(())
    }

    /// Read stacked `(4n, 4)` motion matrices, one 4×4 block per volume.
    pub fn read_motion_matrices(path: impl AsRef<Path>) -> Result<Vec<RigidTransform>> {
        let stacked = Self::read_matrix_text(path.as_ref())?;
        unstack_matrices(&stacked)
    }

    pub fn write_motion_matrices(
        path: impl AsRef<Path>,
        transforms: &[RigidTransform],
    ) -> Result<()> {
        Self::write_matrix_text(path.as_ref(), &stack_matrices(transforms))
    }

    /// Read a single 4×4 matrix file.
    pub fn read_matrix(path: impl AsRef<Path>) -> Result<RigidTransform> {
        let path = path.as_ref();
        let mut transforms = Self::read_motion_matrices(path)?;
        match transforms.len() {
            1 => Ok(transforms.remove(0)),
            n => Err(CorrectionError::InvalidInput(format!(
                "{} holds {n} matrices, expected one",
                path.display()
            ))),
        }
    }

    pub fn write_matrix(path: impl AsRef<Path>, transform: &RigidTransform) -> Result<()> {
        Self::write_motion_matrices(path, std::slice::from_ref(transform))
    }

    pub fn write_topup_params(path: impl AsRef<Path>, params: &TopupParams) -> Result<()> {
        fs::write(path, params.to_string())?;
        Ok(())
    }

    fn read_matrix_text(path: &Path) -> Result<Array2<f64>> {
        let text = fs::read_to_string(path)?;
        let rows = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.split_whitespace()
                    .map(|v| {
                        v.parse::<f64>().map_err(|e| {
                            CorrectionError::InvalidInput(format!("{}: {v:?}: {e}", path.display()))
                        })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        if let Some(row) = rows.iter().find(|row| row.len() != 4) {
            return Err(CorrectionError::InvalidInput(format!(
                "{}: expected 4 values per row, found {}",
                path.display(),
                row.len()
            )));
        }
        let n = rows.len();
        Ok(Array2::from_shape_vec((n, 4), rows.concat())?)
    }

    fn write_matrix_text(path: &Path, matrix: &Array2<f64>) -> Result<()> {
        let mut text = String::new();
        for row in matrix.rows() {
            let line: Vec<String> = row.iter().map(|v| format!("{v:.10}")).collect();
            text.push_str(&line.join(" "));
            text.push('\n');
        }
        fs::write(path, text)?;
        Ok(())
    }

    fn as_series(data: ArrayD<f32>, path: &Path) -> Result<Array4<f32>> {
        match data.ndim() {
            3 => Ok(data.into_dimensionality::<Ix3>()?.insert_axis(Axis(3))),
            4 => Ok(data.into_dimensionality::<Ix4>()?),
            _ => Err(Self::bad_shape(path, data.shape(), "3D or 4D")),
        }
    }

    fn bad_shape(path: &Path, shape: &[usize], expected: &str) -> CorrectionError {
        CorrectionError::InvalidInput(format!(
            "{}: expected {expected} image, found shape {shape:?}",
            path.display()
        ))
    }

    fn affine(header: &NiftiHeader) -> Matrix4<f64> {
        let [dx, dy, dz] = [1, 2, 3].map(|i| f64::from(header.pixdim[i]));
        if header.sform_code > 0 {
            let rows = [header.srow_x, header.srow_y, header.srow_z];
            Matrix4::from_fn(|r, c| {
                if r < 3 {
                    f64::from(rows[r][c])
                } else if c == 3 {
                    1.0
                } else {
                    0.0
                }
            })
        } else if header.qform_code > 0 {
            let b = f64::from(header.quatern_b);
            let c = f64::from(header.quatern_c);
            let d = f64::from(header.quatern_d);
            let a = (1.0 - (b * b + c * c + d * d).min(1.0)).sqrt();
            let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
            let dz = dz * qfac;
            Matrix4::new(
                (a * a + b * b - c * c - d * d) * dx,
                (2.0 * b * c - 2.0 * a * d) * dy,
                (2.0 * b * d + 2.0 * a * c) * dz,
                f64::from(header.quatern_x),
                (2.0 * b * c + 2.0 * a * d) * dx,
                (a * a + c * c - b * b - d * d) * dy,
                (2.0 * c * d - 2.0 * a * b) * dz,
                f64::from(header.quatern_y),
                (2.0 * b * d - 2.0 * a * c) * dx,
                (2.0 * c * d + 2.0 * a * b) * dy,
                (a * a + d * d - c * c - b * b) * dz,
                f64::from(header.quatern_z),
                0.0,
                0.0,
                0.0,
                1.0,
            )
        } else {
            Matrix4::new_nonuniform_scaling(&nalgebra::Vector3::new(dx, dy, dz))
        }
    }

    /// Header carrying the grid geometry as an sform.
    fn header(grid: &ReferenceGrid) -> NiftiHeader {
        let affine = grid.affine();
        let row = |r: usize| [0, 1, 2, 3].map(|c| affine[(r, c)] as f32);
        let spacing = grid.spacing();

        let mut header = NiftiHeader {
            sform_code: 1,
            qform_code: 0,
            srow_x: row(0),
            srow_y: row(1),
            srow_z: row(2),
            ..NiftiHeader::default()
        };
        header.pixdim[0] = 1.0;
        for (i, s) in spacing.iter().enumerate() {
            header.pixdim[i + 1] = *s as f32;
        }
        header
    }
}
