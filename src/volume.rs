use std::collections::BTreeMap;

use ndarray::{Array3, Array4, ArrayView3, Axis};

use crate::error::{CorrectionError, Result};
use crate::geometry::ReferenceGrid;

/// Non-geometric image attributes (acquisition parameters, provenance).
/// Carried unchanged onto every volume derived from this one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub name: String,
    pub attributes: BTreeMap<String, String>,
}

impl Metadata {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A 3D volume or 4D series of volumes on a single grid. Data is laid out
/// `(nx, ny, nz, nt)`; 3D images have `nt == 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    data: Array4<f32>,
    grid: ReferenceGrid,
    metadata: Metadata,
}

impl Volume {
    pub fn new(data: Array4<f32>, grid: ReferenceGrid, metadata: Metadata) -> Result<Self> {
        Self::check_shape(&data, &grid)?;
        Ok(Self {
            data,
            grid,
            metadata,
        })
    }

    /// Wrap a single 3D frame.
    pub fn from_frame(frame: Array3<f32>, grid: ReferenceGrid, metadata: Metadata) -> Result<Self> {
        Self::new(frame.insert_axis(Axis(3)), grid, metadata)
    }

    fn check_shape(data: &Array4<f32>, grid: &ReferenceGrid) -> Result<()> {
        let (nx, ny, nz, _) = data.dim();
        if [nx, ny, nz] != grid.shape() {
            return Err(CorrectionError::IncompatibleGrid {
                what: "volume data",
                expected: grid.shape(),
                found: [nx, ny, nz],
            });
        }
        Ok(())
    }

    /// Get the dimensions of the volume (nx, ny, nz, nt)
    pub fn dim(&self) -> (usize, usize, usize, usize) {
        self.data.dim()
    }

    pub fn n_volumes(&self) -> usize {
        self.data.len_of(Axis(3))
    }

    /// Index of the central timepoint, `floor(nt / 2)`.
    pub fn middle_index(&self) -> usize {
        self.n_volumes() / 2
    }

    /// Get a reference to the underlying data
    pub fn data(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn grid(&self) -> &ReferenceGrid {
        &self.grid
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn frame(&self, index: usize) -> ArrayView3<'_, f32> {
        self.data.index_axis(Axis(3), index)
    }

    /// Single timepoint as its own 3D volume, same grid and metadata.
    pub fn frame_volume(&self, index: usize) -> Result<Volume> {
        if index >= self.n_volumes() {
            return Err(CorrectionError::InvalidInput(format!(
                "{} has {} volumes, requested index {index}",
                self.name(),
                self.n_volumes()
            )));
        }
        Volume::from_frame(self.frame(index).to_owned(), self.grid.clone(), self.metadata.clone())
    }

    /// Mean over timepoints.
    pub fn mean_frame(&self) -> Result<Volume> {
        let mean = self
            .data
            .mean_axis(Axis(3))
            .ok_or_else(|| {
                CorrectionError::InvalidInput(format!("{} has no volumes", self.name()))
            })?;
        Volume::from_frame(mean, self.grid.clone(), self.metadata.clone())
    }

    /// New data on a different grid; metadata is inherited, geometry is
    /// taken from `grid`. Shape and affine change together.
    pub fn derived_on_grid(&self, grid: ReferenceGrid, data: Array4<f32>) -> Result<Volume> {
        Volume::new(data, grid, self.metadata.clone())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.metadata.name = name.into();
        self
    }
}
