pub mod neighbours;
pub mod volume;

pub use neighbours::NeighbourGraph;
pub use volume::{DataOrder, ImageVolume, VoxelDataset};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Missing required column: {0}")]
    MissingColumn(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Non-finite value at voxel ({x},{y},{z}), timepoint {t}")]
    NonFinite { x: i32, y: i32, z: i32, t: usize },

    #[error("Duplicate voxel coordinates ({0},{1},{2})")]
    DuplicateVoxel(i32, i32, i32),

    #[error("Image volume has no value for voxel ({0},{1},{2})")]
    MissingVoxel(i32, i32, i32),
}
