pub mod data;
pub mod dist;
pub mod inference;
pub mod models;
pub mod noise;
pub mod options;
pub mod output;
pub mod priors;
pub mod run;
pub mod transforms;
pub mod validation;

pub use data::{DataOrder, NeighbourGraph, VoxelDataset};
pub use dist::{DistParams, Mvn};
pub use inference::{
    CancelToken, FitResults, SpatialConfig, SpatialVbEstimator, VbConfig, VbEstimator,
};
pub use models::{create_model, ForwardModel};
pub use noise::NoiseModel;
pub use options::RunOptions;
pub use run::{RunLog, RunSummary};
