use crate::data::{DataError, VoxelDataset};
use log::{info, warn};

/// Pre-run sanity checks on the loaded dataset. Hard errors abort before any
/// voxel work begins; suspicious-but-legal data only warns.
pub fn validate_dataset(dataset: &VoxelDataset) -> Result<(), DataError> {
    info!(
        "Validating dataset: {} voxels, {} timepoints",
        dataset.n_voxels(),
        dataset.n_timepoints()
    );

    if dataset.n_voxels() == 0 {
        return Err(DataError::InvalidFormat("no voxels in dataset".to_string()));
    }
    if dataset.n_timepoints() < 2 {
        return Err(DataError::InvalidFormat(
            "timeseries needs at least 2 timepoints".to_string(),
        ));
    }

    let mut extreme_voxels = 0;
    let mut flat_voxels = 0;
    for v in 0..dataset.n_voxels() {
        let ts = dataset.timeseries(v);
        if ts.iter().any(|x| x.abs() > 1e6) {
            extreme_voxels += 1;
        }
        let first = ts[0];
        if ts.iter().all(|x| *x == first) {
            flat_voxels += 1;
        }
    }
    if extreme_voxels > 0 {
        warn!("{} voxels contain values above 1e6", extreme_voxels);
    }
    if flat_voxels > 0 {
        warn!("{} voxels have a constant timeseries", flat_voxels);
    }

    info!("Dataset validation completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_valid_dataset_passes() {
        let dataset = VoxelDataset::new(
            vec![[0, 0, 0], [1, 0, 0]],
            array![[1.0, 2.0], [1.5, 2.5], [0.5, 1.5]],
        )
        .unwrap();
        assert!(validate_dataset(&dataset).is_ok());
    }

    #[test]
    fn test_single_timepoint_rejected() {
        let dataset =
            VoxelDataset::new(vec![[0, 0, 0]], array![[1.0]]).unwrap();
        assert!(validate_dataset(&dataset).is_err());
    }
}
