use super::DataError;
use nalgebra::DVector;
use ndarray::Array2;
use std::collections::HashMap;
use std::path::Path;

/// How timepoints from multiple data files are combined into one timeseries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOrder {
    /// file1 t0, file2 t0, ..., file1 t1, file2 t1, ... (equal lengths required)
    Interleave,
    /// All of file1, then all of file2, ...
    Concatenate,
    /// A single `--data` file used as-is.
    SingleFile,
}

impl DataOrder {
    pub fn from_name(name: &str) -> Result<Self, DataError> {
        match name {
            "interleave" => Ok(DataOrder::Interleave),
            "concatenate" => Ok(DataOrder::Concatenate),
            "singlefile" => Ok(DataOrder::SingleFile),
            _ => Err(DataError::InvalidFormat(format!(
                "unknown data-order: {} (expected interleave, concatenate or singlefile)",
                name
            ))),
        }
    }
}

/// Masked 4D timeseries: one row of lattice coordinates and T values per
/// voxel. The mask is implicit; only voxels present in the table are fitted.
/// Voxel order follows the file and is the fixed sweep order.
#[derive(Debug, Clone)]
pub struct VoxelDataset {
    coords: Vec<[i32; 3]>,
    /// T x V data matrix.
    data: Array2<f64>,
}

impl VoxelDataset {
    pub fn new(coords: Vec<[i32; 3]>, data: Array2<f64>) -> Result<Self, DataError> {
        if coords.len() != data.ncols() {
            return Err(DataError::DimensionMismatch(format!(
                "{} coordinate rows but {} data columns",
                coords.len(),
                data.ncols()
            )));
        }
        let mut seen = HashMap::new();
        for (v, c) in coords.iter().enumerate() {
            if seen.insert(*c, v).is_some() {
                return Err(DataError::DuplicateVoxel(c[0], c[1], c[2]));
            }
        }
        Ok(Self { coords, data })
    }

    /// Load a voxel table with header `x,y,z,t0,...,t{T-1}`.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self, DataError> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();

        for (i, col) in ["x", "y", "z"].into_iter().enumerate() {
            if headers.get(i) != Some(col) {
                return Err(DataError::MissingColumn(col.to_string()));
            }
        }
        let n_timepoints = headers.len() - 3;
        if n_timepoints == 0 {
            return Err(DataError::InvalidFormat(
                "no timepoint columns after x,y,z".to_string(),
            ));
        }

        let mut coords = Vec::new();
        let mut values: Vec<f64> = Vec::new();
        for record in reader.records() {
            let record = record?;
            if record.len() != headers.len() {
                return Err(DataError::InvalidFormat(format!(
                    "row with {} fields, header has {}",
                    record.len(),
                    headers.len()
                )));
            }
            let parse = |s: &str| -> Result<f64, DataError> {
                s.trim()
                    .parse::<f64>()
                    .map_err(|_| DataError::InvalidFormat(format!("bad numeric field: {:?}", s)))
            };
            let coord = [
                parse(&record[0])? as i32,
                parse(&record[1])? as i32,
                parse(&record[2])? as i32,
            ];
            for t in 0..n_timepoints {
                let v = parse(&record[3 + t])?;
                if !v.is_finite() {
                    return Err(DataError::NonFinite {
                        x: coord[0],
                        y: coord[1],
                        z: coord[2],
                        t,
                    });
                }
                values.push(v);
            }
            coords.push(coord);
        }

        if coords.is_empty() {
            return Err(DataError::InvalidFormat("no voxel rows in data file".to_string()));
        }

        // values are voxel-major; store as T x V
        let n_voxels = coords.len();
        let mut data = Array2::zeros((n_timepoints, n_voxels));
        for v in 0..n_voxels {
            for t in 0..n_timepoints {
                data[(t, v)] = values[v * n_timepoints + t];
            }
        }

        Self::new(coords, data)
    }

    /// Load and combine `--data1..--dataN` files.
    pub fn from_csv_multi<P: AsRef<Path>>(paths: &[P], order: DataOrder) -> Result<Self, DataError> {
        if paths.is_empty() {
            return Err(DataError::InvalidFormat("no data files given".to_string()));
        }
        let parts: Vec<VoxelDataset> = paths
            .iter()
            .map(VoxelDataset::from_csv)
            .collect::<Result<_, _>>()?;

        if parts.len() == 1 || order == DataOrder::SingleFile {
            if order == DataOrder::SingleFile && parts.len() > 1 {
                return Err(DataError::InvalidFormat(
                    "data-order=singlefile with more than one data file".to_string(),
                ));
            }
            return Ok(parts.into_iter().next().unwrap());
        }

        let first = &parts[0];
        for p in &parts[1..] {
            if p.coords != first.coords {
                return Err(DataError::DimensionMismatch(
                    "data files cover different voxel sets".to_string(),
                ));
            }
        }

        let n_voxels = first.n_voxels();
        let data = match order {
            DataOrder::Interleave => {
                let t_each = first.n_timepoints();
                for p in &parts[1..] {
                    if p.n_timepoints() != t_each {
                        return Err(DataError::DimensionMismatch(
                            "interleave requires equal timepoint counts".to_string(),
                        ));
                    }
                }
                let mut data = Array2::zeros((t_each * parts.len(), n_voxels));
                for (f, p) in parts.iter().enumerate() {
                    for t in 0..t_each {
                        for v in 0..n_voxels {
                            data[(t * parts.len() + f, v)] = p.data[(t, v)];
                        }
                    }
                }
                data
            }
            DataOrder::Concatenate => {
                let t_total: usize = parts.iter().map(|p| p.n_timepoints()).sum();
                let mut data = Array2::zeros((t_total, n_voxels));
                let mut row = 0;
                for p in &parts {
                    for t in 0..p.n_timepoints() {
                        for v in 0..n_voxels {
                            data[(row, v)] = p.data[(t, v)];
                        }
                        row += 1;
                    }
                }
                data
            }
            DataOrder::SingleFile => unreachable!(),
        };

        VoxelDataset::new(first.coords.clone(), data)
    }

    pub fn n_voxels(&self) -> usize {
        self.coords.len()
    }

    pub fn n_timepoints(&self) -> usize {
        self.data.nrows()
    }

    pub fn coords(&self) -> &[[i32; 3]] {
        &self.coords
    }

    pub fn coord(&self, voxel: usize) -> [i32; 3] {
        self.coords[voxel]
    }

    /// Timeseries of one voxel as a column vector.
    pub fn timeseries(&self, voxel: usize) -> DVector<f64> {
        DVector::from_iterator(self.n_timepoints(), self.data.column(voxel).iter().copied())
    }

    pub fn data(&self) -> &Array2<f64> {
        &self.data
    }

    /// Keep only voxels whose mask value is > 0; voxels absent from the mask
    /// volume are dropped.
    pub fn apply_mask(&self, mask: &ImageVolume) -> Result<VoxelDataset, DataError> {
        let keep: Vec<usize> = self
            .coords
            .iter()
            .enumerate()
            .filter(|(_, c)| mask.value_at(**c).is_some_and(|v| v > 0.0))
            .map(|(i, _)| i)
            .collect();
        if keep.is_empty() {
            return Err(DataError::InvalidFormat(
                "mask excludes every voxel".to_string(),
            ));
        }
        let coords = keep.iter().map(|&i| self.coords[i]).collect();
        let mut data = Array2::zeros((self.n_timepoints(), keep.len()));
        for (new_v, &old_v) in keep.iter().enumerate() {
            for t in 0..self.n_timepoints() {
                data[(t, new_v)] = self.data[(t, old_v)];
            }
        }
        VoxelDataset::new(coords, data)
    }
}

/// Scalar volume aligned to a dataset, used for image priors.
#[derive(Debug, Clone)]
pub struct ImageVolume {
    values: HashMap<[i32; 3], f64>,
}

impl ImageVolume {
    /// Load a CSV with header `x,y,z,value`.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self, DataError> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        if headers.len() < 4 {
            return Err(DataError::InvalidFormat(
                "image volume needs columns x,y,z,value".to_string(),
            ));
        }
        let mut values = HashMap::new();
        for record in reader.records() {
            let record = record?;
            let parse = |s: &str| -> Result<f64, DataError> {
                s.trim()
                    .parse::<f64>()
                    .map_err(|_| DataError::InvalidFormat(format!("bad numeric field: {:?}", s)))
            };
            let coord = [
                parse(&record[0])? as i32,
                parse(&record[1])? as i32,
                parse(&record[2])? as i32,
            ];
            values.insert(coord, parse(&record[3])?);
        }
        Ok(Self { values })
    }

    pub fn value_at(&self, coord: [i32; 3]) -> Option<f64> {
        self.values.get(&coord).copied()
    }

    /// Per-voxel values in dataset order; every dataset voxel must be covered.
    pub fn aligned_to(&self, dataset: &VoxelDataset) -> Result<DVector<f64>, DataError> {
        let mut out = DVector::zeros(dataset.n_voxels());
        for (v, c) in dataset.coords().iter().enumerate() {
            out[v] = *self
                .values
                .get(c)
                .ok_or(DataError::MissingVoxel(c[0], c[1], c[2]))?;
        }
        Ok(out)
    }
}
