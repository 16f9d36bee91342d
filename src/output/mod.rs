use crate::data::VoxelDataset;
use crate::inference::FitResults;
use crate::options::{OptionsError, RunOptions};
use anyhow::{bail, Result};
use log::info;
use ndarray::Array2;
use std::fs;
use std::path::{Path, PathBuf};

/// Which result volumes a run writes; `paramnames.txt` and the log file are
/// always written.
#[derive(Debug, Clone)]
pub struct SaveFlags {
    pub mean: bool,
    pub std: bool,
    pub zstat: bool,
    pub noise_mean: bool,
    pub noise_std: bool,
    pub free_energy: bool,
    pub model_fit: bool,
    pub residuals: bool,
    pub mvn: bool,
}

impl Default for SaveFlags {
    fn default() -> Self {
        Self {
            mean: true,
            std: true,
            zstat: false,
            noise_mean: false,
            noise_std: false,
            free_energy: false,
            model_fit: true,
            residuals: false,
            mvn: false,
        }
    }
}

impl SaveFlags {
    pub fn from_options(options: &RunOptions) -> Result<Self, OptionsError> {
        let or = |key: &str, default: bool| -> Result<bool, OptionsError> {
            if options.contains(key) {
                options.get_bool(key)
            } else {
                Ok(default)
            }
        };
        Ok(Self {
            mean: or("save-mean", true)?,
            std: or("save-std", true)?,
            zstat: or("save-zstat", false)?,
            noise_mean: or("save-noise-mean", false)?,
            noise_std: or("save-noise-std", false)?,
            free_energy: or("save-free-energy", false)?,
            model_fit: or("save-model-fit", true)?,
            residuals: or("save-residuals", false)?,
            mvn: or("save-mvn", false)?,
        })
    }
}

/// Resolve the output directory: create it if free, reuse it under
/// `--overwrite`, otherwise suffix `+` until a free name is found (50
/// attempts).
pub fn prepare_output_dir(base: &Path, overwrite: bool) -> Result<PathBuf> {
    let mut candidate = base.to_path_buf();
    for _ in 0..50 {
        if !candidate.exists() {
            fs::create_dir_all(&candidate)?;
            return Ok(candidate);
        }
        if overwrite {
            return Ok(candidate);
        }
        let mut name = candidate
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push("+");
        candidate.set_file_name(name);
    }
    bail!(
        "could not find a free output directory near {:?} after 50 attempts",
        base
    );
}

fn write_scalar_volume(path: &Path, dataset: &VoxelDataset, values: &[f64]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["x", "y", "z", "value"])?;
    for (v, c) in dataset.coords().iter().enumerate() {
        writer.write_record(&[
            c[0].to_string(),
            c[1].to_string(),
            c[2].to_string(),
            values[v].to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn write_series_volume(path: &Path, dataset: &VoxelDataset, series: &Array2<f64>) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    let n_t = series.nrows();
    let mut header = vec!["x".to_string(), "y".to_string(), "z".to_string()];
    header.extend((0..n_t).map(|t| format!("t{}", t)));
    writer.write_record(&header)?;

    for (v, c) in dataset.coords().iter().enumerate() {
        let mut record = vec![c[0].to_string(), c[1].to_string(), c[2].to_string()];
        record.extend((0..n_t).map(|t| series[(t, v)].to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// The final MVN volume: per voxel the upper triangle of the augmented
/// symmetric matrix [[Sigma, mu], [mu', 1]], the standard packing for
/// symmetric-matrix volumes.
fn write_mvn_volume(path: &Path, dataset: &VoxelDataset, results: &mut FitResults) -> Result<()> {
    let n_params = results.param_names.len();
    let dim = n_params + 1;
    let n_elements = dim * (dim + 1) / 2;

    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec!["x".to_string(), "y".to_string(), "z".to_string()];
    header.extend((0..n_elements).map(|i| format!("m{}", i)));
    writer.write_record(&header)?;

    for (v, c) in dataset.coords().iter().enumerate() {
        let mean = results.posteriors[v].mean().clone();
        let cov = results.posteriors[v].covariance()?.clone();
        let mut record = vec![c[0].to_string(), c[1].to_string(), c[2].to_string()];
        for i in 0..dim {
            for j in i..dim {
                let value = match (i == n_params, j == n_params) {
                    (false, false) => cov[(i, j)],
                    (false, true) => mean[i],
                    (true, true) => 1.0,
                    (true, false) => unreachable!(),
                };
                record.push(value.to_string());
            }
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Write all requested result volumes plus `paramnames.txt`.
pub fn save_results(
    output_dir: &Path,
    results: &mut FitResults,
    dataset: &VoxelDataset,
    flags: &SaveFlags,
) -> Result<()> {
    info!("Saving results to {:?}", output_dir);
    fs::create_dir_all(output_dir)?;

    let param_names = results.param_names.clone();
    for (i, name) in param_names.iter().enumerate() {
        let means: Vec<f64> = (0..results.n_voxels()).map(|v| results.means[(i, v)]).collect();
        let stds: Vec<f64> = (0..results.n_voxels()).map(|v| results.stds[(i, v)]).collect();
        if flags.mean {
            write_scalar_volume(&output_dir.join(format!("mean_{}.csv", name)), dataset, &means)?;
        }
        if flags.std {
            write_scalar_volume(&output_dir.join(format!("std_{}.csv", name)), dataset, &stds)?;
        }
        if flags.zstat {
            let zstats: Vec<f64> = means
                .iter()
                .zip(&stds)
                .map(|(m, s)| if *s > 0.0 { m / s } else { 0.0 })
                .collect();
            write_scalar_volume(
                &output_dir.join(format!("zstat_{}.csv", name)),
                dataset,
                &zstats,
            )?;
        }
    }

    if flags.noise_mean {
        write_scalar_volume(&output_dir.join("noise_mean.csv"), dataset, &results.noise_means)?;
    }
    if flags.noise_std {
        write_scalar_volume(&output_dir.join("noise_std.csv"), dataset, &results.noise_stds)?;
    }
    if flags.free_energy {
        write_scalar_volume(&output_dir.join("freeEnergy.csv"), dataset, &results.free_energy)?;
    }
    if flags.model_fit {
        write_series_volume(&output_dir.join("modelfit.csv"), dataset, &results.modelfit)?;
    }
    if flags.residuals {
        write_series_volume(&output_dir.join("residuals.csv"), dataset, &results.residuals)?;
    }
    if flags.mvn {
        write_mvn_volume(&output_dir.join("finalMVN.csv"), dataset, results)?;
    }

    let names = param_names.join("\n");
    fs::write(output_dir.join("paramnames.txt"), names + "\n")?;

    info!("All results saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_base(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("fabber_out_{}_{}", tag, std::process::id()))
    }

    #[test]
    fn test_output_dir_suffixing() {
        let base = temp_base("suffix");
        std::fs::remove_dir_all(&base).ok();
        let plus = base.with_file_name(format!(
            "{}+",
            base.file_name().unwrap().to_string_lossy()
        ));
        let plus2 = base.with_file_name(format!(
            "{}++",
            base.file_name().unwrap().to_string_lossy()
        ));
        std::fs::remove_dir_all(&plus).ok();
        std::fs::remove_dir_all(&plus2).ok();

        let first = prepare_output_dir(&base, false).unwrap();
        assert_eq!(first, base);
        let second = prepare_output_dir(&base, false).unwrap();
        assert_eq!(second, plus);
        let third = prepare_output_dir(&base, false).unwrap();
        assert_eq!(third, plus2);

        // With overwrite the original directory is reused.
        let again = prepare_output_dir(&base, true).unwrap();
        assert_eq!(again, base);

        std::fs::remove_dir_all(&base).ok();
        std::fs::remove_dir_all(&plus).ok();
        std::fs::remove_dir_all(&plus2).ok();
    }

    #[test]
    fn test_save_flags_from_options() {
        let mut options = RunOptions::new();
        options
            .parse_args(&["--save-zstat".to_string(), "--save-mean=false".to_string()])
            .unwrap();
        let flags = SaveFlags::from_options(&options).unwrap();
        assert!(flags.zstat);
        assert!(!flags.mean);
        assert!(flags.std); // untouched default
    }
}
