use crate::data::{DataOrder, ImageVolume, VoxelDataset};
use crate::inference::{
    collect_results, initial_fabber_priors, initial_states, CancelToken, FitResults,
    SpatialConfig, SpatialVbEstimator, VbConfig, VbEstimator, METHOD_NAMES, SPATIALVB_OPTIONS,
    VB_OPTIONS,
};
use crate::models::{create_model, model_option_specs, ForwardModel};
use crate::noise::{NoiseModel, NOISE_OPTIONS};
use crate::options::{OptionKind, OptionSpec, RunOptions};
use crate::output::{prepare_output_dir, save_results, SaveFlags};
use crate::priors::{parse_prior_types, ParamPrior, PriorKind};
use crate::transforms::{get_transform, ParamTransform};
use crate::validation;
use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

/// Options owned by the run layer itself (data selection, output control).
pub const CORE_OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "data",
        kind: OptionKind::File,
        default: None,
        description: "Voxel timeseries table (single-file mode)",
    },
    OptionSpec {
        name: "data-order",
        kind: OptionKind::Str,
        default: Some("singlefile"),
        description: "How multiple data files combine: interleave, concatenate or singlefile",
    },
    OptionSpec {
        name: "mask",
        kind: OptionKind::File,
        default: None,
        description: "Mask volume; voxels with value > 0 are fitted",
    },
    OptionSpec {
        name: "output",
        kind: OptionKind::File,
        default: None,
        description: "Output directory",
    },
    OptionSpec {
        name: "model",
        kind: OptionKind::Str,
        default: None,
        description: "Forward model name",
    },
    OptionSpec {
        name: "method",
        kind: OptionKind::Str,
        default: Some("vb"),
        description: "Inference method: vb or spatialvb",
    },
    OptionSpec {
        name: "noise",
        kind: OptionKind::Str,
        default: Some("white"),
        description: "Noise model: white or ar1",
    },
    OptionSpec {
        name: "overwrite",
        kind: OptionKind::Bool,
        default: Some("false"),
        description: "Reuse the output directory instead of suffixing +",
    },
    OptionSpec {
        name: "save-mean",
        kind: OptionKind::Bool,
        default: Some("true"),
        description: "Write mean_<param> volumes",
    },
    OptionSpec {
        name: "save-std",
        kind: OptionKind::Bool,
        default: Some("true"),
        description: "Write std_<param> volumes",
    },
    OptionSpec {
        name: "save-zstat",
        kind: OptionKind::Bool,
        default: Some("false"),
        description: "Write zstat_<param> volumes",
    },
    OptionSpec {
        name: "save-noise-mean",
        kind: OptionKind::Bool,
        default: Some("false"),
        description: "Write the noise precision mean volume",
    },
    OptionSpec {
        name: "save-noise-std",
        kind: OptionKind::Bool,
        default: Some("false"),
        description: "Write the noise precision std volume",
    },
    OptionSpec {
        name: "save-free-energy",
        kind: OptionKind::Bool,
        default: Some("false"),
        description: "Write the per-voxel free energy volume",
    },
    OptionSpec {
        name: "save-model-fit",
        kind: OptionKind::Bool,
        default: Some("true"),
        description: "Write the model prediction timeseries",
    },
    OptionSpec {
        name: "save-residuals",
        kind: OptionKind::Bool,
        default: Some("false"),
        description: "Write the residual timeseries",
    },
    OptionSpec {
        name: "save-mvn",
        kind: OptionKind::Bool,
        default: Some("false"),
        description: "Write the final posterior MVN volume",
    },
];

/// Per-parameter option-key families accepted in addition to the declared
/// tables: data1..dataN plus the prior/transform overrides.
const OPTION_PREFIXES: &[&str] = &[
    "data",
    "prior-mean-",
    "prior-var-",
    "image-prior-",
    "transform-",
];

/// Run-scoped append-only log sink. Every record is mirrored to the `log`
/// facade and kept for `logfile.txt`; handles are shared by reference, not
/// through an ambient global.
#[derive(Debug, Default)]
pub struct RunLog {
    lines: Mutex<Vec<String>>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, level: &str, message: &str) {
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        self.lines
            .lock()
            .unwrap()
            .push(format!("{} [{}] {}", stamp, level, message));
    }

    pub fn info(&self, message: &str) {
        info!("{}", message);
        self.record("INFO", message);
    }

    pub fn warn(&self, message: &str) {
        warn!("{}", message);
        self.record("WARN", message);
    }

    pub fn error(&self, message: &str) {
        log::error!("{}", message);
        self.record("ERROR", message);
    }

    pub fn contents(&self) -> String {
        let lines = self.lines.lock().unwrap();
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.contents())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub output_dir: PathBuf,
    pub model: String,
    pub method: String,
    pub noise: String,
    pub n_voxels: usize,
    pub n_timepoints: usize,
    pub n_parameters: usize,
    pub n_converged: usize,
    pub n_failed: usize,
    pub outer_iterations: usize,
    pub aggregate_free_energy: f64,
    pub runtime_seconds: f64,
    pub finished_at: String,
}

fn collect_data_paths(options: &RunOptions) -> Result<(Vec<String>, DataOrder)> {
    if let Some(single) = options.get_str("data") {
        let order = DataOrder::from_name(&options.get_str_or("data-order", "singlefile"))?;
        return Ok((vec![single.to_string()], order));
    }

    let mut paths = Vec::new();
    for i in 1.. {
        match options.get_str(&format!("data{}", i)) {
            Some(p) => paths.push(p.to_string()),
            None => break,
        }
    }
    if paths.is_empty() {
        bail!("Missing required option: --data (or --data1, --data2, ...)");
    }
    let order = DataOrder::from_name(&options.get_str_or("data-order", "interleave"))?;
    Ok((paths, order))
}

fn resolve_transforms(
    model: &dyn ForwardModel,
    options: &RunOptions,
) -> Result<Vec<&'static dyn ParamTransform>> {
    model
        .transform_codes()
        .into_iter()
        .zip(model.param_names())
        .map(|(default_code, name)| {
            let key = format!("transform-{}", name);
            let code = options.get_str(&key).unwrap_or(default_code);
            get_transform(code)
                .ok_or_else(|| anyhow!("Invalid value for --{}: {:?} (expected I, L or S)", key, code))
        })
        .collect()
}

fn build_priors(
    model: &dyn ForwardModel,
    transforms: &[&'static dyn ParamTransform],
    options: &RunOptions,
    dataset: &VoxelDataset,
    spatial_method: bool,
) -> Result<Vec<ParamPrior>> {
    let names = model.param_names();
    let kinds = parse_prior_types(
        &options.get_str_or("param-spatial-priors", "N+"),
        names.len(),
    )?;
    if !spatial_method {
        if let Some(kind) = kinds.iter().find(|k| k.is_spatial()) {
            bail!(
                "Prior type {:?} requires --method=spatialvb",
                kind.code()
            );
        }
    }

    let bases = initial_fabber_priors(model, transforms);
    let mut priors = Vec::with_capacity(names.len());
    for ((kind, base), (name, transform)) in kinds
        .into_iter()
        .zip(bases)
        .zip(names.iter().zip(transforms))
    {
        let mut prior = ParamPrior::new(kind, base);
        // Overrides are given in fabber space, where the prior is Gaussian.
        if let Some(mean) = options.get_f64(&format!("prior-mean-{}", name))? {
            prior.base.mean = mean;
        }
        if let Some(var) = options.get_f64(&format!("prior-var-{}", name))? {
            if var <= 0.0 {
                bail!("Invalid value for --prior-var-{}: must be positive", name);
            }
            prior.base.var = var;
        }
        if kind == PriorKind::Image {
            let key = format!("image-prior-{}", name);
            let path = options
                .require_str(&key)
                .with_context(|| format!("image prior requested for parameter {}", name))?;
            let volume = ImageVolume::from_csv(path)
                .with_context(|| format!("loading image prior {:?}", path))?;
            let aligned = volume.aligned_to(dataset)?;
            let fabber = nalgebra::DVector::from_iterator(
                aligned.len(),
                aligned.iter().map(|&v| transform.to_fabber(v)),
            );
            prior.image_means = Some(fabber);
        }
        priors.push(prior);
    }
    Ok(priors)
}

/// Execute a complete run from parsed options: load data, fit every voxel,
/// write results. Fails fast on option/data errors; voxel-level numerical
/// failures are recorded and reported through the summary instead.
pub fn run(options: &RunOptions, cancel: &CancelToken) -> Result<RunSummary> {
    let started = Instant::now();
    let run_log = RunLog::new();

    let model_name = options.require_str("model")?.to_string();
    let method = options.get_str_or("method", "vb");
    if !METHOD_NAMES.contains(&method.as_str()) {
        bail!(
            "Unknown method: {} (supported: {})",
            method,
            METHOD_NAMES.join(", ")
        );
    }
    let noise_name = options.get_str_or("noise", "white");

    // Reject unknown keys before any heavy work; model options are checked
    // against the model's own table.
    let model_specs = model_option_specs(&model_name)?;
    options.check_known(
        &[
            CORE_OPTIONS,
            VB_OPTIONS,
            SPATIALVB_OPTIONS,
            NOISE_OPTIONS,
            model_specs,
        ],
        OPTION_PREFIXES,
    )?;

    let (paths, order) = collect_data_paths(options)?;
    run_log.info(&format!(
        "Loading {} data file(s), order {:?}",
        paths.len(),
        order
    ));
    let mut dataset = VoxelDataset::from_csv_multi(&paths, order)
        .with_context(|| format!("loading data from {:?}", paths))?;
    if let Some(mask_path) = options.get_str("mask") {
        let mask = ImageVolume::from_csv(mask_path)
            .with_context(|| format!("loading mask {:?}", mask_path))?;
        let before = dataset.n_voxels();
        dataset = dataset.apply_mask(&mask)?;
        run_log.info(&format!(
            "Mask kept {} of {} voxels",
            dataset.n_voxels(),
            before
        ));
    }
    validation::validate_dataset(&dataset)?;
    run_log.info(&format!(
        "Loaded {} voxels with {} timepoints",
        dataset.n_voxels(),
        dataset.n_timepoints()
    ));

    let model = create_model(&model_name, options)?;
    let noise = NoiseModel::from_name(&noise_name, options)?;
    let transforms = resolve_transforms(model.as_ref(), options)?;
    run_log.info(&format!(
        "Model {} with {} parameters; noise {}; method {}",
        model.name(),
        model.n_params(),
        noise.name(),
        method
    ));

    let spatial_method = method == "spatialvb";
    let mut priors = build_priors(model.as_ref(), &transforms, options, &dataset, spatial_method)?;
    // Posterior seeds follow the (possibly overridden) fabber-space priors.
    let seeds: Vec<_> = priors.iter().map(|p| p.base).collect();
    let mut states = initial_states(&noise, &seeds, dataset.n_voxels());

    let outer_iterations = if spatial_method {
        let config = SpatialConfig {
            vb: VbConfig {
                progress: true,
                ..VbConfig::from_options(options)?
            },
            ..SpatialConfig::from_options(options)?
        };
        let estimator = SpatialVbEstimator::new(model.as_ref(), &noise, &transforms, &config);
        estimator
            .fit(&dataset, &mut priors, &mut states, cancel)
            .context("spatial VB failed")?
    } else {
        let config = VbConfig {
            progress: true,
            ..VbConfig::from_options(options)?
        };
        let estimator = VbEstimator::new(model.as_ref(), &noise, &transforms, &config);
        estimator
            .fit_all(&dataset, &priors, &mut states, cancel)
            .context("VB failed")?;
        1
    };

    let mut results: FitResults = collect_results(
        model.as_ref(),
        &noise,
        &transforms,
        &dataset,
        &mut states,
        outer_iterations,
    )?;

    for (v, failure) in results.failed.iter().enumerate() {
        if let Some(cause) = failure {
            let c = dataset.coord(v);
            run_log.warn(&format!(
                "voxel ({},{},{}) failed: {}",
                c[0], c[1], c[2], cause
            ));
        }
    }

    let output_base = PathBuf::from(options.require_str("output")?);
    let overwrite = options.get_bool("overwrite")?;
    let output_dir = prepare_output_dir(&output_base, overwrite)?;
    run_log.info(&format!("Writing results to {:?}", output_dir));

    let flags = SaveFlags::from_options(options)?;
    save_results(&output_dir, &mut results, &dataset, &flags)?;

    let summary = RunSummary {
        output_dir: output_dir.clone(),
        model: model_name,
        method: method.clone(),
        noise: noise_name,
        n_voxels: dataset.n_voxels(),
        n_timepoints: dataset.n_timepoints(),
        n_parameters: model.n_params(),
        n_converged: results.n_converged(),
        n_failed: results.n_failed(),
        outer_iterations,
        aggregate_free_energy: results.aggregate_free_energy(),
        runtime_seconds: started.elapsed().as_secs_f64(),
        finished_at: chrono::Local::now().to_rfc3339(),
    };
    std::fs::write(
        output_dir.join("summary.json"),
        serde_json::to_string_pretty(&summary)?,
    )?;
    run_log.info(&format!(
        "Run finished: {}/{} voxels converged, {} failed, F = {:.4}",
        summary.n_converged, summary.n_voxels, summary.n_failed, summary.aggregate_free_energy
    ));
    run_log.write_to(&output_dir.join("logfile.txt"))?;

    println!(
        "Done: {} voxels, {} converged, {} failed -> {:?}",
        summary.n_voxels, summary.n_converged, summary.n_failed, summary.output_dir
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("fabber_run_{}_{}", tag, std::process::id()))
    }

    fn write_trivial_data(dir: &Path) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join("data.csv");
        let mut content = String::from("x,y,z,t0,t1,t2,t3,t4,t5,t6,t7,t8,t9\n");
        content.push_str("0,0,0,1,1,1,1,1,1,1,1,1,1\n");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_full_run_trivial_model() {
        let dir = temp_dir("full");
        std::fs::remove_dir_all(&dir).ok();
        let data = write_trivial_data(&dir);
        let out = dir.join("out");

        let mut options = RunOptions::new();
        options
            .parse_args(&[
                format!("--data={}", data.display()),
                format!("--output={}", out.display()),
                "--model=trivial".to_string(),
                "--save-free-energy".to_string(),
                "--save-mvn".to_string(),
            ])
            .unwrap();

        let summary = run(&options, &CancelToken::new()).unwrap();
        assert_eq!(summary.n_voxels, 1);
        assert_eq!(summary.n_failed, 0);
        assert!(out.join("mean_mean.csv").exists());
        assert!(out.join("freeEnergy.csv").exists());
        assert!(out.join("finalMVN.csv").exists());
        assert!(out.join("paramnames.txt").exists());
        assert!(out.join("logfile.txt").exists());
        assert!(out.join("summary.json").exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_option_rejected() {
        let dir = temp_dir("unknown");
        std::fs::remove_dir_all(&dir).ok();
        let data = write_trivial_data(&dir);

        let mut options = RunOptions::new();
        options
            .parse_args(&[
                format!("--data={}", data.display()),
                format!("--output={}", dir.join("out").display()),
                "--model=trivial".to_string(),
                "--no-such-option=1".to_string(),
            ])
            .unwrap();
        assert!(run(&options, &CancelToken::new()).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_spatial_prior_needs_spatial_method() {
        let dir = temp_dir("needspatial");
        std::fs::remove_dir_all(&dir).ok();
        let data = write_trivial_data(&dir);

        let mut options = RunOptions::new();
        options
            .parse_args(&[
                format!("--data={}", data.display()),
                format!("--output={}", dir.join("out").display()),
                "--model=trivial".to_string(),
                "--param-spatial-priors=M".to_string(),
            ])
            .unwrap();
        let err = run(&options, &CancelToken::new()).unwrap_err();
        assert!(err.to_string().contains("spatialvb"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
