use approx::assert_relative_eq;
use fabber::dist::DistParams;
use fabber::inference::{
    collect_results, initial_states, CancelToken, SpatialConfig, SpatialVbEstimator, VbConfig,
    VbEstimator,
};
use fabber::models::{LinearModel, PolynomialModel, TrivialModel};
use fabber::noise::{NoiseModel, NoisePosterior};
use fabber::options::RunOptions;
use fabber::priors::{ParamPrior, PriorKind};
use fabber::run;
use fabber::transforms::{get_transform, ParamTransform};
use fabber::{DataOrder, VoxelDataset};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use std::path::{Path, PathBuf};

fn white_noise() -> NoiseModel {
    NoiseModel::from_name("white", &RunOptions::new()).unwrap()
}

fn identity_transforms(n: usize) -> Vec<&'static dyn ParamTransform> {
    (0..n).map(|_| get_transform("I").unwrap()).collect()
}

fn normal_priors(dists: &[DistParams]) -> Vec<ParamPrior> {
    dists
        .iter()
        .map(|d| ParamPrior::new(PriorKind::Normal, *d))
        .collect()
}

fn single_voxel_dataset(values: &[f64]) -> VoxelDataset {
    let data = Array2::from_shape_vec((values.len(), 1), values.to_vec()).unwrap();
    VoxelDataset::new(vec![[0, 0, 0]], data).unwrap()
}

#[test]
fn test_trivial_model_unit_data() {
    // One voxel of constant ones: the posterior mean must be 1.0 and the
    // variance must match 1/(T * E[phi]).
    let model = TrivialModel::new();
    let noise = white_noise();
    let transforms = identity_transforms(1);
    let config = VbConfig {
        max_iterations: 25,
        ..VbConfig::default()
    };
    let estimator = VbEstimator::new(&model, &noise, &transforms, &config);

    let dataset = single_voxel_dataset(&[1.0; 10]);
    let priors = normal_priors(&[DistParams::new(0.0, 1e6)]);
    let mut states = initial_states(&noise, &[DistParams::new(0.0, 1e6)], 1);

    estimator
        .fit_all(&dataset, &priors, &mut states, &CancelToken::new())
        .unwrap();

    let state = &mut states[0];
    assert!(state.converged);
    assert_relative_eq!(state.posterior.mean()[0], 1.0, epsilon = 1e-8);

    let e_phi = noise.expected_precision(&state.noise).unwrap();
    let variance = state.posterior.covariance().unwrap()[(0, 0)];
    assert_relative_eq!(variance, 1.0 / (10.0 * e_phi), max_relative = 1e-4);
}

#[test]
fn test_polynomial_recovery() {
    // y = 3 + 2t - t^2 exactly; the posterior must recover the coefficients
    // and converge well inside 25 iterations.
    let model = PolynomialModel::new(2);
    let noise = white_noise();
    let transforms = identity_transforms(3);
    let config = VbConfig {
        max_iterations: 25,
        ..VbConfig::default()
    };
    let estimator = VbEstimator::new(&model, &noise, &transforms, &config);

    let values: Vec<f64> = (1..=10)
        .map(|t| {
            let t = t as f64;
            3.0 + 2.0 * t - t * t
        })
        .collect();
    let dataset = single_voxel_dataset(&values);
    let priors = normal_priors(&[DistParams::new(0.0, 1e6); 3]);
    let mut states = initial_states(&noise, &[DistParams::new(0.0, 1e6); 3], 1);

    estimator
        .fit_all(&dataset, &priors, &mut states, &CancelToken::new())
        .unwrap();

    let state = &states[0];
    assert!(state.converged);
    assert!(state.iterations <= 25);
    assert_relative_eq!(state.posterior.mean()[0], 3.0, epsilon = 1e-4);
    assert_relative_eq!(state.posterior.mean()[1], 2.0, epsilon = 1e-4);
    assert_relative_eq!(state.posterior.mean()[2], -1.0, epsilon = 1e-4);
}

#[test]
fn test_spatial_two_voxels_identical_data() {
    // Linear model, two voxels with identical data, spatial-M prior on all
    // parameters: symmetry forces identical posteriors.
    let model = LinearModel::new();
    let noise = white_noise();
    let transforms = identity_transforms(2);
    let config = SpatialConfig {
        spatial_dims: 1,
        fixed_rho: 1.0,
        max_outer_iterations: 5,
        ..SpatialConfig::default()
    };
    let estimator = SpatialVbEstimator::new(&model, &noise, &transforms, &config);

    let per_voxel: Vec<f64> = (1..=8).map(|t| 1.0 + 0.5 * t as f64).collect();
    let mut data = Array2::zeros((8, 2));
    for v in 0..2 {
        for t in 0..8 {
            data[(t, v)] = per_voxel[t];
        }
    }
    let dataset = VoxelDataset::new(vec![[0, 0, 0], [1, 0, 0]], data).unwrap();

    let mut priors = vec![
        ParamPrior::new(PriorKind::SpatialM, DistParams::new(0.0, 1e6)),
        ParamPrior::new(PriorKind::SpatialM, DistParams::new(0.0, 1e6)),
    ];
    let mut states = initial_states(&noise, &[DistParams::new(0.0, 1e6); 2], 2);

    estimator
        .fit(&dataset, &mut priors, &mut states, &CancelToken::new())
        .unwrap();

    for i in 0..2 {
        assert_relative_eq!(
            states[0].posterior.mean()[i],
            states[1].posterior.mean()[i],
            epsilon = 1e-10
        );
    }
    assert_relative_eq!(states[0].posterior.mean()[0], 1.0, epsilon = 0.05);
    assert_relative_eq!(states[0].posterior.mean()[1], 0.5, epsilon = 0.05);
}

#[test]
fn test_white_and_ar1_agree_on_white_data() {
    // Constant signal of amplitude 1 plus white noise of sd 0.5: both noise
    // models must localise the amplitude, and the AR(1) coefficient must stay
    // near zero because the residual carries no autocorrelation.
    let mut rng = ChaCha8Rng::seed_from_u64(21);
    let values: Vec<f64> = (0..100)
        .map(|_| 1.0 + 0.5 * rng.sample::<f64, _>(StandardNormal))
        .collect();
    let dataset = single_voxel_dataset(&values);

    let model = TrivialModel::new();
    let transforms = identity_transforms(1);
    let priors = normal_priors(&[DistParams::new(0.0, 1e6)]);
    let config = VbConfig {
        max_iterations: 50,
        ..VbConfig::default()
    };

    for noise_name in ["white", "ar1"] {
        let noise = NoiseModel::from_name(noise_name, &RunOptions::new()).unwrap();
        let estimator = VbEstimator::new(&model, &noise, &transforms, &config);
        let mut states = initial_states(&noise, &[DistParams::new(0.0, 1e6)], 1);
        estimator
            .fit_all(&dataset, &priors, &mut states, &CancelToken::new())
            .unwrap();

        let state = &mut states[0];
        let mean = state.posterior.mean()[0];
        let sd = state.posterior.covariance().unwrap()[(0, 0)].sqrt();
        assert!(
            (mean - 1.0).abs() < 3.0 * sd.max(0.05),
            "{}: amplitude {} +- {} too far from 1.0",
            noise_name,
            mean,
            sd
        );

        if let NoisePosterior::Ar1(post) = &state.noise {
            assert!(
                post.alpha_mean.abs() < 0.2,
                "AR(1) alpha {} not near zero",
                post.alpha_mean
            );
        }
    }
}

#[test]
fn test_log_transform_recovers_positive_parameter() {
    // True value 2.5 under a log transform with a vague fabber-space prior
    // N(0, 4); the model-space posterior mean must land within 5%.
    let mut rng = ChaCha8Rng::seed_from_u64(33);
    let values: Vec<f64> = (0..50)
        .map(|_| 2.5 + 0.05 * rng.sample::<f64, _>(StandardNormal))
        .collect();
    let dataset = single_voxel_dataset(&values);

    let model = TrivialModel::new();
    let noise = white_noise();
    let transforms: Vec<&'static dyn ParamTransform> = vec![get_transform("L").unwrap()];
    let priors = normal_priors(&[DistParams::new(0.0, 4.0)]);
    let config = VbConfig {
        max_iterations: 50,
        ..VbConfig::default()
    };
    let estimator = VbEstimator::new(&model, &noise, &transforms, &config);

    // Start the posterior at the fabber-space prior rather than the model's
    // hard-coded identity-space distributions.
    let mut states = initial_states(&noise, &[DistParams::new(0.0, 4.0)], 1);

    estimator
        .fit_all(&dataset, &priors, &mut states, &CancelToken::new())
        .unwrap();

    let results = collect_results(&model, &noise, &transforms, &dataset, &mut states, 1).unwrap();
    assert_relative_eq!(results.means[(0, 0)], 2.5, max_relative = 0.05);
}

#[test]
fn test_interleave_order_independence() {
    // Swapping the input files permutes the timepoints correspondingly and
    // leaves parameter estimates unchanged.
    let dir = std::env::temp_dir().join(format!("fabber_it_interleave_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let a = dir.join("a.csv");
    let b = dir.join("b.csv");
    std::fs::write(&a, "x,y,z,t0,t1\n0,0,0,1.0,1.2\n").unwrap();
    std::fs::write(&b, "x,y,z,t0,t1\n0,0,0,0.8,1.1\n").unwrap();

    let ab = VoxelDataset::from_csv_multi(&[&a, &b], DataOrder::Interleave).unwrap();
    let ba = VoxelDataset::from_csv_multi(&[&b, &a], DataOrder::Interleave).unwrap();
    assert_eq!(ab.timeseries(0).as_slice(), &[1.0, 0.8, 1.2, 1.1]);
    assert_eq!(ba.timeseries(0).as_slice(), &[0.8, 1.0, 1.1, 1.2]);

    let model = TrivialModel::new();
    let noise = white_noise();
    let transforms = identity_transforms(1);
    let priors = normal_priors(&[DistParams::new(0.0, 1e6)]);
    let config = VbConfig::default();
    let estimator = VbEstimator::new(&model, &noise, &transforms, &config);

    let mut fitted = Vec::new();
    for dataset in [&ab, &ba] {
        let mut states = initial_states(&noise, &[DistParams::new(0.0, 1e6)], 1);
        estimator
            .fit_all(dataset, &priors, &mut states, &CancelToken::new())
            .unwrap();
        fitted.push(states[0].posterior.mean()[0]);
    }
    assert_relative_eq!(fitted[0], fitted[1], epsilon = 1e-10);

    std::fs::remove_dir_all(&dir).ok();
}

fn write_run_data(dir: &Path) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join("data.csv");
    let mut content = String::from("x,y,z,t0,t1,t2,t3,t4,t5\n");
    content.push_str("0,0,0,2.0,2.1,1.9,2.0,2.05,1.95\n");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_output_directory_conflicts_get_suffixed() {
    let dir = std::env::temp_dir().join(format!("fabber_it_outdir_{}", std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    let data = write_run_data(&dir);
    let out = dir.join("foo");

    let mut options = RunOptions::new();
    options
        .parse_args(&[
            format!("--data={}", data.display()),
            format!("--output={}", out.display()),
            "--model=trivial".to_string(),
        ])
        .unwrap();

    let first = run::run(&options, &CancelToken::new()).unwrap();
    let second = run::run(&options, &CancelToken::new()).unwrap();
    let third = run::run(&options, &CancelToken::new()).unwrap();

    assert_eq!(first.output_dir, out);
    assert_eq!(second.output_dir, dir.join("foo+"));
    assert_eq!(third.output_dir, dir.join("foo++"));
    assert!(dir.join("foo++").join("mean_mean.csv").exists());

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_full_spatialvb_run_via_options() {
    let dir = std::env::temp_dir().join(format!("fabber_it_spatial_{}", std::process::id()));
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(&dir).unwrap();
    let data = dir.join("data.csv");
    let mut content = String::from("x,y,z,t0,t1,t2,t3\n");
    content.push_str("0,0,0,1.0,1.1,0.9,1.0\n");
    content.push_str("1,0,0,1.1,1.0,1.0,0.9\n");
    content.push_str("2,0,0,0.9,1.0,1.1,1.0\n");
    std::fs::write(&data, content).unwrap();

    let mut options = RunOptions::new();
    options
        .parse_args(&[
            format!("--data={}", data.display()),
            format!("--output={}", dir.join("out").display()),
            "--model=trivial".to_string(),
            "--method=spatialvb".to_string(),
            "--param-spatial-priors=M".to_string(),
            "--spatial-dims=1".to_string(),
            "--max-iterations=4".to_string(),
            "--save-zstat".to_string(),
        ])
        .unwrap();

    let summary = run::run(&options, &CancelToken::new()).unwrap();
    assert_eq!(summary.n_voxels, 3);
    assert_eq!(summary.n_failed, 0);
    assert!(dir.join("out").join("zstat_mean.csv").exists());

    std::fs::remove_dir_all(&dir).ok();
}
