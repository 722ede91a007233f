use approx::assert_abs_diff_eq;
use ndarray::{concatenate, Array1, Array2, Axis};
use partial_bnn_core::model::ProbabilisticModel;
use partial_bnn_core::train::TrainConfig;
use partial_bnn_core::{
    Activation, BnnError, BnnModel, Boundary, ChainMethod, Device, FitConfig, HeteroskedasticModel, MultiTaskModel,
    Network, PartialBnnModel, PartialDklModel, Regressor, RngKey,
};
use std::io::Write;

fn quick(num_chains: usize, method: ChainMethod) -> FitConfig {
    FitConfig {
        num_warmup: 150,
        num_samples: 60,
        num_chains,
        chain_method: method,
        progress_bar: false,
        max_tree_depth: 6,
        ..FitConfig::default()
    }
}

fn line(n: usize) -> (Array2<f64>, Array1<f64>) {
    let x = Array2::from_shape_fn((n, 1), |(i, _)| 2.0 * i as f64 / (n - 1) as f64 - 1.0);
    // Deterministic jitter keeps the noise scale away from zero.
    let y = Array1::from_shape_fn(n, |i| 2.0 * x[[i, 0]] + 0.05 * ((i * 7919) % 13) as f64 / 13.0 - 0.025);
    (x, y)
}

#[test]
fn bnn_recovers_a_linear_trend() {
    let (x, y) = line(24);
    let mut reg = Regressor::new(BnnModel::new(1, &[6], 1, Activation::Tanh).unwrap());
    reg.fit(x.view(), y.view(), &quick(1, ChainMethod::Sequential), RngKey::new(11))
        .unwrap();
    let pred = reg.predict(x.view(), 4, Device::Default, RngKey::new(12)).unwrap();
    let mae = (&pred.mean.column(0) - &y).mapv(f64::abs).mean().unwrap();
    assert!(mae < 0.35, "mean absolute error {mae}");
    assert!(pred.variance.iter().all(|&v| v >= 0.0 && v.is_finite()));
}

#[test]
fn chain_methods_give_identical_posteriors() {
    let (x, y) = line(10);
    let fit = |method| {
        let mut reg = Regressor::new(BnnModel::new(1, &[3], 1, Activation::Tanh).unwrap());
        let config = FitConfig {
            num_warmup: 40,
            num_samples: 15,
            ..quick(3, method)
        };
        reg.fit(x.view(), y.view(), &config, RngKey::new(5)).unwrap();
        reg.get_samples(true).unwrap()
    };
    let sequential = fit(ChainMethod::Sequential);
    assert_eq!(sequential, fit(ChainMethod::Vectorized));
    assert_eq!(sequential, fit(ChainMethod::Parallel));
}

#[test]
fn batched_prediction_matches_full_prediction() {
    let (x, y) = line(12);
    let mut reg = Regressor::new(BnnModel::new(1, &[4], 1, Activation::Tanh).unwrap());
    let config = FitConfig {
        num_warmup: 50,
        num_samples: 23,
        ..quick(2, ChainMethod::Parallel)
    };
    reg.fit(x.view(), y.view(), &config, RngKey::new(3)).unwrap();
    let key = RngKey::new(4);
    let full = reg.predict(x.view(), 3, Device::Default, key).unwrap();
    let batched = reg.predict_in_batches(x.view(), 7, 3, Device::Cpu { threads: Some(2) }, key).unwrap();
    for (a, b) in full.mean.iter().zip(batched.mean.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-9);
    }
    for (a, b) in full.variance.iter().zip(batched.variance.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-9);
    }
}

#[test]
fn predicting_with_a_subset_of_samples() {
    let (x, y) = line(10);
    let mut reg = Regressor::new(BnnModel::new(1, &[3], 1, Activation::Tanh).unwrap());
    let config = FitConfig {
        num_warmup: 40,
        num_samples: 20,
        ..quick(1, ChainMethod::Sequential)
    };
    reg.fit(x.view(), y.view(), &config, RngKey::new(8)).unwrap();
    let subset = reg.get_samples(false).unwrap().slice(0, 5).unwrap();
    let draws = reg
        .sample_from_posterior(x.view(), 1, Device::Default, RngKey::new(9))
        .unwrap();
    assert_eq!(draws.shape(), &[20, 10, 1]);
    let pred = reg
        .predict_with_samples(&subset, x.view(), 1, Device::Default, RngKey::new(9))
        .unwrap();
    // Sample keys depend on the global index, so the subset reuses the first draws.
    let expected = draws.slice(ndarray::s![..5, .., ..]).var_axis(Axis(0), 0.0);
    for (a, b) in pred.variance.iter().zip(expected.iter()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }
}

#[test]
fn partial_bnn_samples_only_the_stochastic_suffix() {
    let (x, y) = line(12);
    let network = Network::mlp(1, &[5, 4], 1, Activation::Tanh);
    let pretrained = network.init_params(RngKey::new(0)).unwrap();
    let model = PartialBnnModel::new(network, Some(pretrained.clone()), Boundary::Count(1))
        .unwrap()
        .with_pretrained_priors(1.0);
    let frozen_before = model.partial().unwrap().frozen.apply(x.view()).unwrap();

    let mut reg = Regressor::new(model);
    let config = FitConfig {
        num_warmup: 40,
        num_samples: 10,
        ..quick(1, ChainMethod::Sequential)
    };
    reg.fit(x.view(), y.view(), &config, RngKey::new(1)).unwrap();
    let samples = reg.get_samples(false).unwrap();
    let names: Vec<&str> = samples.site_names().collect();
    assert_eq!(names, vec!["Dense2.bias", "Dense2.kernel", "sig"]);

    let partial = reg.model().partial().unwrap();
    assert_eq!(partial.frozen.apply(x.view()).unwrap(), frozen_before);
    assert_eq!(partial.frozen.params()["Dense0.kernel"], pretrained["Dense0.kernel"]);
    assert_eq!(partial.pretrained["Dense2.kernel"], pretrained["Dense2.kernel"]);
}

#[test]
fn partial_bnn_pretrains_when_weights_are_missing() {
    let (x, y) = line(16);
    let network = Network::mlp(1, &[6], 1, Activation::Tanh);
    let model = PartialBnnModel::new(network, None, Boundary::Count(1))
        .unwrap()
        .with_train_config(TrainConfig {
            epochs: 60,
            ..TrainConfig::default()
        });
    assert!(matches!(model.partial(), Err(BnnError::NotFitted)));
    let mut reg = Regressor::new(model);
    let config = FitConfig {
        num_warmup: 40,
        num_samples: 10,
        ..quick(1, ChainMethod::Sequential)
    };
    reg.fit(x.view(), y.view(), &config, RngKey::new(2)).unwrap();
    assert!(reg.model().partial().is_ok());
    let pred = reg.predict(x.view(), 1, Device::Default, RngKey::new(3)).unwrap();
    assert_eq!(pred.mean.dim(), (16, 1));
}

#[test]
fn heteroskedastic_fit_reports_positive_noise() {
    let (x, y) = line(14);
    let mut reg = Regressor::new(HeteroskedasticModel::new(1, &[4], 1, Activation::Tanh).unwrap());
    let config = FitConfig {
        num_warmup: 60,
        num_samples: 20,
        ..quick(1, ChainMethod::Sequential)
    };
    reg.fit(x.view(), y.view(), &config, RngKey::new(6)).unwrap();
    let samples = reg.get_samples(false).unwrap();
    assert!(samples.get("VarianceHead.kernel").is_ok());
    assert!(matches!(samples.get("sig"), Err(BnnError::UnknownSite(_))));
    let pred = reg.predict(x.view(), 2, Device::Default, RngKey::new(7)).unwrap();
    assert!(pred.variance.iter().all(|&v| v >= 0.0));
}

#[test]
fn heteroskedastic_variance_follows_the_noise_level() {
    // Quiet on the left half, noisy on the right half.
    let n = 40;
    let x = Array2::from_shape_fn((n, 1), |(i, _)| 2.0 * i as f64 / (n - 1) as f64 - 1.0);
    let y = Array1::from_shape_fn(n, |i| {
        let wobble = ((i as f64 * 12.9898).sin() * 43_758.545_3).fract();
        let scale = if x[[i, 0]] < 0.0 { 0.02 } else { 0.6 };
        0.5 * x[[i, 0]] + scale * wobble
    });
    let mut reg = Regressor::new(HeteroskedasticModel::new(1, &[6], 1, Activation::Tanh).unwrap());
    let config = FitConfig {
        num_warmup: 200,
        num_samples: 80,
        ..quick(1, ChainMethod::Sequential)
    };
    reg.fit(x.view(), y.view(), &config, RngKey::new(21)).unwrap();

    let grid = ndarray::array![[-0.9], [-0.7], [-0.5], [0.5], [0.7], [0.9]];
    let pred = reg.predict(grid.view(), 4, Device::Default, RngKey::new(22)).unwrap();
    let quiet = pred.variance.slice(ndarray::s![..3, 0]).mean().unwrap();
    let noisy = pred.variance.slice(ndarray::s![3.., 0]).mean().unwrap();
    assert!(quiet < noisy, "quiet {quiet} noisy {noisy}");
}

#[test]
fn more_data_shrinks_predictive_variance() {
    let config = FitConfig {
        num_warmup: 200,
        num_samples: 80,
        ..quick(1, ChainMethod::Sequential)
    };
    let grid = Array2::from_shape_fn((9, 1), |(i, _)| -0.8 + 0.2 * i as f64);
    let mean_variance = |n: usize| {
        let (x, y) = line(n);
        let mut reg = Regressor::new(BnnModel::new(1, &[4], 1, Activation::Tanh).unwrap());
        reg.fit(x.view(), y.view(), &config, RngKey::new(31)).unwrap();
        let pred = reg.predict(grid.view(), 4, Device::Default, RngKey::new(32)).unwrap();
        pred.variance.mean().unwrap()
    };
    let sparse = mean_variance(5);
    let dense = mean_variance(60);
    assert!(dense < sparse, "dense {dense} sparse {sparse}");
}

#[test]
fn multitask_rejects_tasks_unseen_at_fit() {
    let (x, y) = line(12);
    let tasks = Array2::from_shape_fn((12, 1), |(i, _)| (i % 2) as f64);
    let xt = concatenate(Axis(1), &[x.view(), tasks.view()]).unwrap();
    let mut reg = Regressor::new(MultiTaskModel::new(1, 1, 3, 2, &[4], Activation::Tanh).unwrap());
    let config = FitConfig {
        num_warmup: 40,
        num_samples: 10,
        ..quick(1, ChainMethod::Sequential)
    };
    reg.fit(xt.view(), y.view(), &config, RngKey::new(4)).unwrap();
    assert_eq!(reg.get_samples(false).unwrap().get("sig").unwrap().shape(), &[10, 3]);

    let seen = ndarray::array![[0.2, 1.0], [-0.4, 0.0]];
    assert!(reg.predict(seen.view(), 1, Device::Default, RngKey::new(0)).is_ok());
    let unseen = ndarray::array![[0.2, 1.0], [-0.4, 2.0]];
    match reg.predict(unseen.view(), 1, Device::Default, RngKey::new(0)) {
        Err(BnnError::UnseenTask { task, .. }) => assert_eq!(task, 2),
        other => panic!("expected UnseenTask, got {other:?}"),
    }
}

#[test]
fn partial_dkl_fit_and_predict() {
    let (x, y) = line(10);
    let network = Network::mlp(1, &[5, 4], 1, Activation::Tanh);
    let pretrained = network.init_params(RngKey::new(1)).unwrap();
    let model = PartialDklModel::new(network, Some(pretrained), Boundary::Count(1), 2).unwrap();
    assert_eq!(model.input_dim(), 1);
    let mut reg = Regressor::new(model);
    let config = FitConfig {
        num_warmup: 40,
        num_samples: 10,
        ..quick(1, ChainMethod::Sequential)
    };
    reg.fit(x.view(), y.view(), &config, RngKey::new(2)).unwrap();
    let samples = reg.get_samples(false).unwrap();
    assert_eq!(samples.get("k_length").unwrap().shape(), &[10, 2]);
    let pred = reg.predict(x.view(), 2, Device::Default, RngKey::new(3)).unwrap();
    assert_eq!(pred.mean.dim(), (10, 1));
    assert!(pred.variance.iter().all(|&v| v >= 0.0 && v.is_finite()));
}

#[test]
fn fit_from_a_toml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "num_warmup = 30\nnum_samples = 12\nnum_chains = 2\nchain_method = \"vectorized\"\nprogress_bar = false\nextra_fields = [\"accept_prob\", \"num_steps\"]"
    )
    .unwrap();
    let config = FitConfig::from_path(file.path()).unwrap();
    let (x, y) = line(8);
    let mut reg = Regressor::new(BnnModel::new(1, &[3], 1, Activation::Tanh).unwrap());
    reg.fit(x.view(), y.view(), &config, RngKey::new(0)).unwrap();
    let extra = reg.get_extra_fields(false).unwrap();
    assert_eq!(extra["accept_prob"].shape(), &[24]);
    assert!(extra["num_steps"].iter().all(|&n| n >= 1.0));
    assert!(reg.summary().unwrap().to_table().contains("Dense1.bias[0]"));
}
