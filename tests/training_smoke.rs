//! End-to-end checks of the two-objective training loop on the toy system.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use pissm_rs::dataset::DataSplits;
use pissm_rs::losses;
use pissm_rs::model::Prediction;
use pissm_rs::optimizer::OptimizerConfig;
use pissm_rs::{PissmConfig, PissmModel, Trainer};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn small_config() -> PissmConfig {
    let mut config = PissmConfig::toy_linear_preset();
    config.system.horizon = 8;
    config.data.train_size = 8;
    config.data.valid_size = 4;
    config.data.test_size = 2;
    config.training.epochs = 1;
    config.training.batch_size = 4;
    config.training.validation_interval = 1;
    config
}

fn snapshot(varmap: &VarMap) -> BTreeMap<String, Vec<f32>> {
    let data = varmap.data().lock().unwrap();
    data.iter()
        .map(|(name, var)| {
            let values = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            (name.clone(), values)
        })
        .collect()
}

fn changed(before: &BTreeMap<String, Vec<f32>>, after: &BTreeMap<String, Vec<f32>>) -> bool {
    before.iter().any(|(name, values)| after[name] != *values)
}

fn toy_batch(config: &PissmConfig) -> (Tensor, Tensor, Tensor) {
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let splits = DataSplits::simulate(config, &mut rng).unwrap();
    let batch = splits.train.batch(0, 4).unwrap();
    let valid = Tensor::ones((4, config.system.horizon, 1), DType::F32, &Device::Cpu).unwrap();
    (batch.observations, batch.targets, valid)
}

#[test]
fn test_parameter_groups_are_disjoint() {
    let config = small_config();
    let model = PissmModel::dense(&config.model, &Device::Cpu, 0).unwrap();

    let coefficient = snapshot(model.coefficient_vars());
    let base = snapshot(model.base_vars());
    assert!(!coefficient.is_empty());
    assert!(!base.is_empty());
    assert!(coefficient.keys().all(|k| !base.contains_key(k)));
}

#[test]
fn test_reinforce_step_only_moves_coefficient_group() {
    let config = small_config();
    let mut model = PissmModel::dense(&config.model, &Device::Cpu, 0).unwrap();
    let (obs, targets, valid) = toy_batch(&config);

    let base_before = snapshot(model.base_vars());
    let coefficient_before = snapshot(model.coefficient_vars());

    let mut optimizer = OptimizerConfig::default()
        .build(model.coefficient_vars())
        .unwrap();
    let output = model.forward(&obs, Some(&valid)).unwrap();
    let Prediction::Gaussian { mean, var } = &output.prediction else {
        panic!("expected a Gaussian prediction");
    };
    let loss = losses::reinforce_gaussian(&targets, mean, var, &output.logp).unwrap();
    optimizer.backward_step(&loss).unwrap();

    assert_eq!(snapshot(model.base_vars()), base_before);
    assert!(changed(&coefficient_before, &snapshot(model.coefficient_vars())));
}

#[test]
fn test_likelihood_step_only_moves_base_group() {
    let config = small_config();
    let mut model = PissmModel::dense(&config.model, &Device::Cpu, 0).unwrap();
    let (obs, targets, valid) = toy_batch(&config);

    let base_before = snapshot(model.base_vars());
    let coefficient_before = snapshot(model.coefficient_vars());

    let mut optimizer = OptimizerConfig::default().build(model.base_vars()).unwrap();
    let output = model.forward(&obs, Some(&valid)).unwrap();
    let Prediction::Gaussian { mean, var } = &output.prediction else {
        panic!("expected a Gaussian prediction");
    };
    let loss = losses::gaussian_nll(&targets, mean, var).unwrap();
    optimizer.backward_step(&loss).unwrap();

    assert_eq!(snapshot(model.coefficient_vars()), coefficient_before);
    assert!(changed(&base_before, &snapshot(model.base_vars())));
}

#[test]
fn test_all_invalid_posterior_equals_prior() {
    let config = small_config();
    let mut model = PissmModel::dense(&config.model, &Device::Cpu, 0).unwrap();
    let (obs, _, _) = toy_batch(&config);
    let invalid = Tensor::zeros((4, config.system.horizon, 1), DType::F32, &Device::Cpu).unwrap();

    let output = model.forward(&obs, Some(&invalid)).unwrap();
    let beliefs = &output.beliefs;
    let post = beliefs.post_mean.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let prior = beliefs.prior_mean.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    for (a, b) in post.iter().zip(&prior) {
        assert!((a - b).abs() < 1e-5);
    }
    let post = beliefs.post_covar.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let prior = beliefs.prior_covar.flatten_all().unwrap().to_vec1::<f32>().unwrap();
    for (a, b) in post.iter().zip(&prior) {
        assert!((a - b).abs() < 1e-5);
    }
}

#[test]
fn test_short_training_run_and_checkpoint_roundtrip() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let mut config = small_config();
    config.output_dir = temp_dir.path().join("run").to_string_lossy().into_owned();

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let splits = DataSplits::simulate(&config, &mut rng).unwrap();

    let mut model = PissmModel::dense(&config.model, &Device::Cpu, config.seed).unwrap();
    let mut trainer = Trainer::from_config(&config, &model).unwrap();
    let history = trainer
        .train(&mut model, &splits.train, Some(&splits.validation))
        .unwrap();

    assert_eq!(trainer.step(), 2);
    assert!(!history.is_empty());
    assert!(history.iter().all(|l| l.is_finite()));

    let checkpoint = temp_dir.path().join("checkpoint");
    trainer.save_checkpoint(&model, &checkpoint).unwrap();

    let mut restored = PissmModel::dense(&config.model, &Device::Cpu, 1).unwrap();
    let mut fresh = Trainer::from_config(&config, &restored).unwrap();
    fresh.load_checkpoint(&mut restored, &checkpoint).unwrap();
    assert_eq!(fresh.step(), 2);
    assert_eq!(snapshot(restored.base_vars()), snapshot(model.base_vars()));

    let rmses = fresh.test(&mut restored, &splits.test).unwrap();
    assert_eq!(rmses.len(), 2);
    assert!(rmses.iter().all(|r| r.is_finite() && *r >= 0.0));
}
