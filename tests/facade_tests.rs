use candle_core::{Device, Tensor};
use gradient_probe::{
    get_flattened_weight_vector, get_gradients, model::{CausalLm, ModelConfig}, Batch,
};

fn tiny_batch() -> Batch {
    let device = Device::Cpu;
    let ids = Tensor::from_vec(vec![1i64, 4, 2, 7, 3, 5], (2, 3), &device).unwrap();
    let mask = Tensor::ones((2, 3), candle_core::DType::U32, &device).unwrap();
    Batch::from_parts(ids.clone(), ids, mask)
}

#[test]
fn flattened_snapshot_covers_every_parameter() {
    let config = ModelConfig {
        vocab_size: 8,
        block_size: 4,
        n_embd: 8,
        n_head: 2,
        n_layer: 1,
        ..ModelConfig::default()
    };
    let mut model = CausalLm::new(config, &Device::Cpu).unwrap();

    let grads = get_gradients(&mut model, &tiny_batch(), &Device::Cpu).unwrap();
    let flat = get_flattened_weight_vector(&grads).unwrap();

    assert_eq!(grads.len(), model.parameter_names().len());
    assert_eq!(flat.dims1().unwrap(), model.parameter_count());
}

#[test]
fn forced_cpu_is_honoured() {
    std::env::set_var("CANDLE_FORCE_CPU", "1");
    let device = gradient_probe::setup_device().unwrap();
    assert!(device.is_cpu());
}
