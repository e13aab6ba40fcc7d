use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use woqpak::codec::NF4;
use woqpak::{
    quant_weight, rtn_quantize, DataType, FloatBundle, FloatTensor, Layer, LayerHost, Linear,
    Matrix, Model, ModelArtifact, PackOptions, RtnConfig, ScaleDtype, Scheme,
};

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Matrix<f32> {
    Matrix::from_fn(rows, cols, |_, _| rng.gen_range(-1.0f32..1.0))
}

fn single_layer(weight: Matrix<f32>, bias: Option<Vec<f32>>) -> Model {
    let mut model = Model::new();
    model.insert_linear("fc", Linear::new(weight, bias).unwrap());
    model
}

fn packed(model: &Model, name: &str) -> woqpak::WeightOnlyLinear {
    match model.layer(name) {
        Some(Layer::WeightOnly(l)) => l.clone(),
        other => panic!("{} is not packed: {:?}", name, other),
    }
}

#[test]
fn asym_4bit_recovers_within_half_a_step() {
    let mut rng = StdRng::seed_from_u64(42);
    let weight = random_matrix(&mut rng, 4, 8);
    let mut model = single_layer(weight.clone(), None);
    let config = RtnConfig {
        num_bits: 4,
        group_size: 8,
        scheme: Scheme::Asym,
        return_int: true,
        ..Default::default()
    };
    rtn_quantize(&mut model, &config).unwrap();

    let layer = packed(&model, "fc");
    assert_eq!(layer.n_pack(), 8);
    assert_eq!(layer.packed_weight().shape(), [4, 1]);
    assert_eq!(layer.scale().shape(), [4, 1]);
    let q = layer.unpack_weight();
    assert!(
        q.as_slice().iter().all(|v| (0..=15).contains(v)),
        "codes outside [0, 15]: {:?}",
        q
    );
    let zp = layer.unpack_zero_point().unwrap();
    assert!(zp.as_slice().iter().all(|v| (0..=15).contains(v)));
    let recovered = layer.recover();
    for r in 0..4 {
        let half_step = layer.scale().get(r, 0).abs() / 2.0;
        for c in 0..8 {
            let err = (recovered.get(r, c) - weight.get(r, c)).abs();
            assert!(
                err <= half_step * (1.0 + 1e-4) + 1e-6,
                "row {} col {}: error {} exceeds {}",
                r,
                c,
                err,
                half_step
            );
        }
    }
}

#[test]
fn packed_and_fake_quantized_paths_agree() {
    let mut rng = StdRng::seed_from_u64(7);
    let weight = random_matrix(&mut rng, 12, 70);
    let bias: Vec<f32> = (0..12).map(|i| i as f32 * 0.25).collect();

    let cases = [
        (4, 32, Scheme::Asym, false, DataType::Int, 32, 1),
        (4, 32, Scheme::Sym, false, DataType::Int, 8, 0),
        (2, 16, Scheme::Asym, false, DataType::Int, 16, 1),
        (8, -1, Scheme::Sym, false, DataType::Int, 64, 0),
        (3, 32, Scheme::Asym, false, DataType::Int, 32, 1),
        (4, 32, Scheme::Sym, true, DataType::Int, 16, 1),
        (8, 32, Scheme::Sym, true, DataType::Int, 32, 0),
        (4, 32, Scheme::Sym, false, DataType::Nf4, 32, 1),
        (4, 64, Scheme::Sym, false, DataType::Fp4Bnb, 16, 1),
        (4, 64, Scheme::Sym, false, DataType::Fp4E2m1, 64, 0),
    ];
    for (num_bits, group_size, scheme, full_range, data_type, storage_bits, compression_dim) in
        cases
    {
        let base = RtnConfig {
            num_bits,
            group_size,
            scheme,
            full_range,
            data_type,
            pack: PackOptions {
                storage_bits,
                compression_dim,
                scale_dtype: ScaleDtype::F32,
            },
            ..Default::default()
        };

        let mut fake = single_layer(weight.clone(), Some(bias.clone()));
        rtn_quantize(&mut fake, &base).unwrap();

        let mut int = single_layer(weight.clone(), Some(bias.clone()));
        rtn_quantize(
            &mut int,
            &RtnConfig {
                return_int: true,
                ..base.clone()
            },
        )
        .unwrap();

        assert_eq!(
            fake.to_bundle(),
            int.to_bundle(),
            "bits={} group={} {} full={} {} width={} dim={}",
            num_bits,
            group_size,
            scheme,
            full_range,
            data_type,
            storage_bits,
            compression_dim
        );
    }
}

#[test]
fn remainder_group_survives_packing() {
    let mut rng = StdRng::seed_from_u64(3);
    let weight = random_matrix(&mut rng, 5, 33);
    let mut model = single_layer(weight.clone(), None);
    let config = RtnConfig {
        group_size: 32,
        return_int: true,
        ..Default::default()
    };
    rtn_quantize(&mut model, &config).unwrap();

    let layer = packed(&model, "fc");
    assert_eq!(layer.scale().shape(), [5, 2]);
    let recovered = layer.recover();
    assert_eq!(recovered.shape(), [5, 33]);
    assert_eq!(recovered, quant_weight(&weight, &config.params_for("fc")).unwrap());
}

#[test]
fn nf4_recovers_scaled_levels() {
    let mut rng = StdRng::seed_from_u64(11);
    let weight = random_matrix(&mut rng, 3, 64);
    let mut model = single_layer(weight, None);
    let config = RtnConfig {
        data_type: DataType::Nf4,
        group_size: 64,
        return_int: true,
        ..Default::default()
    };
    rtn_quantize(&mut model, &config).unwrap();

    let layer = packed(&model, "fc");
    assert!(layer.packed_zero_point().is_none());
    let recovered = layer.recover();
    for r in 0..3 {
        let scale = layer.scale().get(r, 0);
        for &v in recovered.row(r) {
            assert!(
                NF4.levels.iter().any(|&l| l * scale == v),
                "{} is not an NF4 level times {}",
                v,
                scale
            );
        }
    }
}

#[test]
fn artifact_round_trip_preserves_forward() {
    let mut rng = StdRng::seed_from_u64(5);
    let bundle = FloatBundle {
        tensors: vec![
            FloatTensor::from_matrix("block.0.fc1.weight", &random_matrix(&mut rng, 16, 48)),
            FloatTensor {
                name: "block.0.fc1.bias".to_string(),
                shape: vec![16],
                data: (0..16).map(|_| rng.gen_range(-0.1f32..0.1)).collect(),
            },
            FloatTensor::from_matrix("block.0.fc2.weight", &random_matrix(&mut rng, 8, 16)),
            FloatTensor {
                name: "block.0.ln.weight".to_string(),
                shape: vec![48],
                data: vec![1.0; 48],
            },
        ],
    };
    let mut model = Model::from_bundle(&bundle).unwrap();
    let config = RtnConfig {
        return_int: true,
        enable_mse_search: true,
        pack: PackOptions {
            scale_dtype: ScaleDtype::F16,
            ..Default::default()
        },
        ..Default::default()
    };
    let report = rtn_quantize(&mut model, &config).unwrap();
    assert_eq!(report.layers.len(), 2);
    assert!(model.linear_names().is_empty());

    let bytes = ModelArtifact::new(model.clone()).to_bytes().unwrap();
    let restored = ModelArtifact::from_bytes(&bytes).unwrap().model;
    assert_eq!(restored.passthrough().len(), 1);

    let x = random_matrix(&mut rng, 2, 48);
    let before = model.forward("block.0.fc1", &x).unwrap();
    let after = restored.forward("block.0.fc1", &x).unwrap();
    assert_eq!(before, after);

    let fc1 = packed(&restored, "block.0.fc1");
    let expect = woqpak::kernel::linear(&x, &fc1.recover(), fc1.bias()).unwrap();
    assert_eq!(after, expect);
    assert!(restored.size_bytes() < Model::from_bundle(&bundle).unwrap().size_bytes());
}

#[test]
fn clip_search_never_loses_to_full_range() {
    let mut rng = StdRng::seed_from_u64(9);
    // heavy-tailed rows: mostly small values plus a few outliers
    let weight = Matrix::from_fn(8, 128, |_, _| {
        let v: f32 = rng.gen_range(-0.05..0.05);
        if rng.gen_bool(0.02) {
            v * 60.0
        } else {
            v
        }
    });
    let params = woqpak::QuantParams {
        num_bits: 3,
        group_size: 128,
        ..Default::default()
    };
    let res = woqpak::search_clip(&weight, &params).unwrap();
    let full = woqpak::utils::mean_squared_error(
        weight.as_slice(),
        quant_weight(&weight, &params).unwrap().as_slice(),
    );
    assert!(res.best_mse <= full);
    assert_eq!(res.history[0].1, full);
}
