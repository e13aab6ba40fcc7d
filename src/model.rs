//! A minimal host model: named linear layers built from a tensor bundle.

use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{QuantError, Result};
use crate::kernel;
use crate::packed::WeightOnlyLinear;
use crate::tensor::{FloatBundle, FloatTensor, Matrix};

/// What the quantization driver needs from a model.
pub trait LayerHost {
    /// Names of the float linear layers, in a stable order.
    fn linear_names(&self) -> Vec<String>;

    fn linear(&self, name: &str) -> Option<&Linear>;

    /// Overwrite the weight of a float linear layer in place.
    fn set_weight(&mut self, name: &str, weight: Matrix<f32>) -> Result<()>;

    /// Swap a float linear layer for a packed one.
    fn replace(&mut self, name: &str, layer: WeightOnlyLinear) -> Result<()>;
}

/// A float linear layer, weight shape `(out_features, in_features)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    pub weight: Matrix<f32>,
    pub bias: Option<Vec<f32>>,
}

impl Linear {
    pub fn new(weight: Matrix<f32>, bias: Option<Vec<f32>>) -> Result<Self> {
        if let Some(b) = &bias {
            if b.len() != weight.rows() {
                return Err(QuantError::ShapeMismatch {
                    what: "bias",
                    expected: vec![weight.rows()],
                    got: vec![b.len()],
                });
            }
        }
        Ok(Self { weight, bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.cols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.rows()
    }

    pub fn forward(&self, input: &Matrix<f32>) -> Result<Matrix<f32>> {
        kernel::linear(input, &self.weight, self.bias.as_deref())
    }

    fn validate(&self) -> Result<()> {
        self.weight.validate()?;
        if let Some(b) = &self.bias {
            if b.len() != self.weight.rows() {
                return Err(QuantError::ShapeMismatch {
                    what: "bias",
                    expected: vec![self.weight.rows()],
                    got: vec![b.len()],
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Layer {
    Linear(Linear),
    WeightOnly(WeightOnlyLinear),
}

impl Layer {
    pub fn forward(&self, input: &Matrix<f32>) -> Result<Matrix<f32>> {
        match self {
            Layer::Linear(l) => l.forward(input),
            Layer::WeightOnly(l) => l.forward(input),
        }
    }

    /// The float weight, recovered from packed storage when needed.
    pub fn float_weight(&self) -> Matrix<f32> {
        match self {
            Layer::Linear(l) => l.weight.clone(),
            Layer::WeightOnly(l) => l.recover(),
        }
    }

    pub fn bias(&self) -> Option<&[f32]> {
        match self {
            Layer::Linear(l) => l.bias.as_deref(),
            Layer::WeightOnly(l) => l.bias(),
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            Layer::Linear(l) => {
                (l.weight.as_slice().len() + l.bias.as_ref().map_or(0, Vec::len)) * 4
            }
            Layer::WeightOnly(l) => l.size_bytes(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Layer::Linear(l) => l.validate(),
            Layer::WeightOnly(l) => l.validate(),
        }
    }
}

/// Named layers plus the bundle tensors that are not part of any layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    layers: BTreeMap<String, Layer>,
    passthrough: Vec<FloatTensor>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_linear(&mut self, name: impl Into<String>, linear: Linear) {
        self.layers.insert(name.into(), Layer::Linear(linear));
    }

    /// Build a model from a bundle: every 2-D `X.weight` becomes layer `X`,
    /// with `X.bias` attached when present. Other tensors pass through.
    pub fn from_bundle(bundle: &FloatBundle) -> Result<Self> {
        let biases: BTreeMap<&str, &FloatTensor> = bundle
            .tensors
            .iter()
            .filter_map(|t| t.name.strip_suffix(".bias").map(|base| (base, t)))
            .collect();

        let mut model = Model::new();
        for t in &bundle.tensors {
            t.validate()?;
            if let Some(base) = t.name.strip_suffix(".weight") {
                if let Some(weight) = t.to_matrix()? {
                    let bias = match biases.get(base) {
                        Some(b) if b.shape.len() == 1 => Some(b.data.clone()),
                        _ => None,
                    };
                    model.insert_linear(base, Linear::new(weight, bias)?);
                    continue;
                }
            }
            if let Some(base) = t.name.strip_suffix(".bias") {
                if t.shape.len() == 1 && model_has_weight(bundle, base) {
                    continue;
                }
            }
            warn!("tensor {} {:?} is not a linear layer, passing through", t.name, t.shape);
            model.passthrough.push(t.clone());
        }
        Ok(model)
    }

    /// Flatten back to float tensors, recovering packed layers.
    pub fn to_bundle(&self) -> FloatBundle {
        let mut tensors = Vec::with_capacity(self.layers.len() * 2 + self.passthrough.len());
        for (name, layer) in &self.layers {
            tensors.push(FloatTensor::from_matrix(
                format!("{}.weight", name),
                &layer.float_weight(),
            ));
            if let Some(b) = layer.bias() {
                tensors.push(FloatTensor {
                    name: format!("{}.bias", name),
                    shape: vec![b.len()],
                    data: b.to_vec(),
                });
            }
        }
        tensors.extend(self.passthrough.iter().cloned());
        FloatBundle { tensors }
    }

    pub fn layers(&self) -> impl Iterator<Item = (&str, &Layer)> {
        self.layers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.get(name)
    }

    pub fn passthrough(&self) -> &[FloatTensor] {
        &self.passthrough
    }

    pub fn forward(&self, name: &str, input: &Matrix<f32>) -> Result<Matrix<f32>> {
        self.layers
            .get(name)
            .ok_or_else(|| QuantError::LayerNotFound(name.to_string()))?
            .forward(input)
    }

    /// Check every layer and passthrough tensor of a deserialized model.
    pub fn validate(&self) -> Result<()> {
        for (name, layer) in &self.layers {
            layer.validate().map_err(|e| {
                warn!("layer '{}' failed validation: {}", name, e);
                e
            })?;
        }
        for t in &self.passthrough {
            t.validate()?;
        }
        Ok(())
    }

    pub fn size_bytes(&self) -> usize {
        self.layers.values().map(Layer::size_bytes).sum::<usize>()
            + self
                .passthrough
                .iter()
                .map(|t| t.data.len() * 4)
                .sum::<usize>()
    }
}

fn model_has_weight(bundle: &FloatBundle, base: &str) -> bool {
    let weight = format!("{}.weight", base);
    bundle
        .tensors
        .iter()
        .any(|t| t.name == weight && t.shape.len() == 2)
}

impl LayerHost for Model {
    fn linear_names(&self) -> Vec<String> {
        self.layers
            .iter()
            .filter(|(_, l)| matches!(l, Layer::Linear(_)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn linear(&self, name: &str) -> Option<&Linear> {
        match self.layers.get(name) {
            Some(Layer::Linear(l)) => Some(l),
            _ => None,
        }
    }

    fn set_weight(&mut self, name: &str, weight: Matrix<f32>) -> Result<()> {
        match self.layers.get_mut(name) {
            Some(Layer::Linear(l)) => {
                if weight.shape() != l.weight.shape() {
                    return Err(QuantError::ShapeMismatch {
                        what: "weight",
                        expected: l.weight.shape().to_vec(),
                        got: weight.shape().to_vec(),
                    });
                }
                l.weight = weight;
                Ok(())
            }
            _ => Err(QuantError::LayerNotFound(name.to_string())),
        }
    }

    fn replace(&mut self, name: &str, layer: WeightOnlyLinear) -> Result<()> {
        match self.layers.get_mut(name) {
            Some(slot) if matches!(slot, Layer::Linear(_)) => {
                *slot = Layer::WeightOnly(layer);
                Ok(())
            }
            _ => Err(QuantError::LayerNotFound(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bundle() -> FloatBundle {
        FloatBundle {
            tensors: vec![
                FloatTensor {
                    name: "fc1.weight".into(),
                    shape: vec![2, 3],
                    data: vec![0.5, 0.25, 0.75, 0.125, 1.5, -0.5],
                },
                FloatTensor {
                    name: "fc1.bias".into(),
                    shape: vec![2],
                    data: vec![1.0, -1.0],
                },
                FloatTensor {
                    name: "norm.weight".into(),
                    shape: vec![3],
                    data: vec![1.0, 1.0, 1.0],
                },
                FloatTensor {
                    name: "fc2.weight".into(),
                    shape: vec![1, 2],
                    data: vec![2.0, -2.0],
                },
            ],
        }
    }

    #[test]
    fn bundle_becomes_layers() {
        let model = Model::from_bundle(&bundle()).unwrap();
        assert_eq!(model.linear_names(), vec!["fc1".to_string(), "fc2".to_string()]);
        let fc1 = model.linear("fc1").unwrap();
        assert_eq!(fc1.in_features(), 3);
        assert_eq!(fc1.out_features(), 2);
        assert_eq!(fc1.bias.as_deref(), Some(&[1.0, -1.0][..]));
        assert!(model.linear("fc2").unwrap().bias.is_none());
        assert_eq!(model.passthrough().len(), 1);
        assert_eq!(model.passthrough()[0].name, "norm.weight");
    }

    #[test]
    fn bundle_round_trip_keeps_tensors() {
        let model = Model::from_bundle(&bundle()).unwrap();
        let out = model.to_bundle();
        let mut names: Vec<_> = out.tensors.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["fc1.bias", "fc1.weight", "fc2.weight", "norm.weight"]);
        assert_eq!(Model::from_bundle(&out).unwrap(), model);
    }

    #[test]
    fn malformed_tensor_is_rejected() {
        let bad = FloatBundle {
            tensors: vec![FloatTensor {
                name: "fc.weight".into(),
                shape: vec![2, 2],
                data: vec![0.0; 3],
            }],
        };
        assert!(Model::from_bundle(&bad).is_err());
    }

    #[test]
    fn host_operations() {
        let mut model = Model::from_bundle(&bundle()).unwrap();
        model
            .set_weight("fc2", Matrix::from_vec(1, 2, vec![0.0, 1.0]).unwrap())
            .unwrap();
        assert_eq!(model.linear("fc2").unwrap().weight.row(0), &[0.0, 1.0]);
        assert!(model.set_weight("fc2", Matrix::zeros(2, 2)).is_err());
        assert!(model.set_weight("missing", Matrix::zeros(1, 1)).is_err());

        let y = model
            .forward("fc1", &Matrix::from_vec(1, 3, vec![1.0, 0.0, 0.0]).unwrap())
            .unwrap();
        assert_eq!(y.as_slice(), &[1.5, -0.875]);
    }
}
