//! Named parameter arena
//!
//! Every trainable tensor of a network lives in a [`ParamStore`] under a
//! dotted name (`level0.step1.coupling.net.fc0.weight`). The store:
//! - draws initial values from its own seeded RNG, so models are reproducible
//! - hands its variables to an optimizer
//! - exports and imports named records for checkpoints

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor, Var};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{FairFlowError, Result};

/// Initializer for a parameter tensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    /// All zeros
    Zeros,
    /// All ones
    Ones,
    /// Uniform in `[-bound, bound]`
    Uniform { bound: f64 },
    /// Normal with the given std
    Normal { std: f64 },
}

impl Init {
    /// PyTorch-style default for a layer with `fan_in` inputs
    pub fn fan_in(fan_in: usize) -> Self {
        Init::Uniform {
            bound: 1.0 / (fan_in.max(1) as f64).sqrt(),
        }
    }

    fn sample(&self, n: usize, rng: &mut StdRng) -> Result<Vec<f32>> {
        Ok(match *self {
            Init::Zeros => vec![0.0; n],
            Init::Ones => vec![1.0; n],
            Init::Uniform { bound } => (0..n)
                .map(|_| rng.gen_range(-bound..=bound) as f32)
                .collect(),
            Init::Normal { std } => {
                let normal = Normal::new(0.0, std)
                    .map_err(|e| FairFlowError::config(format!("invalid init std: {e}")))?;
                (0..n).map(|_| normal.sample(rng) as f32).collect()
            }
        })
    }
}

/// Plain serializable copy of one tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorRecord {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorRecord {
    /// Copy a tensor out of the graph
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        Ok(Self {
            shape: tensor.dims().to_vec(),
            data: tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?,
        })
    }

    /// Rebuild the tensor on `device`
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(self.data.clone(), self.shape.clone(), device)?)
    }
}

struct Param {
    var: Var,
    init: Init,
}

/// Seeded arena of named trainable variables
pub struct ParamStore {
    params: BTreeMap<String, Param>,
    rng: StdRng,
    device: Device,
}

impl ParamStore {
    /// Create an empty store drawing from `seed`
    pub fn new(seed: u64, device: &Device) -> Self {
        Self {
            params: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
            device: device.clone(),
        }
    }

    /// Device every parameter lives on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Register a new parameter and return its tensor view
    pub fn var(&mut self, name: &str, shape: &[usize], init: Init) -> Result<Tensor> {
        if self.params.contains_key(name) {
            return Err(FairFlowError::shape(format!("parameter `{name}` registered twice")));
        }
        let n = shape.iter().product();
        let data = init.sample(n, &mut self.rng)?;
        let tensor = Tensor::from_vec(data, shape.to_vec(), &self.device)?;
        let var = Var::from_tensor(&tensor)?;
        let view = var.as_tensor().clone();
        self.params.insert(name.to_string(), Param { var, init });
        Ok(view)
    }

    /// Every variable, in name order
    pub fn all_vars(&self) -> Vec<Var> {
        self.params.values().map(|p| p.var.clone()).collect()
    }

    /// Look up a variable
    pub fn get(&self, name: &str) -> Option<&Var> {
        self.params.get(name).map(|p| &p.var)
    }

    /// Overwrite a variable in place; optimizers keep tracking it
    pub fn set(&self, name: &str, value: &Tensor) -> Result<()> {
        let param = self
            .params
            .get(name)
            .ok_or_else(|| FairFlowError::shape(format!("unknown parameter `{name}`")))?;
        if param.var.dims() != value.dims() {
            return Err(FairFlowError::shape(format!(
                "parameter `{name}` has shape {:?}, got {:?}",
                param.var.dims(),
                value.dims()
            )));
        }
        param.var.set(value)?;
        Ok(())
    }

    /// Number of registered tensors
    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Total number of scalar parameters
    pub fn num_parameters(&self) -> usize {
        self.params.values().map(|p| p.var.elem_count()).sum()
    }

    /// Redraw every parameter from its initializer using a fresh seed
    pub fn reinitialize(&mut self, seed: u64) -> Result<()> {
        self.rng = StdRng::seed_from_u64(seed);
        for param in self.params.values() {
            let data = param.init.sample(param.var.elem_count(), &mut self.rng)?;
            let fresh = Tensor::from_vec(data, param.var.dims().to_vec(), &self.device)?;
            param.var.set(&fresh)?;
        }
        Ok(())
    }

    /// Export every parameter by name
    pub fn export(&self) -> Result<BTreeMap<String, TensorRecord>> {
        self.params
            .iter()
            .map(|(name, p)| Ok((name.clone(), TensorRecord::from_tensor(p.var.as_tensor())?)))
            .collect()
    }

    /// Load named records; the name sets must match exactly
    pub fn import(&self, records: &BTreeMap<String, TensorRecord>) -> Result<()> {
        if records.len() != self.params.len() {
            return Err(FairFlowError::shape(format!(
                "expected {} parameter tensors, got {}",
                self.params.len(),
                records.len()
            )));
        }
        for (name, record) in records {
            let tensor = record.to_tensor(&self.device)?;
            self.set(name, &tensor)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_initialization_is_reproducible() {
        let device = Device::Cpu;
        let mut a = ParamStore::new(7, &device);
        let mut b = ParamStore::new(7, &device);
        let ta = a.var("w", &[3, 4], Init::fan_in(4)).unwrap();
        let tb = b.var("w", &[3, 4], Init::fan_in(4)).unwrap();
        assert_eq!(ta.to_vec2::<f32>().unwrap(), tb.to_vec2::<f32>().unwrap());
        assert_eq!(a.num_parameters(), 12);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut store = ParamStore::new(0, &Device::Cpu);
        store.var("bias", &[2], Init::Zeros).unwrap();
        assert!(store.var("bias", &[2], Init::Zeros).is_err());
    }

    #[test]
    fn test_export_import() {
        let device = Device::Cpu;
        let mut src = ParamStore::new(1, &device);
        src.var("a", &[2, 2], Init::Normal { std: 1.0 }).unwrap();
        src.var("b", &[3], Init::Ones).unwrap();

        let mut dst = ParamStore::new(2, &device);
        let a = dst.var("a", &[2, 2], Init::Zeros).unwrap();
        dst.var("b", &[3], Init::Zeros).unwrap();

        dst.import(&src.export().unwrap()).unwrap();
        assert_eq!(dst.export().unwrap(), src.export().unwrap());
        // views handed out before the import observe the new values
        assert_eq!(
            a.to_vec2::<f32>().unwrap(),
            src.get("a").unwrap().to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_import_shape_mismatch() {
        let device = Device::Cpu;
        let mut src = ParamStore::new(1, &device);
        src.var("a", &[4], Init::Ones).unwrap();
        let mut dst = ParamStore::new(1, &device);
        dst.var("a", &[2], Init::Ones).unwrap();
        assert!(dst.import(&src.export().unwrap()).is_err());
    }

    #[test]
    fn test_reinitialize_changes_values() {
        let mut store = ParamStore::new(3, &Device::Cpu);
        let w = store.var("w", &[8], Init::Uniform { bound: 1.0 }).unwrap();
        let before = w.to_vec1::<f32>().unwrap();
        store.reinitialize(99).unwrap();
        assert_ne!(before, w.to_vec1::<f32>().unwrap());
    }
}
