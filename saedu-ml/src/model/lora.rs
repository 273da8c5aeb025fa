//! Low-rank adapters on frozen linear projections.
//!
//! `y = W x + b + (alpha / r) · B(A(dropout(x)))` with `A: [r, in]` drawn
//! uniformly from `±1/sqrt(in)` and `B: [out, r]` zero, so a fresh adapter
//! leaves the base output unchanged. Adapter weights live in a [`VarMap`]
//! as F32 and are the only trainable parameters.

use crate::error::MlError;
use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::{Linear, VarMap};
use rand::Rng;
use rand::distributions::Uniform;
use rand::rngs::StdRng;

/// PEFT key prefix of every adapter tensor.
pub const PEFT_PREFIX: &str = "base_model.model";

/// PEFT name of an adapter matrix for a base module path such as
/// `model.layers.0.self_attn.q_proj`.
pub fn adapter_tensor_name(module_path: &str, matrix: &str) -> String {
    format!("{PEFT_PREFIX}.{module_path}.{matrix}.weight")
}

/// Trainable low-rank update of one projection.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    a: Tensor,
    b: Tensor,
    scale: f64,
    dropout: f32,
}

impl LoraAdapter {
    /// Create `lora_A` / `lora_B` for `module_path` and register them in `varmap`.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        varmap: &VarMap,
        module_path: &str,
        (in_dim, out_dim): (usize, usize),
        rank: usize,
        scale: f64,
        dropout: f32,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self, MlError> {
        let bound = 1.0 / (in_dim as f32).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        let a_init: Vec<f32> = (0..rank * in_dim).map(|_| rng.sample(dist)).collect();
        let a = Var::from_tensor(&Tensor::from_vec(a_init, (rank, in_dim), device)?)?;
        let b = Var::zeros((out_dim, rank), DType::F32, device)?;

        let mut vars = varmap
            .data()
            .lock()
            .map_err(|_| MlError::training("adapter variable map lock poisoned"))?;
        let a_tensor = a.as_tensor().clone();
        let b_tensor = b.as_tensor().clone();
        vars.insert(adapter_tensor_name(module_path, "lora_A"), a);
        vars.insert(adapter_tensor_name(module_path, "lora_B"), b);

        Ok(Self {
            a: a_tensor,
            b: b_tensor,
            scale,
            dropout,
        })
    }

    /// The scaled low-rank delta for `x`, in F32.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor, MlError> {
        let mut x = x.to_dtype(DType::F32)?;
        if train && self.dropout > 0.0 {
            x = candle_nn::ops::dropout(&x, self.dropout)?;
        }
        let h = x.broadcast_matmul(&self.a.t()?)?;
        let delta = h.broadcast_matmul(&self.b.t()?)?;
        Ok(delta.affine(self.scale, 0.0)?)
    }

    /// `scale · B · A`, shaped like the base weight `[out, in]`.
    pub fn delta_weight(&self) -> Result<Tensor, MlError> {
        Ok(self.b.matmul(&self.a)?.affine(self.scale, 0.0)?)
    }

    pub fn num_parameters(&self) -> usize {
        self.a.elem_count() + self.b.elem_count()
    }
}

/// A frozen projection with an optional adapter.
#[derive(Debug, Clone)]
pub struct AdaptedLinear {
    base: Linear,
    adapter: Option<LoraAdapter>,
}

impl AdaptedLinear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self {
            base: Linear::new(weight, bias),
            adapter: None,
        }
    }

    pub fn weight(&self) -> &Tensor {
        self.base.weight()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.base.bias()
    }

    /// `(in, out)` of the base projection.
    pub fn dims(&self) -> Result<(usize, usize), MlError> {
        let (out_dim, in_dim) = self.base.weight().dims2()?;
        Ok((in_dim, out_dim))
    }

    pub fn attach(&mut self, adapter: LoraAdapter) {
        self.adapter = Some(adapter);
    }

    pub fn adapter(&self) -> Option<&LoraAdapter> {
        self.adapter.as_ref()
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor, MlError> {
        let y = self.base.forward(x)?;
        match &self.adapter {
            None => Ok(y),
            Some(adapter) => {
                let delta = adapter.forward(x, train)?.to_dtype(y.dtype())?;
                Ok((y + delta)?)
            }
        }
    }

    /// Base weight with the adapter folded in, in F32.
    /// Base weight plus the scaled adapter delta, cast to `dtype`. The sum is
    /// taken in F32 one projection at a time.
    pub fn merged_weight(&self, dtype: DType) -> Result<Tensor, MlError> {
        let weight = self.base.weight();
        match &self.adapter {
            None => Ok(weight.to_dtype(dtype)?),
            Some(adapter) => {
                let merged = (weight.to_dtype(DType::F32)? + adapter.delta_weight()?)?;
                Ok(merged.to_dtype(dtype)?)
            }
        }
    }
}
