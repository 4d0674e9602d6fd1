//! Fully connected projection layer.
//!
//! Weights are re-tagged through `as_param` on construction, so a layer whose
//! `forward` runs inside several traced closures still imports one graph input
//! per parameter.

use crate::backend::spec::PortableBackend;
use crate::ops::functional;
use crate::tensor::{DeviceTensor, DeviceTensorOps, IntoDeviceTensor, IntoDeviceTensorOption};
use anyhow::{bail, ensure, Result};
use std::sync::Arc;

/// `y = x W + b` over device tensors.
pub struct Linear<B: PortableBackend + 'static> {
    backend: Arc<B>,
    pub weight: DeviceTensor<B>,
    pub bias: Option<DeviceTensor<B>>,
}

impl<B: PortableBackend + 'static> Linear<B> {
    /// Places the weight matrix and optional bias on `backend` as parameters.
    pub fn new<W, Bi>(backend: Arc<B>, weight: W, bias: Bi) -> Result<Self>
    where
        W: IntoDeviceTensor<B>,
        Bi: IntoDeviceTensorOption<B>,
    {
        let weight = weight.into_device_tensor(&backend)?.as_param()?;
        ensure!(
            weight.shape().rank() == 2,
            "linear weight must be 2D, got {:?}",
            weight.shape().dims()
        );

        let bias = bias
            .into_device_tensor_option(&backend)?
            .map(|bias| bias.as_param())
            .transpose()?;
        Ok(Self {
            backend,
            weight,
            bias,
        })
    }

    /// Projects `input` through the weight matrix, adding the bias if present.
    ///
    /// Records graph nodes only; nothing executes until the result (or the
    /// loop it is traced into) is materialized.
    pub fn forward(&self, input: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        let in_features = match input.shape().dims() {
            &[_, features] => features,
            dims => bail!("linear expects 2D input, got shape {:?}", dims),
        };
        let weight_rows = self.weight.shape().dims()[0];
        ensure!(
            in_features == weight_rows,
            "input features ({}) must match weight rows ({})",
            in_features,
            weight_rows
        );

        let projected = input.matmul(&self.weight)?;
        match &self.bias {
            Some(bias) => functional::add_bias(&projected, bias),
            None => Ok(projected),
        }
    }

    /// The backend holding the layer parameters.
    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }
}
