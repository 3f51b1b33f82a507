//! Trainable parameters shared by the model and the guide.
//!
//! Variables live in a `candle_nn::VarMap`. Next to it the store keeps, per
//! parameter name, an "active" flag and the gradient accumulated over the
//! particles of the current step. Programs only need a shared reference.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Shape, Tensor, Var};
use candle_nn::{Init, VarMap};

use crate::error::{Result, SviError};

#[derive(Default)]
struct GradEntry {
    active: bool,
    grad: Option<Tensor>,
}

pub struct ParamStore {
    varmap: VarMap,
    grads: Mutex<BTreeMap<String, GradEntry>>,
    dtype: DType,
    device: Device,
}

impl ParamStore {
    pub fn new(dtype: DType, device: Device) -> Self {
        Self {
            varmap: VarMap::new(),
            grads: Mutex::new(BTreeMap::new()),
            dtype,
            device,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn vars(&self) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
        self.varmap
            .data()
            .lock()
            .map_err(|_| SviError::ParamStorePoisoned)
    }

    fn grads(&self) -> Result<MutexGuard<'_, BTreeMap<String, GradEntry>>> {
        self.grads.lock().map_err(|_| SviError::ParamStorePoisoned)
    }

    fn var(&self, name: &str) -> Result<Var> {
        self.vars()?
            .get(name)
            .cloned()
            .ok_or_else(|| SviError::UnknownParam(name.to_string()))
    }

    /// Get the parameter `name`, creating it with `init` if it is new.
    ///
    /// The returned tensor is the variable itself, so anything computed
    /// from it is differentiable with respect to the parameter. Asking for
    /// an existing name with another shape is an error.
    pub fn param<S: Into<Shape>>(&self, name: &str, shape: S, init: Init) -> Result<Tensor> {
        Ok(self
            .varmap
            .get(shape, name, init, self.dtype, &self.device)?)
    }

    /// Get the parameter `name`, creating it as a copy of `init` if it is new.
    pub fn param_from_tensor(&self, name: &str, init: &Tensor) -> Result<Tensor> {
        let mut vars = self.vars()?;
        if let Some(var) = vars.get(name) {
            return Ok(var.as_tensor().clone());
        }
        let init = init.detach().to_dtype(self.dtype)?.to_device(&self.device)?;
        let var = Var::from_tensor(&init)?;
        let value = var.as_tensor().clone();
        vars.insert(name.to_string(), var);
        Ok(value)
    }

    /// Snapshot of the current value, detached from the parameter.
    pub fn get(&self, name: &str) -> Result<Option<Tensor>> {
        match self.vars()?.get(name) {
            Some(var) => Ok(Some(var.as_tensor().detach().copy()?)),
            None => Ok(None),
        }
    }

    /// Overwrite the value of an existing parameter.
    pub fn set(&self, name: &str, value: &Tensor) -> Result<()> {
        self.var(name)?.set(value)?;
        Ok(())
    }

    /// Parameter names in sorted order.
    pub fn names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.vars()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.vars()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.vars()?.is_empty())
    }

    /// Flag parameters as trained in the current step.
    pub fn mark_params_active(&self, names: &BTreeSet<String>) -> Result<()> {
        let vars = self.vars()?;
        let mut grads = self.grads()?;
        for name in names {
            if !vars.contains_key(name) {
                return Err(SviError::UnknownParam(name.clone()));
            }
            grads.entry(name.clone()).or_default().active = true;
        }
        Ok(())
    }

    pub fn active_params(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .grads()?
            .iter()
            .filter(|(_, entry)| entry.active)
            .map(|(name, _)| name.clone())
            .collect())
    }

    /// Add the gradients of one backward pass to the running totals of
    /// `names`. Parameters that did not receive a gradient are left as is.
    pub fn accumulate_grads(&self, grads: &GradStore, names: &BTreeSet<String>) -> Result<()> {
        let vars = self.vars()?;
        let mut totals = self.grads()?;
        for name in names {
            let var = vars
                .get(name)
                .ok_or_else(|| SviError::UnknownParam(name.clone()))?;
            if let Some(grad) = grads.get(var.as_tensor()) {
                let grad = grad.detach();
                let entry = totals.entry(name.clone()).or_default();
                entry.grad = Some(match entry.grad.take() {
                    Some(total) => (total + grad)?,
                    None => grad,
                });
            }
        }
        Ok(())
    }

    /// Gradient accumulated since the last [`Self::reset`].
    pub fn grad(&self, name: &str) -> Result<Option<Tensor>> {
        if !self.vars()?.contains_key(name) {
            return Err(SviError::UnknownParam(name.to_string()));
        }
        Ok(self.grads()?.get(name).and_then(|entry| entry.grad.clone()))
    }

    /// All variables, to hand over to a `candle_nn::Optimizer`.
    pub fn all_vars(&self) -> Result<Vec<Var>> {
        Ok(self.vars()?.values().cloned().collect())
    }

    /// Repackage the accumulated gradients of the active parameters as a
    /// [`GradStore`], so that any `candle_nn::Optimizer` can consume them.
    ///
    /// The store is the backward pass of `Σ sum(θ ⊙ g)` with `g` detached,
    /// whose gradient with respect to `θ` is `g` itself. `None` when no
    /// active parameter has a gradient.
    pub fn active_grad_store(&self) -> Result<Option<GradStore>> {
        let vars = self.vars()?;
        let grads = self.grads()?;
        let mut linear: Option<Tensor> = None;
        for (name, entry) in grads.iter().filter(|(_, entry)| entry.active) {
            let (Some(grad), Some(var)) = (entry.grad.as_ref(), vars.get(name)) else {
                continue;
            };
            let term = (var.as_tensor() * grad)?.sum_all()?;
            linear = Some(match linear {
                Some(total) => (total + term)?,
                None => term,
            });
        }
        match linear {
            Some(linear) => Ok(Some(linear.backward()?)),
            None => Ok(None),
        }
    }

    /// Clear accumulated gradients and active flags between steps.
    pub fn reset(&self) -> Result<()> {
        self.grads()?.clear();
        Ok(())
    }
}
