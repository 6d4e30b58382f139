//! Current sources injecting input into a neuron population.

use crate::models::CurrentSourceModel;
use crate::var_init::{any_device_init, any_init_rng, VarInit, VarInitDomain, VarMode};
use crate::{check_arity, EntityKind, GennError, Result};
use oldies_core::ClusterPlacement;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CurrentSource {
    name: String,
    model: Arc<CurrentSourceModel>,
    params: Vec<f64>,
    derived_params: Vec<f64>,
    var_initialisers: Vec<VarInit>,
    var_modes: Vec<VarMode>,
    target: String,
    placement: ClusterPlacement,
}

impl CurrentSource {
    pub(crate) fn new(
        name: &str,
        model: Arc<CurrentSourceModel>,
        target: &str,
        placement: ClusterPlacement,
        params: &[f64],
        var_initialisers: Vec<VarInit>,
        default_var_mode: VarMode,
    ) -> Result<Self> {
        let owner = format!("{} {}", EntityKind::CurrentSource, name);
        check_arity(&owner, "parameter values", model.schema.param_names.len(), params.len())?;
        check_arity(
            &owner,
            "variable initialisers",
            model.schema.vars.len(),
            var_initialisers.len(),
        )?;

        let num_vars = model.schema.vars.len();
        Ok(Self {
            name: name.to_string(),
            model,
            params: params.to_vec(),
            derived_params: Vec::new(),
            var_initialisers,
            var_modes: vec![default_var_mode; num_vars],
            target: target.to_string(),
            placement,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &Arc<CurrentSourceModel> {
        &self.model
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub fn derived_params(&self) -> &[f64] {
        &self.derived_params
    }

    pub fn var_initialisers(&self) -> &[VarInit] {
        &self.var_initialisers
    }

    pub fn var_modes(&self) -> &[VarMode] {
        &self.var_modes
    }

    pub fn var_mode(&self, var: &str) -> Option<VarMode> {
        self.model.schema.var_index(var).map(|i| self.var_modes[i])
    }

    pub fn target_neuron_group(&self) -> &str {
        &self.target
    }

    pub fn placement(&self) -> ClusterPlacement {
        self.placement
    }

    pub fn is_sim_rng_required(&self) -> bool {
        self.model.is_sim_rng_required()
    }

    pub fn is_init_rng_required(&self, domain: VarInitDomain) -> bool {
        any_init_rng(&self.var_initialisers, &self.var_modes, domain)
    }

    pub fn is_device_init_required(&self) -> bool {
        any_device_init(&self.var_initialisers, &self.var_modes)
    }

    pub fn is_zero_copy_enabled(&self) -> bool {
        self.var_modes.iter().any(VarMode::is_zero_copy)
    }

    pub fn can_run_on_cpu(&self) -> bool {
        self.var_modes.iter().all(VarMode::has_host_copy)
    }

    pub(crate) fn set_var_mode(&mut self, var: &str, mode: VarMode) -> Result<()> {
        let index = self.model.schema.var_index(var).ok_or_else(|| GennError::NotFound {
            kind: EntityKind::Variable,
            name: format!("{}.{}", self.name, var),
        })?;
        self.var_modes[index] = mode;
        Ok(())
    }

    pub(crate) fn init_derived_params(&mut self, dt: f64) {
        self.derived_params = self.model.schema.derive(&self.params, dt);
    }
}
