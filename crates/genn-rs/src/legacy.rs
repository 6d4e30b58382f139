//! Positional builder for integer-indexed rule tables.
//!
//! Older model descriptions select rules by index into process tables and
//! pass parameters and initial values as plain arrays. This adapter checks
//! arity, turns initial values into constant initialisers and forwards to
//! the [`ModelSpec`] builder.

use crate::connectivity::ConnectivityInit;
use crate::models::{neuron, postsynaptic, weight_update, NeuronModel, PostsynapticModel, WeightUpdateModel};
use crate::synapse_group::SynapseMatrixType;
use crate::var_init::VarInit;
use crate::{check_arity, EntityKind, GennError, ModelSpec, Result};
use std::sync::Arc;
use tracing::debug;

// Connection types
pub const ALLTOALL: u32 = 0;
pub const DENSE: u32 = 1;
pub const SPARSE: u32 = 2;

// Weight types
pub const INDIVIDUALG: u32 = 0;
pub const GLOBALG: u32 = 1;
pub const INDIVIDUALID: u32 = 2;

// Standard table indices
pub const IZHIKEVICH: usize = 0;
pub const LIF: usize = 1;
pub const POISSON: usize = 2;
pub const SPIKE_SOURCE: usize = 3;

pub const NSYNAPSE: usize = 0;
pub const NGRADSYNAPSE: usize = 1;
pub const LEARN1SYNAPSE: usize = 2;
pub const GRADED_CONTINUOUS: usize = 3;

pub const EXPDECAY: usize = 0;
pub const IZHIKEVICH_PS: usize = 1;

/// Map a `(connection type, weight type)` pair onto a matrix kind
pub fn matrix_type_from_codes(conn_type: u32, g_type: u32) -> Result<SynapseMatrixType> {
    match (conn_type, g_type) {
        (SPARSE, GLOBALG) => Ok(SynapseMatrixType::SPARSE_GLOBALG),
        (SPARSE, INDIVIDUALG) => Ok(SynapseMatrixType::SPARSE_INDIVIDUALG),
        (DENSE | ALLTOALL, INDIVIDUALG) => Ok(SynapseMatrixType::DENSE_INDIVIDUALG),
        (DENSE | ALLTOALL, GLOBALG) => Ok(SynapseMatrixType::DENSE_GLOBALG),
        (_, INDIVIDUALID) => Ok(SynapseMatrixType::BITMASK_GLOBALG),
        _ => Err(GennError::UnsupportedConfiguration(format!(
            "Combination of connection type {} and weight type {} not supported",
            conn_type, g_type
        ))),
    }
}

/// Standard entries first, previously added custom entries after them
fn prepend<T>(table: &mut Vec<T>, standard: Vec<T>) {
    let custom = std::mem::replace(table, standard);
    table.extend(custom);
}

fn constants(values: &[f64]) -> Vec<VarInit> {
    values.iter().map(|&v| VarInit::constant(v)).collect()
}

/// Rule tables addressed by index
#[derive(Debug, Clone, Default)]
pub struct LegacyModelRegistry {
    neuron_models: Vec<Arc<NeuronModel>>,
    weight_update_models: Vec<Arc<WeightUpdateModel>>,
    postsynaptic_models: Vec<Arc<PostsynapticModel>>,
    prepared: bool,
}

impl LegacyModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the standard rules at their conventional indices
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.prepare_standard_models();
        registry
    }

    pub fn prepare_standard_models(&mut self) {
        if self.prepared {
            return;
        }
        prepend(
            &mut self.neuron_models,
            vec![neuron::izhikevich(), neuron::lif(), neuron::poisson(), neuron::spike_source()],
        );
        prepend(
            &mut self.weight_update_models,
            vec![
                weight_update::static_pulse(),
                weight_update::static_graded(),
                weight_update::stdp_additive(),
                weight_update::graded_continuous(),
            ],
        );
        prepend(
            &mut self.postsynaptic_models,
            vec![postsynaptic::exp_curr(), postsynaptic::delta_curr()],
        );
        self.prepared = true;
        debug!(
            neuron_models = self.neuron_models.len(),
            weight_update_models = self.weight_update_models.len(),
            postsynaptic_models = self.postsynaptic_models.len(),
            "prepared standard legacy models"
        );
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Append a custom neuron rule, returning its index
    pub fn add_neuron_model(&mut self, model: Arc<NeuronModel>) -> usize {
        self.neuron_models.push(model);
        self.neuron_models.len() - 1
    }

    pub fn add_weight_update_model(&mut self, model: Arc<WeightUpdateModel>) -> usize {
        self.weight_update_models.push(model);
        self.weight_update_models.len() - 1
    }

    pub fn add_postsynaptic_model(&mut self, model: Arc<PostsynapticModel>) -> usize {
        self.postsynaptic_models.push(model);
        self.postsynaptic_models.len() - 1
    }

    fn check_prepared(&self, model: &ModelSpec) -> Result<()> {
        if !self.prepared {
            return Err(GennError::InvalidState(
                "standard models must be prepared before legacy populations are added".into(),
            ));
        }
        if model.is_finalized() {
            return Err(GennError::InvalidState(
                "Trying to add a population to a finalized model".into(),
            ));
        }
        Ok(())
    }

    fn lookup<T>(table: &[Arc<T>], index: usize, kind: EntityKind) -> Result<Arc<T>> {
        table
            .get(index)
            .cloned()
            .ok_or_else(|| GennError::NotFound {
                kind,
                name: format!("#{}", index),
            })
    }

    pub fn add_neuron_population_legacy(
        &self,
        model: &mut ModelSpec,
        name: &str,
        size: usize,
        neuron_type: usize,
        params: &[f64],
        initial_values: &[f64],
    ) -> Result<()> {
        self.check_prepared(model)?;
        let rule = Self::lookup(&self.neuron_models, neuron_type, EntityKind::NeuronModel)?;

        let owner = format!("{} {}", EntityKind::NeuronPopulation, name);
        check_arity(&owner, "parameter values", rule.schema.param_names.len(), params.len())?;
        check_arity(&owner, "variable initial values", rule.schema.vars.len(), initial_values.len())?;

        model.add_neuron_population(name, size, rule, params, constants(initial_values))?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_synapse_population_legacy(
        &self,
        model: &mut ModelSpec,
        name: &str,
        syn_type: usize,
        conn_type: u32,
        g_type: u32,
        delay_steps: u32,
        post_syn_type: usize,
        src: &str,
        trg: &str,
        wu_initial_values: &[f64],
        wu_params: &[f64],
        ps_initial_values: &[f64],
        ps_params: &[f64],
    ) -> Result<()> {
        self.check_prepared(model)?;
        let wu = Self::lookup(&self.weight_update_models, syn_type, EntityKind::WeightUpdateModel)?;
        let ps = Self::lookup(&self.postsynaptic_models, post_syn_type, EntityKind::PostsynapticModel)?;

        let owner = format!("{} {}", EntityKind::SynapsePopulation, name);
        check_arity(&owner, "weight update parameter values", wu.schema.param_names.len(), wu_params.len())?;
        check_arity(
            &owner,
            "weight update variable initial values",
            wu.schema.vars.len(),
            wu_initial_values.len(),
        )?;
        check_arity(&owner, "postsynaptic parameter values", ps.schema.param_names.len(), ps_params.len())?;
        check_arity(
            &owner,
            "postsynaptic variable initial values",
            ps.schema.vars.len(),
            ps_initial_values.len(),
        )?;

        let matrix_type = matrix_type_from_codes(conn_type, g_type)?;
        model.add_synapse_population(
            name,
            matrix_type,
            delay_steps,
            src,
            trg,
            wu,
            wu_params,
            constants(wu_initial_values),
            ps,
            ps_params,
            constants(ps_initial_values),
            ConnectivityInit::uninitialised(),
        )?;
        Ok(())
    }
}
