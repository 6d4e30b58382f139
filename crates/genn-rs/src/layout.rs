//! Serialisable snapshot of a finalized model.
//!
//! Code emitters consume this instead of walking the model graph. Only
//! entities simulated on the local host are described in full.

use crate::grid::{GridSizes, KernelBlockSizes, KernelCategory, PaddedRange};
use crate::model::{KernelParameters, ModelSpec};
use crate::models::NameType;
use crate::neuron_group::{MergedInSyn, SpikeEventCondition};
use crate::sparse::RaggedProjection;
use crate::synapse_group::{SpanType, SynapseMatrixType};
use crate::var_init::{VarInit, VarMode};
use crate::Result;
use oldies_core::Precision;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct VariableLayout {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub mode: VarMode,
    pub init_snippet: String,
    pub init_params: Vec<f64>,
    pub init_derived_params: Vec<f64>,
    /// Ring-buffer slots, 1 unless queued behind a delay
    pub slots: usize,
}

fn variable_layouts(
    vars: &[NameType],
    inits: &[VarInit],
    modes: &[VarMode],
    dt: f64,
    slots: impl Fn(&str) -> usize,
) -> Vec<VariableLayout> {
    vars.iter()
        .zip(inits)
        .zip(modes)
        .map(|((var, init), mode)| VariableLayout {
            name: var.name.clone(),
            ty: var.ty.clone(),
            mode: *mode,
            init_snippet: init.snippet().name.clone(),
            init_params: init.params().to_vec(),
            init_derived_params: init.derived_params(dt),
            slots: slots(&var.name),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct NeuronGroupLayout {
    pub name: String,
    pub model: String,
    pub num_neurons: usize,
    pub params: Vec<f64>,
    pub derived_params: Vec<f64>,
    pub vars: Vec<VariableLayout>,
    pub spike_var_mode: VarMode,
    pub num_delay_slots: usize,
    pub true_spike_required: bool,
    pub spike_event_required: bool,
    pub spike_event_conditions: Vec<SpikeEventCondition>,
    pub sim_rng_required: bool,
    pub in_syn: Vec<String>,
    pub out_syn: Vec<String>,
    pub merged_in_syn: Vec<MergedInSyn>,
    pub current_sources: Vec<String>,
    pub id_range: Option<(usize, usize)>,
    pub padded_id_range: Option<PaddedRange>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SynapseGroupLayout {
    pub name: String,
    pub matrix_type: SynapseMatrixType,
    pub span_type: SpanType,
    pub delay_steps: u32,
    pub src: String,
    pub trg: String,
    pub wu_model: String,
    pub wu_params: Vec<f64>,
    pub wu_derived_params: Vec<f64>,
    pub wu_vars: Vec<VariableLayout>,
    pub ps_model: String,
    pub ps_params: Vec<f64>,
    pub ps_derived_params: Vec<f64>,
    pub ps_vars: Vec<VariableLayout>,
    pub ps_target: String,
    pub in_syn_var_mode: VarMode,
    pub max_connections: usize,
    pub max_source_connections: usize,
    pub max_dendritic_delay_timesteps: u32,
    pub true_spike_required: bool,
    pub spike_event_required: bool,
    pub event_threshold_retest_required: bool,
    pub padded_kernel_id_range: Option<PaddedRange>,
    pub post_learn_range: Option<PaddedRange>,
    pub synapse_dynamics_range: Option<PaddedRange>,
    pub connectivity_init: String,
    pub connectivity: Option<RaggedProjection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentSourceLayout {
    pub name: String,
    pub model: String,
    pub target: String,
    pub params: Vec<f64>,
    pub derived_params: Vec<f64>,
    pub vars: Vec<VariableLayout>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelLayout {
    pub name: String,
    pub precision: Precision,
    pub scalar_type: String,
    pub dt: f64,
    pub timing: bool,
    pub seed: u32,
    pub rn_type: String,
    pub block_sizes: KernelBlockSizes,
    pub grid_sizes: GridSizes,
    pub reset_kernel: Option<KernelCategory>,
    pub host_rng_required: bool,
    pub device_rng_required: bool,
    pub device_init_required: bool,
    pub device_sparse_init_required: bool,
    pub zero_copy_in_use: bool,
    pub num_pre_synapse_reset_required_groups: usize,
    pub num_local_neurons: usize,
    pub num_remote_neurons: usize,
    pub neuron_groups: Vec<NeuronGroupLayout>,
    pub remote_neuron_groups: Vec<String>,
    pub synapse_groups: Vec<SynapseGroupLayout>,
    pub current_sources: Vec<CurrentSourceLayout>,
    pub kernel_parameters: KernelParameters,
}

impl ModelLayout {
    pub(crate) fn from_model(model: &ModelSpec) -> Self {
        let neuron_groups = model
            .local_neuron_groups()
            .map(|ng| NeuronGroupLayout {
                name: ng.name().to_string(),
                model: ng.model().schema.name.clone(),
                num_neurons: ng.num_neurons(),
                params: ng.params().to_vec(),
                derived_params: ng.derived_params().to_vec(),
                vars: variable_layouts(
                    &ng.model().schema.vars,
                    ng.var_initialisers(),
                    ng.var_modes(),
                    model.dt(),
                    |var| ng.var_storage_slots(var),
                ),
                spike_var_mode: ng.spike_var_mode(),
                num_delay_slots: ng.num_delay_slots(),
                true_spike_required: ng.is_true_spike_required(),
                spike_event_required: ng.is_spike_event_required(),
                spike_event_conditions: ng.spike_event_conditions().iter().cloned().collect(),
                sim_rng_required: model.neuron_sim_rng_required(ng),
                in_syn: ng.in_syn().to_vec(),
                out_syn: ng.out_syn().to_vec(),
                merged_in_syn: ng.merged_in_syn().to_vec(),
                current_sources: ng.current_sources().to_vec(),
                id_range: ng.id_range(),
                padded_id_range: ng.padded_id_range(),
            })
            .collect();

        let synapse_groups = model
            .local_synapse_groups()
            .map(|sg| SynapseGroupLayout {
                name: sg.name().to_string(),
                matrix_type: sg.matrix_type(),
                span_type: sg.span_type(),
                delay_steps: sg.delay_steps(),
                src: sg.src_neuron_group().to_string(),
                trg: sg.trg_neuron_group().to_string(),
                wu_model: sg.wu_model().schema.name.clone(),
                wu_params: sg.wu_params().to_vec(),
                wu_derived_params: sg.wu_derived_params().to_vec(),
                wu_vars: variable_layouts(
                    &sg.wu_model().schema.vars,
                    sg.wu_var_initialisers(),
                    sg.wu_var_modes(),
                    model.dt(),
                    |_| 1,
                ),
                ps_model: sg.ps_model().schema.name.clone(),
                ps_params: sg.ps_params().to_vec(),
                ps_derived_params: sg.ps_derived_params().to_vec(),
                ps_vars: variable_layouts(
                    &sg.ps_model().schema.vars,
                    sg.ps_var_initialisers(),
                    sg.ps_var_modes(),
                    model.dt(),
                    |_| 1,
                ),
                ps_target: sg.ps_model_target_name().to_string(),
                in_syn_var_mode: sg.in_syn_var_mode(),
                max_connections: sg.max_connections(),
                max_source_connections: sg.max_source_connections(),
                max_dendritic_delay_timesteps: sg.max_dendritic_delay_timesteps(),
                true_spike_required: sg.is_true_spike_required(),
                spike_event_required: sg.is_spike_event_required(),
                event_threshold_retest_required: sg.is_event_threshold_retest_required(),
                padded_kernel_id_range: sg.padded_kernel_id_range(),
                post_learn_range: sg.post_learn_range(),
                synapse_dynamics_range: sg.synapse_dynamics_range(),
                connectivity_init: sg.connectivity_initialiser().snippet().schema.name.clone(),
                connectivity: sg.connectivity().cloned(),
            })
            .collect();

        let current_sources = model
            .local_current_sources()
            .map(|cs| CurrentSourceLayout {
                name: cs.name().to_string(),
                model: cs.model().schema.name.clone(),
                target: cs.target_neuron_group().to_string(),
                params: cs.params().to_vec(),
                derived_params: cs.derived_params().to_vec(),
                vars: variable_layouts(
                    &cs.model().schema.vars,
                    cs.var_initialisers(),
                    cs.var_modes(),
                    model.dt(),
                    |_| 1,
                ),
            })
            .collect();

        Self {
            name: model.name().to_string(),
            precision: model.precision(),
            scalar_type: model.precision().c_type().to_string(),
            dt: model.dt(),
            timing: model.is_timing_enabled(),
            seed: model.seed(),
            rn_type: model.rn_type().to_string(),
            block_sizes: model.config().block_sizes,
            grid_sizes: model.grid_sizes(),
            reset_kernel: model.reset_kernel(),
            host_rng_required: model.is_host_rng_required(),
            device_rng_required: model.is_device_rng_required(),
            device_init_required: model.is_device_init_required(),
            device_sparse_init_required: model.is_device_sparse_init_required(),
            zero_copy_in_use: model.zero_copy_in_use(),
            num_pre_synapse_reset_required_groups: model.num_pre_synapse_reset_required_groups(),
            num_local_neurons: model.num_local_neurons(),
            num_remote_neurons: model.num_remote_neurons(),
            neuron_groups,
            remote_neuron_groups: model
                .remote_neuron_groups()
                .map(|ng| ng.name().to_string())
                .collect(),
            synapse_groups,
            current_sources,
            kernel_parameters: model.kernel_parameters().clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn find_neuron_group(&self, name: &str) -> Option<&NeuronGroupLayout> {
        self.neuron_groups.iter().find(|ng| ng.name == name)
    }

    pub fn find_synapse_group(&self, name: &str) -> Option<&SynapseGroupLayout> {
        self.synapse_groups.iter().find(|sg| sg.name == name)
    }
}
