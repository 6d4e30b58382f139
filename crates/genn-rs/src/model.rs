//! The network model graph and its one-shot finalization.
//!
//! A [`ModelSpec`] owns every population, synapse population and current
//! source by name. Entities refer to each other by name only; the model
//! resolves those references. Once [`ModelSpec::finalize`] has run the model
//! is closed and every mutating call fails with [`GennError::InvalidState`].

use crate::connectivity::ConnectivityInit;
use crate::current_source::CurrentSource;
use crate::grid::{GridAccumulator, GridSizes, KernelBlockSizes, KernelCategory, PaddedRange};
use crate::layout::ModelLayout;
use crate::models::{
    name_substitutions, references, value_substitutions, CurrentSourceModel, NameType,
    NeuronModel, PostsynapticModel, WeightUpdateModel,
};
use crate::neuron_group::{MergedInSyn, NeuronGroup};
use crate::sparse::RaggedProjection;
use crate::synapse_group::{
    SpanType, SynapseGroup, SynapseGroupInit, SynapseMatrixConnectivity, SynapseMatrixType,
};
use crate::var_init::{VarInit, VarInitDomain, VarMode};
use crate::{EntityKind, GennError, Result};
use oldies_core::{ClusterPlacement, Precision, Time};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Model-wide settings and preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Integration timestep (ms)
    pub dt: Time,
    pub precision: Precision,
    /// Emit timing instrumentation
    pub timing: bool,
    /// 0 seeds from the clock at runtime
    pub seed: u32,
    /// Underlying type of the random number generator
    pub rn_type: String,
    pub block_sizes: KernelBlockSizes,
    pub default_var_mode: VarMode,
    pub default_sparse_connectivity_mode: VarMode,
    /// Initialise individual weights of sparse groups on the device
    pub auto_init_sparse_vars: bool,
    pub merge_postsynaptic_models: bool,
    /// Host this process simulates
    pub local_host_id: u32,
    /// No accelerator available: everything runs on the host
    pub cpu_only: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dt: 0.5,
            precision: Precision::Float,
            timing: false,
            seed: 0,
            rn_type: "uint64_t".to_string(),
            block_sizes: KernelBlockSizes::default(),
            default_var_mode: VarMode::LocHostDeviceInitHost,
            default_sparse_connectivity_mode: VarMode::LocHostDeviceInitHost,
            auto_init_sparse_vars: false,
            merge_postsynaptic_models: false,
            local_host_id: 0,
            cpu_only: false,
        }
    }
}

impl ModelConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Extra global parameters passed to each generated kernel: name -> type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelParameters {
    pub neuron: BTreeMap<String, String>,
    pub synapse: BTreeMap<String, String>,
    pub post_learn: BTreeMap<String, String>,
    pub synapse_dynamics: BTreeMap<String, String>,
    pub init: BTreeMap<String, String>,
    pub current_source: BTreeMap<String, String>,
}

/// Add every parameter in `egps` referenced by `code`, suffixed with the owner name
fn insert_referenced(
    map: &mut BTreeMap<String, String>,
    egps: &[NameType],
    codes: &[&str],
    owner: &str,
) {
    for egp in egps {
        if codes.iter().any(|code| references(code, &egp.name, "")) {
            map.insert(format!("{}{}", egp.name, owner), egp.ty.clone());
        }
    }
}

/// Incoming synapse populations may share postsynaptic state
fn can_merge_postsynaptic(a: &SynapseGroup, b: &SynapseGroup) -> bool {
    Arc::ptr_eq(a.ps_model(), b.ps_model())
        && a.ps_model().schema.vars.is_empty()
        && a.ps_model().schema.extra_global_params.is_empty()
        && a.ps_params() == b.ps_params()
        && a.in_syn_var_mode() == b.in_syn_var_mode()
}

// ============================================================================
// MODEL
// ============================================================================

#[derive(Debug, Clone)]
pub struct ModelSpec {
    name: String,
    config: ModelConfig,

    neuron_groups: Vec<NeuronGroup>,
    neuron_index: HashMap<String, usize>,
    synapse_groups: Vec<SynapseGroup>,
    synapse_index: HashMap<String, usize>,
    current_sources: Vec<CurrentSource>,
    current_source_index: HashMap<String, usize>,

    synapse_post_learn_groups: Vec<(String, PaddedRange)>,
    synapse_dynamics_groups: Vec<(String, PaddedRange)>,
    kernel_parameters: KernelParameters,
    grid_sizes: GridSizes,
    reset_kernel: Option<KernelCategory>,
    finalized: bool,
}

impl ModelSpec {
    pub fn new(name: &str) -> Self {
        Self::with_config(name, ModelConfig::default())
    }

    pub fn with_config(name: &str, config: ModelConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            neuron_groups: Vec::new(),
            neuron_index: HashMap::new(),
            synapse_groups: Vec::new(),
            synapse_index: HashMap::new(),
            current_sources: Vec::new(),
            current_source_index: HashMap::new(),
            synapse_post_learn_groups: Vec::new(),
            synapse_dynamics_groups: Vec::new(),
            kernel_parameters: KernelParameters::default(),
            grid_sizes: GridSizes::default(),
            reset_kernel: None,
            finalized: false,
        }
    }

    fn check_open(&self, action: &str) -> Result<()> {
        if self.finalized {
            return Err(GennError::InvalidState(format!(
                "Trying to {} in a finalized model",
                action
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Model-wide scalars
    // ------------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn dt(&self) -> Time {
        self.config.dt
    }

    pub fn precision(&self) -> Precision {
        self.config.precision
    }

    pub fn is_timing_enabled(&self) -> bool {
        self.config.timing
    }

    pub fn seed(&self) -> u32 {
        self.config.seed
    }

    pub fn rn_type(&self) -> &str {
        &self.config.rn_type
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        self.check_open("set the name")?;
        self.name = name.to_string();
        Ok(())
    }

    pub fn set_dt(&mut self, dt: Time) -> Result<()> {
        self.check_open("set DT")?;
        self.config.dt = dt;
        Ok(())
    }

    pub fn set_precision(&mut self, precision: Precision) -> Result<()> {
        self.check_open("set the precision")?;
        self.config.precision = precision;
        Ok(())
    }

    pub fn set_timing(&mut self, timing: bool) -> Result<()> {
        self.check_open("set the timing flag")?;
        self.config.timing = timing;
        Ok(())
    }

    pub fn set_seed(&mut self, seed: u32) -> Result<()> {
        self.check_open("set the random seed")?;
        self.config.seed = seed;
        Ok(())
    }

    pub fn set_rn_type(&mut self, rn_type: &str) -> Result<()> {
        self.check_open("set the random number type")?;
        self.config.rn_type = rn_type.to_string();
        Ok(())
    }

    /// Literal for `value` in the model's precision
    pub fn scalar_expr(&self, value: f64) -> String {
        self.config.precision.scalar_expr(value)
    }

    // ------------------------------------------------------------------------
    // Builder
    // ------------------------------------------------------------------------

    pub fn add_neuron_population(
        &mut self,
        name: &str,
        size: usize,
        model: Arc<NeuronModel>,
        params: &[f64],
        var_initialisers: Vec<VarInit>,
    ) -> Result<&NeuronGroup> {
        self.add_neuron_population_on(
            name,
            size,
            model,
            params,
            var_initialisers,
            ClusterPlacement::default(),
        )
    }

    /// Add a population simulated on a specific host and device
    pub fn add_neuron_population_on(
        &mut self,
        name: &str,
        size: usize,
        model: Arc<NeuronModel>,
        params: &[f64],
        var_initialisers: Vec<VarInit>,
        placement: ClusterPlacement,
    ) -> Result<&NeuronGroup> {
        self.check_open("add a neuron population")?;
        if self.neuron_index.contains_key(name) {
            return Err(GennError::DuplicateName {
                kind: EntityKind::NeuronPopulation,
                name: name.to_string(),
            });
        }

        let group = NeuronGroup::new(
            name,
            size,
            model,
            params,
            var_initialisers,
            self.config.default_var_mode,
            placement,
        )?;
        debug!(population = name, size, host = placement.host_id, "added neuron population");

        let index = self.neuron_groups.len();
        self.neuron_groups.push(group);
        self.neuron_index.insert(name.to_string(), index);
        Ok(&self.neuron_groups[index])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_synapse_population(
        &mut self,
        name: &str,
        matrix_type: SynapseMatrixType,
        delay_steps: u32,
        src: &str,
        trg: &str,
        wu_model: Arc<WeightUpdateModel>,
        wu_params: &[f64],
        wu_var_initialisers: Vec<VarInit>,
        ps_model: Arc<PostsynapticModel>,
        ps_params: &[f64],
        ps_var_initialisers: Vec<VarInit>,
        connectivity_initialiser: ConnectivityInit,
    ) -> Result<&SynapseGroup> {
        self.check_open("add a synapse population")?;
        if self.synapse_index.contains_key(name) {
            return Err(GennError::DuplicateName {
                kind: EntityKind::SynapsePopulation,
                name: name.to_string(),
            });
        }

        let src_index = self.neuron_position(src)?;
        let trg_index = self.neuron_position(trg)?;
        let num_src = self.neuron_groups[src_index].num_neurons();
        let target = &self.neuron_groups[trg_index];

        let group = SynapseGroup::new(SynapseGroupInit {
            name,
            matrix_type,
            delay_steps,
            src,
            trg,
            num_src,
            num_trg: target.num_neurons(),
            placement: target.placement(),
            wu_model,
            wu_params,
            wu_var_initialisers,
            ps_model,
            ps_params,
            ps_var_initialisers,
            connectivity_initialiser,
            default_var_mode: self.config.default_var_mode,
            default_sparse_connectivity_mode: self.config.default_sparse_connectivity_mode,
        })?;
        debug!(synapses = name, src, trg, matrix = %matrix_type, "added synapse population");

        self.neuron_groups[src_index].add_out_syn(name);
        self.neuron_groups[trg_index].add_in_syn(name);
        let index = self.synapse_groups.len();
        self.synapse_groups.push(group);
        self.synapse_index.insert(name.to_string(), index);
        Ok(&self.synapse_groups[index])
    }

    pub fn add_current_source(
        &mut self,
        name: &str,
        model: Arc<CurrentSourceModel>,
        target: &str,
        params: &[f64],
        var_initialisers: Vec<VarInit>,
    ) -> Result<&CurrentSource> {
        self.check_open("add a current source")?;
        if self.current_source_index.contains_key(name) {
            return Err(GennError::DuplicateName {
                kind: EntityKind::CurrentSource,
                name: name.to_string(),
            });
        }

        let trg_index = self.neuron_position(target)?;
        let source = CurrentSource::new(
            name,
            model,
            target,
            self.neuron_groups[trg_index].placement(),
            params,
            var_initialisers,
            self.config.default_var_mode,
        )?;
        debug!(source = name, target, "added current source");

        self.neuron_groups[trg_index].add_current_source(name);
        let index = self.current_sources.len();
        self.current_sources.push(source);
        self.current_source_index.insert(name.to_string(), index);
        Ok(&self.current_sources[index])
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    fn neuron_position(&self, name: &str) -> Result<usize> {
        self.neuron_index
            .get(name)
            .copied()
            .ok_or_else(|| GennError::NotFound {
                kind: EntityKind::NeuronPopulation,
                name: name.to_string(),
            })
    }

    fn synapse_position(&self, name: &str) -> Result<usize> {
        self.synapse_index
            .get(name)
            .copied()
            .ok_or_else(|| GennError::NotFound {
                kind: EntityKind::SynapsePopulation,
                name: name.to_string(),
            })
    }

    fn current_source_position(&self, name: &str) -> Result<usize> {
        self.current_source_index
            .get(name)
            .copied()
            .ok_or_else(|| GennError::NotFound {
                kind: EntityKind::CurrentSource,
                name: name.to_string(),
            })
    }

    pub fn find_neuron_group(&self, name: &str) -> Result<&NeuronGroup> {
        Ok(&self.neuron_groups[self.neuron_position(name)?])
    }

    pub fn find_synapse_group(&self, name: &str) -> Result<&SynapseGroup> {
        Ok(&self.synapse_groups[self.synapse_position(name)?])
    }

    pub fn find_current_source(&self, name: &str) -> Result<&CurrentSource> {
        Ok(&self.current_sources[self.current_source_position(name)?])
    }

    /// All populations in declaration order
    pub fn neuron_groups(&self) -> &[NeuronGroup] {
        &self.neuron_groups
    }

    pub fn synapse_groups(&self) -> &[SynapseGroup] {
        &self.synapse_groups
    }

    pub fn current_sources(&self) -> &[CurrentSource] {
        &self.current_sources
    }

    pub fn local_neuron_groups(&self) -> impl Iterator<Item = &NeuronGroup> + '_ {
        let host = self.config.local_host_id;
        self.neuron_groups.iter().filter(move |n| n.placement().is_local(host))
    }

    pub fn remote_neuron_groups(&self) -> impl Iterator<Item = &NeuronGroup> + '_ {
        let host = self.config.local_host_id;
        self.neuron_groups.iter().filter(move |n| !n.placement().is_local(host))
    }

    pub fn local_synapse_groups(&self) -> impl Iterator<Item = &SynapseGroup> + '_ {
        let host = self.config.local_host_id;
        self.synapse_groups.iter().filter(move |s| s.placement().is_local(host))
    }

    pub fn local_current_sources(&self) -> impl Iterator<Item = &CurrentSource> + '_ {
        let host = self.config.local_host_id;
        self.current_sources.iter().filter(move |c| c.placement().is_local(host))
    }

    // ------------------------------------------------------------------------
    // Group configuration
    // ------------------------------------------------------------------------

    fn neuron_group_mut(&mut self, name: &str, action: &str) -> Result<&mut NeuronGroup> {
        self.check_open(action)?;
        let index = self.neuron_position(name)?;
        Ok(&mut self.neuron_groups[index])
    }

    fn synapse_group_mut(&mut self, name: &str, action: &str) -> Result<&mut SynapseGroup> {
        self.check_open(action)?;
        let index = self.synapse_position(name)?;
        Ok(&mut self.synapse_groups[index])
    }

    pub fn set_max_connections(&mut self, synapses: &str, max_connections: usize) -> Result<()> {
        self.synapse_group_mut(synapses, "set max connections")?
            .set_max_connections(max_connections)
    }

    pub fn set_max_source_connections(&mut self, synapses: &str, max_connections: usize) -> Result<()> {
        self.synapse_group_mut(synapses, "set max source connections")?
            .set_max_source_connections(max_connections)
    }

    pub fn set_span_type(&mut self, synapses: &str, span_type: SpanType) -> Result<()> {
        self.synapse_group_mut(synapses, "set the span type")?
            .set_span_type(span_type)
    }

    pub fn set_max_dendritic_delay_timesteps(&mut self, synapses: &str, timesteps: u32) -> Result<()> {
        self.synapse_group_mut(synapses, "set max dendritic delay")?
            .set_max_dendritic_delay_timesteps(timesteps);
        Ok(())
    }

    pub fn set_wu_var_mode(&mut self, synapses: &str, var: &str, mode: VarMode) -> Result<()> {
        self.synapse_group_mut(synapses, "set a weight update variable mode")?
            .set_wu_var_mode(var, mode)
    }

    pub fn set_ps_var_mode(&mut self, synapses: &str, var: &str, mode: VarMode) -> Result<()> {
        self.synapse_group_mut(synapses, "set a postsynaptic variable mode")?
            .set_ps_var_mode(var, mode)
    }

    pub fn set_in_syn_var_mode(&mut self, synapses: &str, mode: VarMode) -> Result<()> {
        self.synapse_group_mut(synapses, "set the input variable mode")?
            .set_in_syn_var_mode(mode);
        Ok(())
    }

    pub fn set_sparse_connectivity_var_mode(&mut self, synapses: &str, mode: VarMode) -> Result<()> {
        self.synapse_group_mut(synapses, "set the sparse connectivity mode")?
            .set_sparse_connectivity_var_mode(mode);
        Ok(())
    }

    /// Supply concrete connectivity for a sparse synapse population
    pub fn set_sparse_connectivity(&mut self, synapses: &str, projection: RaggedProjection) -> Result<()> {
        self.synapse_group_mut(synapses, "set sparse connectivity")?
            .set_connectivity(projection)
    }

    pub fn set_neuron_var_mode(&mut self, population: &str, var: &str, mode: VarMode) -> Result<()> {
        self.neuron_group_mut(population, "set a neuron variable mode")?
            .set_var_mode(var, mode)
    }

    pub fn set_neuron_spike_var_mode(&mut self, population: &str, mode: VarMode) -> Result<()> {
        self.neuron_group_mut(population, "set the spike variable mode")?
            .set_spike_var_mode(mode);
        Ok(())
    }

    pub fn set_current_source_var_mode(&mut self, source: &str, var: &str, mode: VarMode) -> Result<()> {
        self.check_open("set a current source variable mode")?;
        let index = self.current_source_position(source)?;
        self.current_sources[index].set_var_mode(var, mode)
    }

    // ------------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------------

    /// Derive all secondary state and close the model.
    ///
    /// A failed finalize leaves the model closed and partially derived; it
    /// must be rebuilt.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Err(GennError::InvalidState(
                "Your model has already been finalized".into(),
            ));
        }
        self.finalized = true;

        debug!(model = %self.name, "propagating spike event conditions");
        self.propagate_spike_events()?;

        debug!(model = %self.name, "initialising derived parameters");
        self.init_derived_params();

        debug!(model = %self.name, "propagating spike and variable queue requirements");
        self.propagate_queues()?;

        debug!(model = %self.name, "validating connectivity domains");
        self.validate_connectivity_domains()?;

        self.materialise_connectivity()?;
        self.merge_incoming_postsynaptic()?;
        self.collect_kernel_parameters();

        debug!(model = %self.name, "sizing kernel grids");
        self.set_population_sums()?;

        self.reset_kernel = Some(if self.local_synapse_groups().next().is_none() {
            KernelCategory::NeuronUpdate
        } else if !self.synapse_post_learn_groups.is_empty() {
            KernelCategory::PostsynapticLearning
        } else {
            KernelCategory::PresynapticUpdate
        });

        info!(
            model = %self.name,
            neuron_grid = self.grid_sizes.neuron,
            synapse_grid = self.grid_sizes.synapse,
            post_learn_grid = self.grid_sizes.post_learn,
            synapse_dynamics_grid = self.grid_sizes.synapse_dynamics,
            init_grid = self.grid_sizes.init,
            host_rng = self.is_host_rng_required(),
            device_rng = self.is_device_rng_required(),
            "model finalized"
        );
        Ok(())
    }

    fn propagate_spike_events(&mut self) -> Result<()> {
        let dt = self.config.dt;
        for ni in 0..self.neuron_groups.len() {
            let out_syn = self.neuron_groups[ni].out_syn().to_vec();
            let mut event_groups = Vec::new();
            for name in &out_syn {
                let si = self.synapse_position(name)?;
                let sg = &mut self.synapse_groups[si];
                let wu = Arc::clone(sg.wu_model());
                if !wu.has_event_code() {
                    continue;
                }
                if wu.event_threshold_condition_code.is_empty() {
                    return Err(GennError::UnsupportedConfiguration(format!(
                        "synapse population {} has event code but no event threshold condition",
                        name
                    )));
                }
                sg.set_spike_event_required();

                // Derived values are evaluated directly: they are not cached until the next step
                let mut code = wu.event_threshold_condition_code.clone();
                value_substitutions(&mut code, &wu.schema.param_names, sg.wu_params());
                value_substitutions(
                    &mut code,
                    &wu.schema.derived_param_names(),
                    &wu.schema.derive(sg.wu_params(), dt),
                );
                name_substitutions(&mut code, &wu.schema.extra_global_param_names(), name);
                let namespace = if wu.sim_support_code.is_empty() {
                    String::new()
                } else {
                    format!("{}_weightupdate_simCode", name)
                };

                self.neuron_groups[ni].add_spike_event_condition(code, namespace);
                event_groups.push(si);
            }

            if self.neuron_groups[ni].spike_event_conditions().len() > 1 {
                debug!(
                    population = self.neuron_groups[ni].name(),
                    conditions = self.neuron_groups[ni].spike_event_conditions().len(),
                    "event threshold must be re-tested per synapse population"
                );
                for si in event_groups {
                    self.synapse_groups[si].set_event_threshold_retest_required();
                }
            }
        }
        Ok(())
    }

    fn init_derived_params(&mut self) {
        let dt = self.config.dt;
        for ng in &mut self.neuron_groups {
            ng.init_derived_params(dt);
        }
        for sg in &mut self.synapse_groups {
            sg.init_derived_params(dt);
        }
        for cs in &mut self.current_sources {
            cs.init_derived_params(dt);
        }
    }

    fn propagate_queues(&mut self) -> Result<()> {
        for si in 0..self.synapse_groups.len() {
            let src = self.synapse_groups[si].src_neuron_group().to_string();
            let ni = self.neuron_position(&src)?;

            let sg = &mut self.synapse_groups[si];
            let wu = Arc::clone(sg.wu_model());
            let delay_steps = sg.delay_steps();
            if !wu.sim_code.is_empty() {
                sg.set_true_spike_required();
            }

            let ng = &mut self.neuron_groups[ni];
            ng.check_num_delay_slots(delay_steps);
            if !wu.sim_code.is_empty() {
                ng.set_true_spike_required();
            }
            for code in wu.codes() {
                if !code.is_empty() {
                    ng.update_var_queues(code);
                }
            }
        }
        Ok(())
    }

    fn validate_connectivity_domains(&self) -> Result<()> {
        for sg in &self.synapse_groups {
            let procedural = sg.matrix_type().connectivity() != SynapseMatrixConnectivity::Dense
                && !sg.connectivity_initialiser().is_uninitialised();
            if !procedural || !sg.matrix_type().has_individual_weights() {
                continue;
            }
            let connectivity_domain = sg.sparse_connectivity_var_mode().init_domain();
            for (var, mode) in sg.wu_model().schema.vars.iter().zip(sg.wu_var_modes()) {
                if mode.init_domain() != connectivity_domain {
                    return Err(GennError::CrossDomainMismatch {
                        group: sg.name().to_string(),
                        variable: var.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn materialise_connectivity(&mut self) -> Result<()> {
        for sg in self.synapse_groups.iter_mut().filter(|s| s.matrix_type().is_sparse()) {
            if sg.materialise_connectivity()? {
                debug!(synapses = sg.name(), "connectivity laid out on host");
            } else {
                warn!(
                    synapses = sg.name(),
                    "sparse synapse population has no host connectivity at finalize"
                );
            }
        }
        Ok(())
    }

    fn merge_incoming_postsynaptic(&mut self) -> Result<()> {
        let host = self.config.local_host_id;
        for ni in 0..self.neuron_groups.len() {
            if !self.neuron_groups[ni].placement().is_local(host) {
                continue;
            }
            let in_syn = self.neuron_groups[ni].in_syn().to_vec();
            let mut merged: Vec<MergedInSyn> = Vec::new();
            for name in &in_syn {
                let si = self.synapse_position(name)?;
                let existing = if self.config.merge_postsynaptic_models {
                    let candidate = &self.synapse_groups[si];
                    merged.iter().position(|m| {
                        self.synapse_index
                            .get(&m.target)
                            .is_some_and(|&ti| can_merge_postsynaptic(&self.synapse_groups[ti], candidate))
                    })
                } else {
                    None
                };

                match existing {
                    Some(mi) => {
                        merged[mi].members.push(name.clone());
                        let target = merged[mi].target.clone();
                        debug!(synapses = %name, target = %target, "merged postsynaptic model");
                        self.synapse_groups[si].set_ps_model_target_name(&target);
                    }
                    None => {
                        merged.push(MergedInSyn {
                            target: name.clone(),
                            members: vec![name.clone()],
                        });
                        self.synapse_groups[si].set_ps_model_target_name(name);
                    }
                }
            }
            self.neuron_groups[ni].set_merged_in_syn(merged);
        }
        Ok(())
    }

    fn collect_kernel_parameters(&mut self) {
        let mut params = KernelParameters::default();
        for ng in self.local_neuron_groups() {
            for egp in &ng.model().schema.extra_global_params {
                params
                    .neuron
                    .insert(format!("{}{}", egp.name, ng.name()), egp.ty.clone());
            }
        }
        for sg in self.local_synapse_groups() {
            let wu = sg.wu_model();
            let egps = &wu.schema.extra_global_params;
            insert_referenced(
                &mut params.neuron,
                egps,
                &[wu.event_threshold_condition_code.as_str()],
                sg.name(),
            );
            insert_referenced(
                &mut params.synapse,
                egps,
                &[
                    wu.sim_code.as_str(),
                    wu.event_code.as_str(),
                    wu.event_threshold_condition_code.as_str(),
                ],
                sg.name(),
            );
            insert_referenced(&mut params.post_learn, egps, &[wu.learn_post_code.as_str()], sg.name());
            insert_referenced(
                &mut params.synapse_dynamics,
                egps,
                &[wu.synapse_dynamics_code.as_str()],
                sg.name(),
            );

            let snippet = sg.connectivity_initialiser().snippet();
            insert_referenced(
                &mut params.init,
                &snippet.schema.extra_global_params,
                &[snippet.row_build_code.as_str()],
                sg.name(),
            );
        }
        for cs in self.local_current_sources() {
            for egp in &cs.model().schema.extra_global_params {
                params
                    .current_source
                    .insert(format!("{}{}", egp.name, cs.name()), egp.ty.clone());
            }
        }
        self.kernel_parameters = params;
    }

    fn set_population_sums(&mut self) -> Result<()> {
        let host = self.config.local_host_id;
        let blocks = self.config.block_sizes;
        let grid = |category| GridAccumulator::new(blocks.for_category(category));

        let mut neuron_id = 0;
        let mut neuron_grid = grid(KernelCategory::NeuronUpdate);
        let mut init_grid = grid(KernelCategory::Initialization);
        for ng in self.neuron_groups.iter_mut().filter(|n| n.placement().is_local(host)) {
            ng.calc_sizes(&mut neuron_id, &mut neuron_grid)?;
            if ng.is_device_init_required() {
                init_grid.allocate(ng.num_neurons())?;
            }
            debug!(population = ng.name(), range = ?ng.padded_id_range(), "sized neuron population");
        }

        let mut synapse_grid = grid(KernelCategory::PresynapticUpdate);
        let mut learn_grid = grid(KernelCategory::PostsynapticLearning);
        let mut dynamics_grid = grid(KernelCategory::SynapseDynamics);
        let mut init_sparse_grid = grid(KernelCategory::SparseInitialization);
        let auto_init_sparse = self.config.auto_init_sparse_vars;
        self.synapse_post_learn_groups.clear();
        self.synapse_dynamics_groups.clear();
        for sg in self.synapse_groups.iter_mut().filter(|s| s.placement().is_local(host)) {
            let range = synapse_grid.allocate(sg.main_kernel_size())?;
            sg.set_padded_kernel_id_range(range);

            if sg.wu_model().has_learn_post_code() {
                let range = learn_grid.allocate(sg.post_learn_kernel_size())?;
                sg.set_post_learn_range(range);
                self.synapse_post_learn_groups.push((sg.name().to_string(), range));
            }
            if sg.wu_model().has_synapse_dynamics_code() {
                let range = dynamics_grid.allocate(sg.synapse_dynamics_kernel_size())?;
                sg.set_synapse_dynamics_range(range);
                self.synapse_dynamics_groups.push((sg.name().to_string(), range));
            }

            // One thread per row for connectivity, one per target for dense state
            if sg.is_device_sparse_connectivity_init_required() {
                init_grid.allocate(sg.num_src())?;
            } else if !sg.matrix_type().is_sparse() && sg.is_device_init_required() {
                init_grid.allocate(sg.num_trg())?;
            }
            if auto_init_sparse && sg.is_device_sparse_init_required() {
                init_sparse_grid.allocate(sg.max_connections())?;
            }
            debug!(synapses = sg.name(), range = ?sg.padded_kernel_id_range(), "sized synapse population");
        }

        self.grid_sizes = GridSizes {
            neuron: neuron_grid.total(),
            synapse: synapse_grid.total(),
            post_learn: learn_grid.total(),
            synapse_dynamics: dynamics_grid.total(),
            init: init_grid.total(),
            init_sparse: init_sparse_grid.total(),
        };
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Finalized queries
    // ------------------------------------------------------------------------

    pub fn grid_sizes(&self) -> GridSizes {
        self.grid_sizes
    }

    pub fn neuron_grid_size(&self) -> usize {
        self.grid_sizes.neuron
    }

    pub fn synapse_kernel_grid_size(&self) -> usize {
        self.grid_sizes.synapse
    }

    pub fn synapse_post_learn_grid_size(&self) -> usize {
        self.grid_sizes.post_learn
    }

    pub fn synapse_dynamics_grid_size(&self) -> usize {
        self.grid_sizes.synapse_dynamics
    }

    pub fn init_grid_size(&self) -> usize {
        self.grid_sizes.init
    }

    pub fn init_sparse_grid_size(&self) -> usize {
        self.grid_sizes.init_sparse
    }

    /// Groups with postsynaptic learning and their learning kernel ranges
    pub fn synapse_post_learn_groups(&self) -> &[(String, PaddedRange)] {
        &self.synapse_post_learn_groups
    }

    /// Groups with synapse dynamics and their dynamics kernel ranges
    pub fn synapse_dynamics_groups(&self) -> &[(String, PaddedRange)] {
        &self.synapse_dynamics_groups
    }

    pub fn is_synapse_group_post_learning_required(&self, name: &str) -> bool {
        self.synapse_post_learn_groups.iter().any(|(n, _)| n == name)
    }

    pub fn is_synapse_group_dynamics_required(&self, name: &str) -> bool {
        self.synapse_dynamics_groups.iter().any(|(n, _)| n == name)
    }

    pub fn kernel_parameters(&self) -> &KernelParameters {
        &self.kernel_parameters
    }

    /// Kernel that resets spike counters each timestep
    pub fn reset_kernel(&self) -> Option<KernelCategory> {
        self.reset_kernel
    }

    pub fn num_local_neurons(&self) -> usize {
        self.local_neuron_groups().map(NeuronGroup::num_neurons).sum()
    }

    pub fn num_remote_neurons(&self) -> usize {
        self.remote_neuron_groups().map(NeuronGroup::num_neurons).sum()
    }

    /// Simulation-time randomness for a population, including its current sources
    pub(crate) fn neuron_sim_rng_required(&self, ng: &NeuronGroup) -> bool {
        ng.model().is_sim_rng_required()
            || ng.current_sources().iter().any(|name| {
                self.current_source_index
                    .get(name)
                    .is_some_and(|&i| self.current_sources[i].is_sim_rng_required())
            })
    }

    pub fn is_sim_rng_required(&self, population: &str) -> Result<bool> {
        Ok(self.neuron_sim_rng_required(self.find_neuron_group(population)?))
    }

    pub fn can_run_on_cpu(&self) -> bool {
        self.config.cpu_only
            || (self.local_neuron_groups().all(NeuronGroup::can_run_on_cpu)
                && self.local_synapse_groups().all(SynapseGroup::can_run_on_cpu)
                && self.local_current_sources().all(CurrentSource::can_run_on_cpu))
    }

    pub fn is_host_rng_required(&self) -> bool {
        let cpu = self.can_run_on_cpu();
        self.local_neuron_groups().any(|ng| {
            (cpu && self.neuron_sim_rng_required(ng)) || ng.is_init_rng_required(VarInitDomain::Host)
        }) || self
            .local_synapse_groups()
            .any(|sg| {
                sg.is_wu_init_rng_required(VarInitDomain::Host)
                    || sg.is_ps_init_rng_required(VarInitDomain::Host)
            })
            || self
                .local_current_sources()
                .any(|cs| cs.is_init_rng_required(VarInitDomain::Host))
    }

    pub fn is_device_rng_required(&self) -> bool {
        if self.config.cpu_only {
            return false;
        }
        self.local_neuron_groups()
            .any(|ng| ng.is_init_rng_required(VarInitDomain::Device))
            || self
                .local_synapse_groups()
                .any(|sg| {
                    sg.is_wu_init_rng_required(VarInitDomain::Device)
                        || sg.is_ps_init_rng_required(VarInitDomain::Device)
                })
            || self
                .local_current_sources()
                .any(|cs| cs.is_init_rng_required(VarInitDomain::Device))
    }

    pub fn zero_copy_in_use(&self) -> bool {
        self.local_neuron_groups().any(NeuronGroup::is_zero_copy_enabled)
            || self.local_synapse_groups().any(SynapseGroup::is_zero_copy_enabled)
            || self.local_current_sources().any(CurrentSource::is_zero_copy_enabled)
    }

    /// Synapse populations with dendritic delay buffers to advance each step
    pub fn num_pre_synapse_reset_required_groups(&self) -> usize {
        self.local_synapse_groups()
            .filter(|sg| sg.is_dendritic_delay_required())
            .count()
    }

    pub fn is_pre_synapse_reset_required(&self) -> bool {
        self.num_pre_synapse_reset_required_groups() > 0
    }

    /// Does any outgoing synapse population of `ng` live on this host?
    fn has_output_to_local_host(&self, ng: &NeuronGroup) -> bool {
        let host = self.config.local_host_id;
        ng.out_syn().iter().any(|name| {
            self.synapse_index
                .get(name)
                .is_some_and(|&i| self.synapse_groups[i].placement().is_local(host))
        })
    }

    pub fn is_device_init_required(&self) -> bool {
        if self.is_device_rng_required() {
            return true;
        }
        self.local_neuron_groups().any(NeuronGroup::is_device_init_required)
            || self.remote_neuron_groups().any(|ng| {
                self.has_output_to_local_host(ng)
                    && ng.spike_var_mode().inits_on(VarInitDomain::Device)
            })
            || self.local_synapse_groups().any(SynapseGroup::is_device_init_required)
            || self.local_current_sources().any(CurrentSource::is_device_init_required)
    }

    pub fn is_device_sparse_init_required(&self) -> bool {
        self.config.auto_init_sparse_vars
            && self
                .local_synapse_groups()
                .any(SynapseGroup::is_device_sparse_init_required)
    }

    /// Layout handed to code emitters; only available once finalized
    pub fn layout(&self) -> Result<ModelLayout> {
        if !self.finalized {
            return Err(GennError::InvalidState(
                "the model must be finalized before its layout is emitted".into(),
            ));
        }
        Ok(ModelLayout::from_model(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{current_source, neuron, postsynaptic, weight_update, ModelSchema};

    fn izhikevich_params() -> [f64; 4] {
        [0.02, 0.2, -65.0, 8.0]
    }

    fn izhikevich_vars() -> Vec<VarInit> {
        vec![VarInit::constant(-65.0), VarInit::constant(-13.0)]
    }

    fn add_izhikevich(model: &mut ModelSpec, name: &str, size: usize) {
        model
            .add_neuron_population(name, size, neuron::izhikevich(), &izhikevich_params(), izhikevich_vars())
            .unwrap();
    }

    fn add_static(model: &mut ModelSpec, name: &str, src: &str, trg: &str, delay: u32) {
        model
            .add_synapse_population(
                name,
                SynapseMatrixType::DENSE_INDIVIDUALG,
                delay,
                src,
                trg,
                weight_update::static_pulse(),
                &[],
                vec![VarInit::constant(0.1)],
                postsynaptic::delta_curr(),
                &[],
                vec![],
                ConnectivityInit::uninitialised(),
            )
            .unwrap();
    }

    fn add_graded(model: &mut ModelSpec, name: &str, src: &str, trg: &str, epre: f64) {
        model
            .add_synapse_population(
                name,
                SynapseMatrixType::DENSE_GLOBALG,
                0,
                src,
                trg,
                weight_update::static_graded(),
                &[epre, 2.0],
                vec![VarInit::constant(0.5)],
                postsynaptic::delta_curr(),
                &[],
                vec![],
                ConnectivityInit::uninitialised(),
            )
            .unwrap();
    }

    fn add_stdp_sparse(model: &mut ModelSpec, name: &str, src: &str, trg: &str) {
        model
            .add_synapse_population(
                name,
                SynapseMatrixType::SPARSE_INDIVIDUALG,
                0,
                src,
                trg,
                weight_update::stdp_additive(),
                &[20.0, 20.0, 0.1, 0.105, 0.0, 1.0],
                vec![VarInit::constant(0.5)],
                postsynaptic::exp_curr(),
                &[5.0],
                vec![],
                ConnectivityInit::uninitialised(),
            )
            .unwrap();
    }

    #[test]
    fn test_sparse_feedback_scenario() {
        let config = ModelConfig {
            block_sizes: KernelBlockSizes {
                synapse: 8,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut model = ModelSpec::with_config("scenario", config);
        model
            .add_neuron_population("Pre", 10, neuron::spike_source(), &[], vec![])
            .unwrap();
        add_izhikevich(&mut model, "Post", 4);
        add_stdp_sparse(&mut model, "Syn", "Pre", "Post");

        let rows = vec![vec![0u32]; 10];
        model
            .set_sparse_connectivity("Syn", RaggedProjection::from_rows(4, &rows).unwrap())
            .unwrap();
        model.finalize().unwrap();

        let sg = model.find_synapse_group("Syn").unwrap();
        let range = sg.padded_kernel_id_range().unwrap();
        assert_eq!(range.len(), 16);
        assert_eq!(model.synapse_kernel_grid_size(), 16);

        let proj = sg.connectivity().unwrap();
        assert_eq!(proj.row_length(), &[1; 10]);
        assert_eq!(proj.max_row_length(), 4);
        let rev = proj.reverse().unwrap();
        assert_eq!(rev.col_length()[0], 10);
        assert_eq!(&rev.col_length()[1..], &[0, 0, 0]);

        assert!(model.is_synapse_group_post_learning_required("Syn"));
        assert_eq!(model.synapse_post_learn_grid_size(), 32);
        assert_eq!(model.reset_kernel(), Some(KernelCategory::PostsynapticLearning));
    }

    #[test]
    fn test_differing_event_conditions_require_retest() {
        let mut model = ModelSpec::new("events");
        add_izhikevich(&mut model, "Pre", 10);
        add_izhikevich(&mut model, "Post", 10);
        add_graded(&mut model, "GradedA", "Pre", "Post", -50.0);
        add_graded(&mut model, "GradedB", "Pre", "Post", -40.0);
        model.finalize().unwrap();

        let pre = model.find_neuron_group("Pre").unwrap();
        assert!(pre.is_spike_event_required());
        let conditions: Vec<_> = pre.spike_event_conditions().iter().map(|c| c.code.as_str()).collect();
        assert_eq!(conditions, vec!["$(V_pre) > (-40)", "$(V_pre) > (-50)"]);
        for name in ["GradedA", "GradedB"] {
            let sg = model.find_synapse_group(name).unwrap();
            assert!(sg.is_spike_event_required());
            assert!(sg.is_event_threshold_retest_required());
        }
    }

    #[test]
    fn test_identical_event_conditions_share_storage() {
        let mut model = ModelSpec::new("events");
        add_izhikevich(&mut model, "Pre", 10);
        add_izhikevich(&mut model, "Post", 10);
        add_graded(&mut model, "GradedA", "Pre", "Post", -50.0);
        add_graded(&mut model, "GradedB", "Pre", "Post", -50.0);
        model.finalize().unwrap();

        assert_eq!(model.find_neuron_group("Pre").unwrap().spike_event_conditions().len(), 1);
        assert!(!model.find_synapse_group("GradedA").unwrap().is_event_threshold_retest_required());
    }

    #[test]
    fn test_finalize_twice() {
        let mut model = ModelSpec::new("twice");
        add_izhikevich(&mut model, "A", 100);
        model.finalize().unwrap();
        let before = model.grid_sizes();
        let range = model.find_neuron_group("A").unwrap().padded_id_range();

        assert!(matches!(model.finalize(), Err(GennError::InvalidState(_))));
        assert_eq!(model.grid_sizes(), before);
        assert_eq!(model.find_neuron_group("A").unwrap().padded_id_range(), range);
    }

    #[test]
    fn test_duplicate_names_do_not_mutate() {
        let mut model = ModelSpec::new("dup");
        add_izhikevich(&mut model, "A", 10);
        add_izhikevich(&mut model, "B", 10);
        add_static(&mut model, "AB", "A", "B", 0);

        let err = model
            .add_neuron_population("A", 99, neuron::spike_source(), &[], vec![])
            .unwrap_err();
        assert!(matches!(err, GennError::DuplicateName { kind: EntityKind::NeuronPopulation, .. }));
        assert_eq!(model.neuron_groups().len(), 2);
        assert_eq!(model.find_neuron_group("A").unwrap().num_neurons(), 10);

        let err = model
            .add_synapse_population(
                "AB",
                SynapseMatrixType::DENSE_GLOBALG,
                0,
                "B",
                "A",
                weight_update::static_pulse(),
                &[],
                vec![VarInit::constant(0.1)],
                postsynaptic::delta_curr(),
                &[],
                vec![],
                ConnectivityInit::uninitialised(),
            )
            .unwrap_err();
        assert!(matches!(err, GennError::DuplicateName { .. }));
        assert_eq!(model.synapse_groups().len(), 1);
        assert!(model.find_neuron_group("B").unwrap().out_syn().is_empty());
        assert!(model.find_neuron_group("A").unwrap().in_syn().is_empty());
    }

    #[test]
    fn test_lookup_and_arity_errors() {
        let mut model = ModelSpec::new("errors");
        add_izhikevich(&mut model, "A", 10);
        assert!(matches!(
            model.find_synapse_group("missing"),
            Err(GennError::NotFound { kind: EntityKind::SynapsePopulation, .. })
        ));

        let err = model
            .add_synapse_population(
                "S",
                SynapseMatrixType::DENSE_GLOBALG,
                0,
                "A",
                "Nowhere",
                weight_update::static_pulse(),
                &[],
                vec![VarInit::constant(0.1)],
                postsynaptic::delta_curr(),
                &[],
                vec![],
                ConnectivityInit::uninitialised(),
            )
            .unwrap_err();
        assert!(matches!(err, GennError::NotFound { .. }));

        let err = model
            .add_synapse_population(
                "S",
                SynapseMatrixType::DENSE_GLOBALG,
                0,
                "A",
                "A",
                weight_update::static_pulse(),
                &[],
                vec![],
                postsynaptic::delta_curr(),
                &[],
                vec![],
                ConnectivityInit::uninitialised(),
            )
            .unwrap_err();
        assert!(matches!(err, GennError::ArityMismatch { expected: 1, actual: 0, .. }));
        assert!(model.find_neuron_group("A").unwrap().out_syn().is_empty());
    }

    #[test]
    fn test_mutation_after_finalize() {
        let mut model = ModelSpec::new("closed");
        add_izhikevich(&mut model, "A", 10);
        add_stdp_sparse(&mut model, "AA", "A", "A");
        model.finalize().unwrap();

        assert!(matches!(
            model.add_neuron_population("B", 1, neuron::spike_source(), &[], vec![]),
            Err(GennError::InvalidState(_))
        ));
        assert!(matches!(model.set_dt(0.1), Err(GennError::InvalidState(_))));
        assert!(matches!(model.set_seed(7), Err(GennError::InvalidState(_))));
        assert!(matches!(model.set_max_connections("AA", 3), Err(GennError::InvalidState(_))));
        assert!(matches!(
            model.set_neuron_var_mode("A", "V", VarMode::LocDeviceInitDevice),
            Err(GennError::InvalidState(_))
        ));
        assert_eq!(model.dt(), 0.5);
    }

    #[test]
    fn test_grid_ranges_monotonic_and_padded() {
        let mut model = ModelSpec::new("grid");
        for (i, size) in [1usize, 33, 64, 0, 100].iter().enumerate() {
            model
                .add_neuron_population(&format!("N{}", i), *size, neuron::spike_source(), &[], vec![])
                .unwrap();
        }
        add_static(&mut model, "S0", "N1", "N4", 0);
        add_static(&mut model, "S1", "N4", "N2", 0);
        add_static(&mut model, "S2", "N0", "N1", 0);
        model.finalize().unwrap();

        let mut last_end = 0;
        for ng in model.neuron_groups() {
            let range = ng.padded_id_range().unwrap();
            assert_eq!(range.start, last_end);
            assert!(range.end >= last_end);
            assert_eq!(range.len() % 32, 0);
            assert!(range.len() >= ng.num_neurons());
            last_end = range.end;
        }
        assert_eq!(model.neuron_grid_size(), last_end);
        assert_eq!(last_end, 32 + 64 + 64 + 0 + 128);

        let mut last_end = 0;
        for sg in model.synapse_groups() {
            let range = sg.padded_kernel_id_range().unwrap();
            assert!(range.end >= last_end);
            assert_eq!(range.len() % 32, 0);
            last_end = range.end;
        }
        assert_eq!(model.synapse_kernel_grid_size(), 128 + 64 + 64);
        assert_eq!(model.num_local_neurons(), 198);
    }

    #[test]
    fn test_empty_model() {
        let mut model = ModelSpec::new("empty");
        model.finalize().unwrap();
        assert_eq!(model.grid_sizes(), GridSizes::default());
        assert_eq!(model.reset_kernel(), Some(KernelCategory::NeuronUpdate));
        assert!(!model.is_host_rng_required());
        assert!(!model.is_device_rng_required());
    }

    #[test]
    fn test_reset_kernel_without_learning() {
        let mut model = ModelSpec::new("reset");
        add_izhikevich(&mut model, "A", 10);
        add_static(&mut model, "AA", "A", "A", 0);
        model.finalize().unwrap();
        assert_eq!(model.reset_kernel(), Some(KernelCategory::PresynapticUpdate));
    }

    #[test]
    fn test_delay_slots_and_var_queues() {
        let mut model = ModelSpec::new("delays");
        add_izhikevich(&mut model, "Pre", 10);
        add_izhikevich(&mut model, "Post", 10);
        model
            .add_synapse_population(
                "Continuous",
                SynapseMatrixType::DENSE_INDIVIDUALG,
                3,
                "Pre",
                "Post",
                weight_update::graded_continuous(),
                &[],
                vec![VarInit::constant(0.1)],
                postsynaptic::delta_curr(),
                &[],
                vec![],
                ConnectivityInit::uninitialised(),
            )
            .unwrap();
        add_static(&mut model, "Fast", "Post", "Pre", 1);
        model.finalize().unwrap();

        let pre = model.find_neuron_group("Pre").unwrap();
        assert_eq!(pre.num_delay_slots(), 4);
        assert!(pre.is_var_queue_required("V"));
        assert_eq!(pre.var_storage_slots("V"), 4);
        assert_eq!(pre.var_storage_slots("U"), 1);
        assert!(!pre.is_true_spike_required());

        let post = model.find_neuron_group("Post").unwrap();
        assert_eq!(post.num_delay_slots(), 2);
        assert!(post.is_true_spike_required());
        assert!(!post.is_var_queue_required("V"));

        assert!(model.is_synapse_group_dynamics_required("Continuous"));
        assert_eq!(model.synapse_dynamics_grid_size(), 128);
    }

    #[test]
    fn test_cross_domain_mismatch() {
        let mut model = ModelSpec::new("domains");
        add_izhikevich(&mut model, "A", 100);
        model
            .add_synapse_population(
                "Random",
                SynapseMatrixType::SPARSE_INDIVIDUALG,
                0,
                "A",
                "A",
                weight_update::static_pulse(),
                &[],
                vec![VarInit::uniform(0.0, 1.0)],
                postsynaptic::delta_curr(),
                &[],
                vec![],
                ConnectivityInit::fixed_probability(0.1),
            )
            .unwrap();
        model
            .set_wu_var_mode("Random", "g", VarMode::LocHostDeviceInitDevice)
            .unwrap();

        match model.finalize() {
            Err(GennError::CrossDomainMismatch { group, variable }) => {
                assert_eq!(group, "Random");
                assert_eq!(variable, "g");
            }
            other => panic!("expected cross-domain mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_device_connectivity_is_left_unmaterialised() {
        let mut model = ModelSpec::new("device");
        add_izhikevich(&mut model, "A", 100);
        model
            .add_synapse_population(
                "Random",
                SynapseMatrixType::SPARSE_INDIVIDUALG,
                0,
                "A",
                "A",
                weight_update::static_pulse(),
                &[],
                vec![VarInit::uniform(0.0, 1.0)],
                postsynaptic::delta_curr(),
                &[],
                vec![],
                ConnectivityInit::fixed_probability(0.1),
            )
            .unwrap();
        model
            .set_wu_var_mode("Random", "g", VarMode::LocHostDeviceInitDevice)
            .unwrap();
        model
            .set_sparse_connectivity_var_mode("Random", VarMode::LocHostDeviceInitDevice)
            .unwrap();
        model.finalize().unwrap();

        let sg = model.find_synapse_group("Random").unwrap();
        assert!(sg.connectivity().is_none());
        assert!(model.is_device_rng_required());
        assert!(model.is_device_init_required());
        assert!(!model.is_device_sparse_init_required());
    }

    #[test]
    fn test_one_to_one_built_on_host() {
        let mut model = ModelSpec::new("host");
        add_izhikevich(&mut model, "A", 5);
        model
            .add_synapse_population(
                "Diag",
                SynapseMatrixType::SPARSE_INDIVIDUALG,
                0,
                "A",
                "A",
                weight_update::graded_continuous(),
                &[],
                vec![VarInit::constant(0.2)],
                postsynaptic::delta_curr(),
                &[],
                vec![],
                ConnectivityInit::one_to_one(),
            )
            .unwrap();
        model.finalize().unwrap();

        let sg = model.find_synapse_group("Diag").unwrap();
        let proj = sg.connectivity().unwrap();
        assert_eq!(proj.num_synapses(), 5);
        assert_eq!(proj.syn_remap().unwrap(), &[5, 0, 1, 2, 3, 4]);
        assert!(proj.reverse().is_none());
        assert_eq!(sg.synapse_dynamics_kernel_size(), 5);
    }

    #[test]
    fn test_rng_requirements() {
        let mut model = ModelSpec::new("rng");
        model
            .add_neuron_population("Stim", 10, neuron::poisson(), &[20.0], vec![VarInit::constant(0.0)])
            .unwrap();
        model.finalize().unwrap();
        assert!(model.is_host_rng_required());
        assert!(model.is_sim_rng_required("Stim").unwrap());
        assert!(!model.is_device_rng_required());

        let mut model = ModelSpec::new("rng_device");
        model
            .add_neuron_population("Stim", 10, neuron::poisson(), &[20.0], vec![VarInit::constant(0.0)])
            .unwrap();
        model
            .set_neuron_var_mode("Stim", "timeStepToSpike", VarMode::LocDeviceInitDevice)
            .unwrap();
        model.finalize().unwrap();
        // Device-only state: no host simulation, no host RNG
        assert!(!model.can_run_on_cpu());
        assert!(!model.is_host_rng_required());

        let mut model = ModelSpec::new("rng_init");
        model
            .add_neuron_population(
                "Exc",
                10,
                neuron::izhikevich(),
                &izhikevich_params(),
                vec![VarInit::uniform(-70.0, -60.0), VarInit::constant(-13.0)],
            )
            .unwrap();
        model
            .set_neuron_var_mode("Exc", "V", VarMode::LocHostDeviceInitDevice)
            .unwrap();
        model.finalize().unwrap();
        assert!(model.is_device_rng_required());
        assert!(!model.is_host_rng_required());
    }

    #[test]
    fn test_current_sources() {
        let mut model = ModelSpec::new("inputs");
        add_izhikevich(&mut model, "Exc", 10);
        model
            .add_current_source("Noise", current_source::gaussian_noise(), "Exc", &[0.0, 1.0], vec![])
            .unwrap();
        assert!(matches!(
            model.add_current_source("Noise", current_source::dc(), "Exc", &[1.0], vec![]),
            Err(GennError::DuplicateName { kind: EntityKind::CurrentSource, .. })
        ));
        assert!(matches!(
            model.add_current_source("Missing", current_source::dc(), "Inh", &[1.0], vec![]),
            Err(GennError::NotFound { .. })
        ));
        model.finalize().unwrap();

        assert_eq!(model.find_neuron_group("Exc").unwrap().current_sources(), &["Noise".to_string()]);
        assert!(model.is_sim_rng_required("Exc").unwrap());
        assert!(model.is_host_rng_required());
    }

    #[test]
    fn test_postsynaptic_merging() {
        let config = ModelConfig {
            merge_postsynaptic_models: true,
            ..Default::default()
        };
        let mut model = ModelSpec::with_config("merge", config);
        add_izhikevich(&mut model, "A", 10);
        add_izhikevich(&mut model, "B", 10);
        for (name, tau) in [("AB1", 5.0), ("AB2", 5.0), ("AB3", 10.0)] {
            model
                .add_synapse_population(
                    name,
                    SynapseMatrixType::DENSE_GLOBALG,
                    0,
                    "A",
                    "B",
                    weight_update::static_pulse(),
                    &[],
                    vec![VarInit::constant(0.1)],
                    postsynaptic::exp_curr(),
                    &[tau],
                    vec![],
                    ConnectivityInit::uninitialised(),
                )
                .unwrap();
        }
        model.finalize().unwrap();

        let merged = model.find_neuron_group("B").unwrap().merged_in_syn();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].members, vec!["AB1".to_string(), "AB2".to_string()]);
        assert_eq!(model.find_synapse_group("AB2").unwrap().ps_model_target_name(), "AB1");
        assert!(model.find_synapse_group("AB2").unwrap().is_ps_model_merged());
        assert!(!model.find_synapse_group("AB3").unwrap().is_ps_model_merged());
    }

    #[test]
    fn test_no_merging_by_default() {
        let mut model = ModelSpec::new("nomerge");
        add_izhikevich(&mut model, "A", 10);
        add_static(&mut model, "S1", "A", "A", 0);
        add_static(&mut model, "S2", "A", "A", 0);
        model.finalize().unwrap();
        assert_eq!(model.find_neuron_group("A").unwrap().merged_in_syn().len(), 2);
    }

    #[test]
    fn test_derived_params_cached() {
        let mut model = ModelSpec::new("derived");
        model.set_dt(0.1).unwrap();
        model
            .add_neuron_population(
                "LIF",
                10,
                neuron::lif(),
                &[0.25, 10.0, -65.0, -65.0, -50.0, 0.0, 2.0],
                vec![VarInit::constant(-65.0), VarInit::constant(0.0)],
            )
            .unwrap();
        model.finalize().unwrap();
        let derived = model.find_neuron_group("LIF").unwrap().derived_params();
        assert!((derived[0] - (-0.01f64).exp()).abs() < 1e-12);
        assert!((derived[1] - 40.0).abs() < 1e-12);
    }

    #[test]
    fn test_kernel_parameters() {
        let rates = Arc::new(NeuronModel {
            schema: ModelSchema::new("RateSource").with_extra_global_params(&[("rates", "scalar*")]),
            threshold_condition_code: "$(gennrand_uniform) < $(rates)[$(id)]".into(),
            ..Default::default()
        });
        let mut model = ModelSpec::new("egp");
        model.add_neuron_population("Input", 10, rates, &[], vec![]).unwrap();
        model.finalize().unwrap();
        assert_eq!(
            model.kernel_parameters().neuron.get("ratesInput").map(String::as_str),
            Some("scalar*")
        );
        assert!(model.is_sim_rng_required("Input").unwrap());
    }

    #[test]
    fn test_remote_populations() {
        let mut model = ModelSpec::new("cluster");
        add_izhikevich(&mut model, "Local", 10);
        model
            .add_neuron_population_on(
                "Remote",
                20,
                neuron::izhikevich(),
                &izhikevich_params(),
                izhikevich_vars(),
                ClusterPlacement::new(1, 0),
            )
            .unwrap();
        add_static(&mut model, "ToRemote", "Local", "Remote", 0);
        add_static(&mut model, "FromRemote", "Remote", "Local", 0);
        model
            .set_neuron_spike_var_mode("Remote", VarMode::LocDeviceInitDevice)
            .unwrap();
        model.finalize().unwrap();

        assert_eq!(model.num_local_neurons(), 10);
        assert_eq!(model.num_remote_neurons(), 20);
        assert_eq!(model.neuron_grid_size(), 32);
        assert!(model.find_neuron_group("Remote").unwrap().padded_id_range().is_none());
        assert!(model.find_synapse_group("ToRemote").unwrap().padded_kernel_id_range().is_none());
        assert!(model.find_synapse_group("FromRemote").unwrap().padded_kernel_id_range().is_some());
        // Remote spikes arriving here are initialised on the device
        assert!(model.is_device_init_required());
    }

    #[test]
    fn test_dendritic_delay_reset() {
        let mut model = ModelSpec::new("dendritic");
        add_izhikevich(&mut model, "A", 10);
        model
            .add_synapse_population(
                "Delayed",
                SynapseMatrixType::DENSE_INDIVIDUALG,
                0,
                "A",
                "A",
                weight_update::static_pulse_dendritic_delay(),
                &[],
                vec![VarInit::constant(0.1), VarInit::constant(3.0)],
                postsynaptic::delta_curr(),
                &[],
                vec![],
                ConnectivityInit::uninitialised(),
            )
            .unwrap();
        model.set_max_dendritic_delay_timesteps("Delayed", 4).unwrap();
        model.finalize().unwrap();
        assert_eq!(model.num_pre_synapse_reset_required_groups(), 1);
        assert!(model.is_pre_synapse_reset_required());
        assert_eq!(
            model.find_synapse_group("Delayed").unwrap().max_dendritic_delay_timesteps(),
            4
        );
    }

    #[test]
    fn test_zero_copy() {
        let mut model = ModelSpec::new("zc");
        add_izhikevich(&mut model, "A", 10);
        assert!(!model.zero_copy_in_use());
        model
            .set_neuron_var_mode("A", "V", VarMode::LocZeroCopyInitHost)
            .unwrap();
        assert!(model.zero_copy_in_use());
    }

    #[test]
    fn test_device_built_connectivity_requires_device_init() {
        let mut model = ModelSpec::new("device_conn");
        add_izhikevich(&mut model, "A", 5);
        model
            .add_synapse_population(
                "Diag",
                SynapseMatrixType::SPARSE_GLOBALG,
                0,
                "A",
                "A",
                weight_update::static_pulse(),
                &[],
                vec![VarInit::constant(0.1)],
                postsynaptic::delta_curr(),
                &[],
                vec![],
                ConnectivityInit::one_to_one(),
            )
            .unwrap();
        model
            .set_sparse_connectivity_var_mode("Diag", VarMode::LocDeviceInitDevice)
            .unwrap();
        model.finalize().unwrap();

        assert!(model.find_synapse_group("Diag").unwrap().connectivity().is_none());
        assert!(!model.is_device_rng_required());
        assert!(model.is_device_init_required());
        // one thread per row of the connectivity
        assert_eq!(model.init_grid_size(), 32);
        assert_eq!(model.init_sparse_grid_size(), 0);
    }

    #[test]
    fn test_max_connections_fixed_once_connectivity_is_set() {
        let mut model = ModelSpec::new("ragged");
        add_izhikevich(&mut model, "Pre", 10);
        add_izhikevich(&mut model, "Post", 4);
        add_stdp_sparse(&mut model, "Syn", "Pre", "Post");
        let rows: Vec<Vec<u32>> = (0..10u32).map(|i| (0..i % 4).collect()).collect();
        model
            .set_sparse_connectivity("Syn", RaggedProjection::from_rows(3, &rows).unwrap())
            .unwrap();

        assert!(matches!(
            model.set_max_connections("Syn", 1),
            Err(GennError::InvalidState(_))
        ));
        assert_eq!(model.find_synapse_group("Syn").unwrap().max_connections(), 3);
        model.set_max_source_connections("Syn", 10).unwrap();
        model.finalize().unwrap();

        let sg = model.find_synapse_group("Syn").unwrap();
        let proj = sg.connectivity().unwrap();
        assert_eq!(proj.max_row_length(), sg.max_connections());
        assert_eq!(proj.reverse().unwrap().col_length().iter().sum::<u32>(), 13);
    }

    #[test]
    fn test_postsynaptic_init_rng() {
        let noisy = Arc::new(PostsynapticModel {
            schema: ModelSchema::new("NoisyDecay").with_vars(&[("x", "scalar")]),
            decay_code: "$(x) *= 0.9;\n".into(),
            apply_input_code: "$(Isyn) += $(inSyn) + $(x);\n".into(),
            ..Default::default()
        });
        let build = |device: bool| {
            let mut model = ModelSpec::new("ps_rng");
            add_izhikevich(&mut model, "A", 10);
            model
                .add_synapse_population(
                    "Syn",
                    SynapseMatrixType::DENSE_GLOBALG,
                    0,
                    "A",
                    "A",
                    weight_update::static_pulse(),
                    &[],
                    vec![VarInit::constant(0.1)],
                    noisy.clone(),
                    &[],
                    vec![VarInit::uniform(0.0, 1.0)],
                    ConnectivityInit::uninitialised(),
                )
                .unwrap();
            if device {
                model
                    .set_ps_var_mode("Syn", "x", VarMode::LocHostDeviceInitDevice)
                    .unwrap();
            }
            model.finalize().unwrap();
            model
        };

        let host = build(false);
        assert!(host.is_host_rng_required());
        assert!(!host.is_device_rng_required());
        assert_eq!(host.init_grid_size(), 0);

        let device = build(true);
        assert!(!device.is_host_rng_required());
        assert!(device.is_device_rng_required());
        assert!(device.is_device_init_required());
        // dense state initialised with one thread per target
        assert_eq!(device.init_grid_size(), 32);
    }

    #[test]
    fn test_sparse_init_grid() {
        let config = ModelConfig {
            auto_init_sparse_vars: true,
            block_sizes: KernelBlockSizes {
                init_sparse: 16,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut model = ModelSpec::with_config("sparse_init", config);
        add_izhikevich(&mut model, "Pre", 10);
        add_izhikevich(&mut model, "Post", 4);
        add_stdp_sparse(&mut model, "Syn", "Pre", "Post");
        let rows: Vec<Vec<u32>> = (0..10u32).map(|i| (0..i % 4).collect()).collect();
        model
            .set_sparse_connectivity("Syn", RaggedProjection::from_rows(20, &rows).unwrap())
            .unwrap();
        model
            .set_wu_var_mode("Syn", "g", VarMode::LocHostDeviceInitDevice)
            .unwrap();
        model.finalize().unwrap();

        assert!(model.is_device_sparse_init_required());
        assert_eq!(model.init_sparse_grid_size(), 32);
        assert_eq!(model.init_grid_size(), 0);
    }

    #[test]
    fn test_config_from_json() {
        let config = ModelConfig::from_json(
            r#"{"dt": 0.1, "precision": "Double", "block_sizes": {"neuron": 64}}"#,
        )
        .unwrap();
        assert_eq!(config.dt, 0.1);
        assert_eq!(config.precision, Precision::Double);
        assert_eq!(config.block_sizes.neuron, 64);
        assert_eq!(config.block_sizes.synapse, 32);
        assert_eq!(config.rn_type, "uint64_t");
        assert!(ModelConfig::from_json("{\"dt\": \"fast\"}").is_err());
    }

    #[test]
    fn test_scalar_expr() {
        let mut model = ModelSpec::new("scalar");
        assert_eq!(model.scalar_expr(0.5), "0.500000f");
        model.set_precision(Precision::Double).unwrap();
        assert_eq!(model.scalar_expr(0.5), "0.500000");
    }

    #[test]
    fn test_layout_requires_finalize() {
        let mut model = ModelSpec::new("layout");
        assert!(matches!(model.layout(), Err(GennError::InvalidState(_))));
        model.finalize().unwrap();
        assert!(model.layout().is_ok());
    }
}
