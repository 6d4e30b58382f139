//! Neuron populations.

use crate::grid::{GridAccumulator, PaddedRange};
use crate::models::{references, NeuronModel};
use crate::var_init::{any_device_init, any_init_rng, VarInit, VarInitDomain, VarMode};
use crate::{check_arity, EntityKind, GennError, Result};
use oldies_core::ClusterPlacement;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Event threshold condition after parameter substitution, with the support
/// code namespace it must be evaluated in
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SpikeEventCondition {
    pub code: String,
    pub support_code_namespace: String,
}

/// Incoming synapse populations sharing one postsynaptic input buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedInSyn {
    /// Synapse population whose postsynaptic model is emitted
    pub target: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct NeuronGroup {
    name: String,
    num_neurons: usize,
    model: Arc<NeuronModel>,
    params: Vec<f64>,
    derived_params: Vec<f64>,
    var_initialisers: Vec<VarInit>,
    var_modes: Vec<VarMode>,
    spike_var_mode: VarMode,
    placement: ClusterPlacement,

    spike_event_required: bool,
    true_spike_required: bool,
    spike_event_conditions: BTreeSet<SpikeEventCondition>,
    var_queue_required: Vec<bool>,
    num_delay_slots: usize,

    in_syn: Vec<String>,
    out_syn: Vec<String>,
    current_sources: Vec<String>,
    merged_in_syn: Vec<MergedInSyn>,

    id_range: Option<(usize, usize)>,
    padded_id_range: Option<PaddedRange>,
}

impl NeuronGroup {
    pub(crate) fn new(
        name: &str,
        num_neurons: usize,
        model: Arc<NeuronModel>,
        params: &[f64],
        var_initialisers: Vec<VarInit>,
        default_var_mode: VarMode,
        placement: ClusterPlacement,
    ) -> Result<Self> {
        let owner = format!("{} {}", EntityKind::NeuronPopulation, name);
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
            num_neurons,
            model,
            params: params.to_vec(),
            derived_params: Vec::new(),
            var_initialisers,
            var_modes: vec![default_var_mode; num_vars],
            spike_var_mode: default_var_mode,
            placement,
            spike_event_required: false,
            true_spike_required: false,
            spike_event_conditions: BTreeSet::new(),
            var_queue_required: vec![false; num_vars],
            num_delay_slots: 1,
            in_syn: Vec::new(),
            out_syn: Vec::new(),
            current_sources: Vec::new(),
            merged_in_syn: Vec::new(),
            id_range: None,
            padded_id_range: None,
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_neurons(&self) -> usize {
        self.num_neurons
    }

    pub fn model(&self) -> &Arc<NeuronModel> {
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

    pub fn spike_var_mode(&self) -> VarMode {
        self.spike_var_mode
    }

    pub fn placement(&self) -> ClusterPlacement {
        self.placement
    }

    pub fn is_spike_event_required(&self) -> bool {
        self.spike_event_required
    }

    pub fn is_true_spike_required(&self) -> bool {
        self.true_spike_required
    }

    pub fn spike_event_conditions(&self) -> &BTreeSet<SpikeEventCondition> {
        &self.spike_event_conditions
    }

    pub fn is_var_queue_required(&self, var: &str) -> bool {
        self.model
            .schema
            .var_index(var)
            .is_some_and(|i| self.var_queue_required[i])
    }

    pub fn num_delay_slots(&self) -> usize {
        self.num_delay_slots
    }

    pub fn is_delay_required(&self) -> bool {
        self.num_delay_slots > 1
    }

    /// Ring-buffer slots backing `var`: delayed queue or a single buffer
    pub fn var_storage_slots(&self, var: &str) -> usize {
        if self.is_delay_required() && self.is_var_queue_required(var) {
            self.num_delay_slots
        } else {
            1
        }
    }

    pub fn in_syn(&self) -> &[String] {
        &self.in_syn
    }

    pub fn out_syn(&self) -> &[String] {
        &self.out_syn
    }

    pub fn current_sources(&self) -> &[String] {
        &self.current_sources
    }

    pub fn merged_in_syn(&self) -> &[MergedInSyn] {
        &self.merged_in_syn
    }

    /// Unpadded `[first, last + 1)` of this population among all local neurons
    pub fn id_range(&self) -> Option<(usize, usize)> {
        self.id_range
    }

    pub fn padded_id_range(&self) -> Option<PaddedRange> {
        self.padded_id_range
    }

    pub fn is_init_rng_required(&self, domain: VarInitDomain) -> bool {
        any_init_rng(&self.var_initialisers, &self.var_modes, domain)
    }

    pub fn is_device_init_required(&self) -> bool {
        any_device_init(&self.var_initialisers, &self.var_modes)
    }

    pub fn is_zero_copy_enabled(&self) -> bool {
        self.spike_var_mode.is_zero_copy() || self.var_modes.iter().any(VarMode::is_zero_copy)
    }

    /// Every variable and the spike buffers have host copies
    pub fn can_run_on_cpu(&self) -> bool {
        self.spike_var_mode.has_host_copy() && self.var_modes.iter().all(VarMode::has_host_copy)
    }

    // ------------------------------------------------------------------------
    // Graph wiring and finalization (model-internal)
    // ------------------------------------------------------------------------

    pub(crate) fn add_in_syn(&mut self, name: &str) {
        self.in_syn.push(name.to_string());
    }

    pub(crate) fn add_out_syn(&mut self, name: &str) {
        self.out_syn.push(name.to_string());
    }

    pub(crate) fn add_current_source(&mut self, name: &str) {
        self.current_sources.push(name.to_string());
    }

    pub(crate) fn set_var_mode(&mut self, var: &str, mode: VarMode) -> Result<()> {
        let index = self.model.schema.var_index(var).ok_or_else(|| GennError::NotFound {
            kind: EntityKind::Variable,
            name: format!("{}.{}", self.name, var),
        })?;
        self.var_modes[index] = mode;
        Ok(())
    }

    pub(crate) fn set_spike_var_mode(&mut self, mode: VarMode) {
        self.spike_var_mode = mode;
    }

    pub(crate) fn add_spike_event_condition(&mut self, code: String, support_code_namespace: String) {
        self.spike_event_required = true;
        self.spike_event_conditions.insert(SpikeEventCondition {
            code,
            support_code_namespace,
        });
    }

    pub(crate) fn set_true_spike_required(&mut self) {
        self.true_spike_required = true;
    }

    /// Flag every variable referenced as `$(var_pre)` by `code` for queueing
    pub(crate) fn update_var_queues(&mut self, code: &str) {
        for (i, var) in self.model.schema.vars.iter().enumerate() {
            if references(code, &var.name, "_pre") {
                self.var_queue_required[i] = true;
            }
        }
    }

    pub(crate) fn check_num_delay_slots(&mut self, delay_steps: u32) {
        let required = delay_steps as usize + 1;
        if required > self.num_delay_slots {
            self.num_delay_slots = required;
        }
    }

    pub(crate) fn init_derived_params(&mut self, dt: f64) {
        self.derived_params = self.model.schema.derive(&self.params, dt);
    }

    pub(crate) fn set_merged_in_syn(&mut self, merged: Vec<MergedInSyn>) {
        self.merged_in_syn = merged;
    }

    pub(crate) fn calc_sizes(&mut self, id_start: &mut usize, grid: &mut GridAccumulator) -> Result<()> {
        self.id_range = Some((*id_start, *id_start + self.num_neurons));
        *id_start += self.num_neurons;
        self.padded_id_range = Some(grid.allocate(self.num_neurons)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::neuron;

    fn izhikevich_group() -> NeuronGroup {
        NeuronGroup::new(
            "Exc",
            100,
            neuron::izhikevich(),
            &[0.02, 0.2, -65.0, 8.0],
            vec![VarInit::constant(-65.0), VarInit::uniform(-15.0, -10.0)],
            VarMode::default(),
            ClusterPlacement::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_arity_validation() {
        let err = NeuronGroup::new(
            "Bad",
            10,
            neuron::izhikevich(),
            &[0.02, 0.2, -65.0],
            vec![VarInit::constant(0.0), VarInit::constant(0.0)],
            VarMode::default(),
            ClusterPlacement::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GennError::ArityMismatch { expected: 4, actual: 3, .. }));
        assert!(err.to_string().contains("Bad"));
    }

    #[test]
    fn test_var_queues_and_delay_slots() {
        let mut ng = izhikevich_group();
        ng.update_var_queues("$(addToInSyn, $(g) * $(V_pre));");
        assert!(ng.is_var_queue_required("V"));
        assert!(!ng.is_var_queue_required("U"));

        assert_eq!(ng.var_storage_slots("V"), 1);
        ng.check_num_delay_slots(5);
        ng.check_num_delay_slots(2);
        assert_eq!(ng.num_delay_slots(), 6);
        assert_eq!(ng.var_storage_slots("V"), 6);
        assert_eq!(ng.var_storage_slots("U"), 1);
    }

    #[test]
    fn test_spike_event_conditions_deduplicate() {
        let mut ng = izhikevich_group();
        ng.add_spike_event_condition("V > (-50)".into(), String::new());
        ng.add_spike_event_condition("V > (-50)".into(), String::new());
        assert_eq!(ng.spike_event_conditions().len(), 1);
        ng.add_spike_event_condition("V > (-40)".into(), String::new());
        assert_eq!(ng.spike_event_conditions().len(), 2);
        assert!(ng.is_spike_event_required());
    }

    #[test]
    fn test_init_rng_domains() {
        let mut ng = izhikevich_group();
        assert!(ng.is_init_rng_required(VarInitDomain::Host));
        ng.set_var_mode("U", VarMode::LocDeviceInitDevice).unwrap();
        assert!(!ng.is_init_rng_required(VarInitDomain::Host));
        assert!(ng.is_init_rng_required(VarInitDomain::Device));
        assert!(!ng.can_run_on_cpu());
        assert!(ng.set_var_mode("W", VarMode::default()).is_err());
    }

    #[test]
    fn test_calc_sizes() {
        let mut ng = izhikevich_group();
        let mut id = 7;
        let mut grid = GridAccumulator::new(32);
        ng.calc_sizes(&mut id, &mut grid).unwrap();
        assert_eq!(ng.id_range(), Some((7, 107)));
        assert_eq!(ng.padded_id_range(), Some(PaddedRange { start: 0, end: 128 }));
    }
}
