//! Synapse populations: directed connections between two neuron populations.

use crate::connectivity::ConnectivityInit;
use crate::grid::PaddedRange;
use crate::models::{PostsynapticModel, WeightUpdateModel};
use crate::sparse::RaggedProjection;
use crate::var_init::{any_device_init, any_init_rng, VarInit, VarInitDomain, VarMode};
use crate::{check_arity, EntityKind, GennError, Result};
use oldies_core::ClusterPlacement;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

// ============================================================================
// MATRIX TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SynapseMatrixConnectivity {
    Dense,
    Sparse,
    Bitmask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SynapseMatrixWeight {
    Global,
    Individual,
}

/// Connectivity storage combined with weight storage.
///
/// Only valid combinations can be constructed, including through serde.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "MatrixTypeFields", into = "MatrixTypeFields")]
pub struct SynapseMatrixType {
    connectivity: SynapseMatrixConnectivity,
    weight: SynapseMatrixWeight,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct MatrixTypeFields {
    connectivity: SynapseMatrixConnectivity,
    weight: SynapseMatrixWeight,
}

impl TryFrom<MatrixTypeFields> for SynapseMatrixType {
    type Error = GennError;

    fn try_from(fields: MatrixTypeFields) -> Result<Self> {
        Self::new(fields.connectivity, fields.weight)
    }
}

impl From<SynapseMatrixType> for MatrixTypeFields {
    fn from(mt: SynapseMatrixType) -> Self {
        Self {
            connectivity: mt.connectivity,
            weight: mt.weight,
        }
    }
}

impl SynapseMatrixType {
    pub const DENSE_GLOBALG: Self = Self {
        connectivity: SynapseMatrixConnectivity::Dense,
        weight: SynapseMatrixWeight::Global,
    };
    pub const DENSE_INDIVIDUALG: Self = Self {
        connectivity: SynapseMatrixConnectivity::Dense,
        weight: SynapseMatrixWeight::Individual,
    };
    pub const SPARSE_GLOBALG: Self = Self {
        connectivity: SynapseMatrixConnectivity::Sparse,
        weight: SynapseMatrixWeight::Global,
    };
    pub const SPARSE_INDIVIDUALG: Self = Self {
        connectivity: SynapseMatrixConnectivity::Sparse,
        weight: SynapseMatrixWeight::Individual,
    };
    pub const BITMASK_GLOBALG: Self = Self {
        connectivity: SynapseMatrixConnectivity::Bitmask,
        weight: SynapseMatrixWeight::Global,
    };

    pub fn new(
        connectivity: SynapseMatrixConnectivity,
        weight: SynapseMatrixWeight,
    ) -> Result<Self> {
        if connectivity == SynapseMatrixConnectivity::Bitmask
            && weight == SynapseMatrixWeight::Individual
        {
            return Err(GennError::UnsupportedConfiguration(
                "bitmask connectivity cannot store individual weights".into(),
            ));
        }
        Ok(Self {
            connectivity,
            weight,
        })
    }

    pub fn connectivity(&self) -> SynapseMatrixConnectivity {
        self.connectivity
    }

    pub fn weight(&self) -> SynapseMatrixWeight {
        self.weight
    }

    pub fn is_sparse(&self) -> bool {
        self.connectivity == SynapseMatrixConnectivity::Sparse
    }

    pub fn has_individual_weights(&self) -> bool {
        self.weight == SynapseMatrixWeight::Individual
    }
}

impl fmt::Display for SynapseMatrixType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let conn = match self.connectivity {
            SynapseMatrixConnectivity::Dense => "DENSE",
            SynapseMatrixConnectivity::Sparse => "SPARSE",
            SynapseMatrixConnectivity::Bitmask => "BITMASK",
        };
        let weight = match self.weight {
            SynapseMatrixWeight::Global => "GLOBALG",
            SynapseMatrixWeight::Individual => "INDIVIDUALG",
        };
        write!(f, "{}_{}", conn, weight)
    }
}

/// Parallelisation of the main update kernel over a sparse matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SpanType {
    /// One thread per postsynaptic row slot
    Postsynaptic,
    /// One thread per presynaptic neuron
    #[default]
    Presynaptic,
}

// ============================================================================
// SYNAPSE GROUP
// ============================================================================

/// Construction arguments resolved by the model before a group is created
pub(crate) struct SynapseGroupInit<'a> {
    pub name: &'a str,
    pub matrix_type: SynapseMatrixType,
    pub delay_steps: u32,
    pub src: &'a str,
    pub trg: &'a str,
    pub num_src: usize,
    pub num_trg: usize,
    pub placement: ClusterPlacement,
    pub wu_model: Arc<WeightUpdateModel>,
    pub wu_params: &'a [f64],
    pub wu_var_initialisers: Vec<VarInit>,
    pub ps_model: Arc<PostsynapticModel>,
    pub ps_params: &'a [f64],
    pub ps_var_initialisers: Vec<VarInit>,
    pub connectivity_initialiser: ConnectivityInit,
    pub default_var_mode: VarMode,
    pub default_sparse_connectivity_mode: VarMode,
}

#[derive(Debug, Clone)]
pub struct SynapseGroup {
    name: String,
    matrix_type: SynapseMatrixType,
    delay_steps: u32,
    max_connections: usize,
    max_source_connections: usize,
    max_dendritic_delay_timesteps: u32,
    span_type: SpanType,

    src: String,
    trg: String,
    num_src: usize,
    num_trg: usize,
    placement: ClusterPlacement,

    wu_model: Arc<WeightUpdateModel>,
    wu_params: Vec<f64>,
    wu_derived_params: Vec<f64>,
    wu_var_initialisers: Vec<VarInit>,
    wu_var_modes: Vec<VarMode>,

    ps_model: Arc<PostsynapticModel>,
    ps_params: Vec<f64>,
    ps_derived_params: Vec<f64>,
    ps_var_initialisers: Vec<VarInit>,
    ps_var_modes: Vec<VarMode>,
    in_syn_var_mode: VarMode,
    ps_model_target_name: String,

    connectivity_initialiser: ConnectivityInit,
    sparse_connectivity_var_mode: VarMode,
    connectivity: Option<RaggedProjection>,

    true_spike_required: bool,
    spike_event_required: bool,
    event_threshold_retest_required: bool,

    padded_kernel_id_range: Option<PaddedRange>,
    post_learn_range: Option<PaddedRange>,
    synapse_dynamics_range: Option<PaddedRange>,
}

impl SynapseGroup {
    pub(crate) fn new(init: SynapseGroupInit<'_>) -> Result<Self> {
        let owner = format!("{} {}", EntityKind::SynapsePopulation, init.name);
        let wu = &init.wu_model.schema;
        let ps = &init.ps_model.schema;
        check_arity(&owner, "weight update parameter values", wu.param_names.len(), init.wu_params.len())?;
        check_arity(
            &owner,
            "weight update variable initialisers",
            wu.vars.len(),
            init.wu_var_initialisers.len(),
        )?;
        check_arity(&owner, "postsynaptic parameter values", ps.param_names.len(), init.ps_params.len())?;
        check_arity(
            &owner,
            "postsynaptic variable initialisers",
            ps.vars.len(),
            init.ps_var_initialisers.len(),
        )?;

        if init.matrix_type.connectivity() == SynapseMatrixConnectivity::Dense
            && !init.connectivity_initialiser.is_uninitialised()
        {
            return Err(GennError::UnsupportedConfiguration(format!(
                "{}: connectivity initialisation snippets can only be used with sparse or bitmask connectivity",
                owner
            )));
        }

        let max_connections = init
            .connectivity_initialiser
            .max_row_length(init.num_src, init.num_trg)
            .unwrap_or(init.num_trg);
        let max_source_connections = init
            .connectivity_initialiser
            .max_col_length(init.num_src, init.num_trg)
            .unwrap_or(init.num_src);

        let num_wu_vars = wu.vars.len();
        let num_ps_vars = ps.vars.len();
        Ok(Self {
            name: init.name.to_string(),
            matrix_type: init.matrix_type,
            delay_steps: init.delay_steps,
            max_connections,
            max_source_connections,
            max_dendritic_delay_timesteps: 1,
            span_type: SpanType::default(),
            src: init.src.to_string(),
            trg: init.trg.to_string(),
            num_src: init.num_src,
            num_trg: init.num_trg,
            placement: init.placement,
            wu_params: init.wu_params.to_vec(),
            wu_derived_params: Vec::new(),
            wu_var_initialisers: init.wu_var_initialisers,
            wu_var_modes: vec![init.default_var_mode; num_wu_vars],
            wu_model: init.wu_model,
            ps_params: init.ps_params.to_vec(),
            ps_derived_params: Vec::new(),
            ps_var_initialisers: init.ps_var_initialisers,
            ps_var_modes: vec![init.default_var_mode; num_ps_vars],
            ps_model: init.ps_model,
            in_syn_var_mode: init.default_var_mode,
            ps_model_target_name: init.name.to_string(),
            connectivity_initialiser: init.connectivity_initialiser,
            sparse_connectivity_var_mode: init.default_sparse_connectivity_mode,
            connectivity: None,
            true_spike_required: false,
            spike_event_required: false,
            event_threshold_retest_required: false,
            padded_kernel_id_range: None,
            post_learn_range: None,
            synapse_dynamics_range: None,
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matrix_type(&self) -> SynapseMatrixType {
        self.matrix_type
    }

    pub fn delay_steps(&self) -> u32 {
        self.delay_steps
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn max_source_connections(&self) -> usize {
        self.max_source_connections
    }

    pub fn max_dendritic_delay_timesteps(&self) -> u32 {
        self.max_dendritic_delay_timesteps
    }

    pub fn span_type(&self) -> SpanType {
        self.span_type
    }

    pub fn src_neuron_group(&self) -> &str {
        &self.src
    }

    pub fn trg_neuron_group(&self) -> &str {
        &self.trg
    }

    pub fn num_src(&self) -> usize {
        self.num_src
    }

    pub fn num_trg(&self) -> usize {
        self.num_trg
    }

    /// Placement of the target population, which owns this group's state
    pub fn placement(&self) -> ClusterPlacement {
        self.placement
    }

    pub fn wu_model(&self) -> &Arc<WeightUpdateModel> {
        &self.wu_model
    }

    pub fn wu_params(&self) -> &[f64] {
        &self.wu_params
    }

    pub fn wu_derived_params(&self) -> &[f64] {
        &self.wu_derived_params
    }

    pub fn wu_var_initialisers(&self) -> &[VarInit] {
        &self.wu_var_initialisers
    }

    pub fn wu_var_modes(&self) -> &[VarMode] {
        &self.wu_var_modes
    }

    pub fn wu_var_mode(&self, var: &str) -> Option<VarMode> {
        self.wu_model.schema.var_index(var).map(|i| self.wu_var_modes[i])
    }

    pub fn ps_model(&self) -> &Arc<PostsynapticModel> {
        &self.ps_model
    }

    pub fn ps_params(&self) -> &[f64] {
        &self.ps_params
    }

    pub fn ps_derived_params(&self) -> &[f64] {
        &self.ps_derived_params
    }

    pub fn ps_var_initialisers(&self) -> &[VarInit] {
        &self.ps_var_initialisers
    }

    pub fn ps_var_modes(&self) -> &[VarMode] {
        &self.ps_var_modes
    }

    pub fn ps_var_mode(&self, var: &str) -> Option<VarMode> {
        self.ps_model.schema.var_index(var).map(|i| self.ps_var_modes[i])
    }

    pub fn in_syn_var_mode(&self) -> VarMode {
        self.in_syn_var_mode
    }

    /// Synapse population whose postsynaptic state this group accumulates into
    pub fn ps_model_target_name(&self) -> &str {
        &self.ps_model_target_name
    }

    pub fn connectivity_initialiser(&self) -> &ConnectivityInit {
        &self.connectivity_initialiser
    }

    pub fn sparse_connectivity_var_mode(&self) -> VarMode {
        self.sparse_connectivity_var_mode
    }

    pub fn connectivity(&self) -> Option<&RaggedProjection> {
        self.connectivity.as_ref()
    }

    pub fn is_true_spike_required(&self) -> bool {
        self.true_spike_required
    }

    pub fn is_spike_event_required(&self) -> bool {
        self.spike_event_required
    }

    pub fn is_event_threshold_retest_required(&self) -> bool {
        self.event_threshold_retest_required
    }

    pub fn padded_kernel_id_range(&self) -> Option<PaddedRange> {
        self.padded_kernel_id_range
    }

    pub fn post_learn_range(&self) -> Option<PaddedRange> {
        self.post_learn_range
    }

    pub fn synapse_dynamics_range(&self) -> Option<PaddedRange> {
        self.synapse_dynamics_range
    }

    pub fn is_dendritic_delay_required(&self) -> bool {
        self.wu_model.has_dendritic_delay()
    }

    pub fn is_ps_model_merged(&self) -> bool {
        self.ps_model_target_name != self.name
    }

    pub fn is_wu_init_rng_required(&self, domain: VarInitDomain) -> bool {
        if any_init_rng(&self.wu_var_initialisers, &self.wu_var_modes, domain) {
            return true;
        }
        self.matrix_type.is_sparse()
            && self.sparse_connectivity_var_mode.inits_on(domain)
            && self.connectivity_initialiser.is_rng_required()
    }

    pub fn is_ps_init_rng_required(&self, domain: VarInitDomain) -> bool {
        any_init_rng(&self.ps_var_initialisers, &self.ps_var_modes, domain)
    }

    pub fn is_wu_device_var_init_required(&self) -> bool {
        self.matrix_type.has_individual_weights()
            && any_device_init(&self.wu_var_initialisers, &self.wu_var_modes)
    }

    pub fn is_device_init_required(&self) -> bool {
        self.is_wu_device_var_init_required()
            || any_device_init(&self.ps_var_initialisers, &self.ps_var_modes)
            || self.in_syn_var_mode.inits_on(VarInitDomain::Device)
            || self.is_device_sparse_connectivity_init_required()
    }

    /// Connectivity must be generated by a device kernel
    pub fn is_device_sparse_connectivity_init_required(&self) -> bool {
        self.matrix_type.connectivity() != SynapseMatrixConnectivity::Dense
            && self.sparse_connectivity_var_mode.inits_on(VarInitDomain::Device)
            && !self.connectivity_initialiser.is_uninitialised()
    }

    /// Individual weights of a sparse group need initialising on the device
    pub fn is_device_sparse_init_required(&self) -> bool {
        self.matrix_type.is_sparse() && self.is_wu_device_var_init_required()
    }

    pub fn is_zero_copy_enabled(&self) -> bool {
        self.in_syn_var_mode.is_zero_copy()
            || self.wu_var_modes.iter().any(VarMode::is_zero_copy)
            || self.ps_var_modes.iter().any(VarMode::is_zero_copy)
    }

    pub fn can_run_on_cpu(&self) -> bool {
        self.in_syn_var_mode.has_host_copy()
            && self.wu_var_modes.iter().all(VarMode::has_host_copy)
            && self.ps_var_modes.iter().all(VarMode::has_host_copy)
            && (!self.matrix_type.is_sparse() || self.sparse_connectivity_var_mode.has_host_copy())
    }

    /// Threads required by the presynaptic update kernel (before padding)
    pub fn main_kernel_size(&self) -> usize {
        if self.matrix_type.is_sparse() {
            match self.span_type {
                SpanType::Presynaptic => self.num_src,
                SpanType::Postsynaptic => self.max_connections,
            }
        } else {
            self.num_trg
        }
    }

    /// Threads required by the postsynaptic learning kernel (before padding)
    pub fn post_learn_kernel_size(&self) -> usize {
        if self.matrix_type.is_sparse() {
            self.max_source_connections
        } else {
            self.num_src
        }
    }

    /// Threads required by the synapse dynamics kernel (before padding)
    pub fn synapse_dynamics_kernel_size(&self) -> usize {
        if self.matrix_type.is_sparse() {
            self.num_src * self.max_connections
        } else {
            self.num_src * self.num_trg
        }
    }

    // ------------------------------------------------------------------------
    // Configuration before finalize (validated by the model)
    // ------------------------------------------------------------------------

    pub(crate) fn set_max_connections(&mut self, max_connections: usize) -> Result<()> {
        if !self.matrix_type.is_sparse() {
            return Err(GennError::UnsupportedConfiguration(format!(
                "synapse population {} is densely connected, max connections cannot be set",
                self.name
            )));
        }
        if self.connectivity_initialiser.defines_max_row_length() {
            return Err(GennError::InvalidState(format!(
                "synapse population {} already has max connections defined by its connectivity initialiser",
                self.name
            )));
        }
        if self.connectivity.is_some() {
            return Err(GennError::InvalidState(format!(
                "synapse population {} already has connectivity, max connections cannot be changed",
                self.name
            )));
        }
        self.max_connections = max_connections;
        Ok(())
    }

    pub(crate) fn set_max_source_connections(&mut self, max_connections: usize) -> Result<()> {
        if !self.matrix_type.is_sparse() {
            return Err(GennError::UnsupportedConfiguration(format!(
                "synapse population {} is densely connected, max source connections cannot be set",
                self.name
            )));
        }
        if self.connectivity_initialiser.defines_max_col_length() {
            return Err(GennError::InvalidState(format!(
                "synapse population {} already has max source connections defined by its connectivity initialiser",
                self.name
            )));
        }
        self.max_source_connections = max_connections;
        Ok(())
    }

    pub(crate) fn set_max_dendritic_delay_timesteps(&mut self, timesteps: u32) {
        self.max_dendritic_delay_timesteps = timesteps;
    }

    pub(crate) fn set_span_type(&mut self, span_type: SpanType) -> Result<()> {
        if !self.matrix_type.is_sparse() {
            return Err(GennError::UnsupportedConfiguration(format!(
                "span type of synapse population {} can only be set for sparse connectivity",
                self.name
            )));
        }
        self.span_type = span_type;
        Ok(())
    }

    pub(crate) fn set_wu_var_mode(&mut self, var: &str, mode: VarMode) -> Result<()> {
        let index = self.wu_model.schema.var_index(var).ok_or_else(|| self.var_not_found(var))?;
        self.wu_var_modes[index] = mode;
        Ok(())
    }

    pub(crate) fn set_ps_var_mode(&mut self, var: &str, mode: VarMode) -> Result<()> {
        let index = self.ps_model.schema.var_index(var).ok_or_else(|| self.var_not_found(var))?;
        self.ps_var_modes[index] = mode;
        Ok(())
    }

    pub(crate) fn set_in_syn_var_mode(&mut self, mode: VarMode) {
        self.in_syn_var_mode = mode;
    }

    pub(crate) fn set_sparse_connectivity_var_mode(&mut self, mode: VarMode) {
        self.sparse_connectivity_var_mode = mode;
    }

    /// Install user-supplied connectivity; its stride becomes the row capacity
    pub(crate) fn set_connectivity(&mut self, projection: RaggedProjection) -> Result<()> {
        if !self.matrix_type.is_sparse() {
            return Err(GennError::UnsupportedConfiguration(format!(
                "synapse population {} is not sparse, connectivity cannot be set",
                self.name
            )));
        }
        projection.validate(self.num_src, self.num_trg)?;
        if self.connectivity_initialiser.defines_max_row_length()
            && projection.max_row_length() != self.max_connections
        {
            return Err(GennError::InvalidConnectivity(format!(
                "synapse population {} expects max row length {} but connectivity has {}",
                self.name,
                self.max_connections,
                projection.max_row_length()
            )));
        }
        self.max_connections = projection.max_row_length();
        self.connectivity = Some(projection);
        Ok(())
    }

    fn var_not_found(&self, var: &str) -> GennError {
        GennError::NotFound {
            kind: EntityKind::Variable,
            name: format!("{}.{}", self.name, var),
        }
    }

    // ------------------------------------------------------------------------
    // Finalization (model-internal)
    // ------------------------------------------------------------------------

    pub(crate) fn set_true_spike_required(&mut self) {
        self.true_spike_required = true;
    }

    pub(crate) fn set_spike_event_required(&mut self) {
        self.spike_event_required = true;
    }

    pub(crate) fn set_event_threshold_retest_required(&mut self) {
        self.event_threshold_retest_required = true;
    }

    pub(crate) fn set_ps_model_target_name(&mut self, name: &str) {
        self.ps_model_target_name = name.to_string();
    }

    pub(crate) fn init_derived_params(&mut self, dt: f64) {
        self.wu_derived_params = self.wu_model.schema.derive(&self.wu_params, dt);
        self.ps_derived_params = self.ps_model.schema.derive(&self.ps_params, dt);
        self.connectivity_initialiser.init_derived_params(dt);
    }

    /// Build connectivity on the host if it was not supplied and the
    /// initialiser supports it. Returns whether connectivity is now present.
    pub(crate) fn materialise_connectivity(&mut self) -> Result<bool> {
        if self.connectivity.is_none()
            && self.sparse_connectivity_var_mode.inits_on(VarInitDomain::Host)
        {
            self.connectivity = self.connectivity_initialiser.build_on_host(
                self.num_src,
                self.num_trg,
                self.max_connections,
            )?;
        }

        let learn_post = self.wu_model.has_learn_post_code();
        let synapse_dynamics = self.wu_model.has_synapse_dynamics_code();
        let Some(projection) = self.connectivity.as_mut() else {
            return Ok(false);
        };
        if learn_post {
            projection
                .create_post_to_pre(self.num_trg, self.max_source_connections)
                .map_err(|e| {
                    GennError::InvalidConnectivity(format!("synapse population {}: {}", self.name, e))
                })?;
        }
        if synapse_dynamics {
            projection.create_pre_indices();
        }
        Ok(true)
    }

    pub(crate) fn set_padded_kernel_id_range(&mut self, range: PaddedRange) {
        self.padded_kernel_id_range = Some(range);
    }

    pub(crate) fn set_post_learn_range(&mut self, range: PaddedRange) {
        self.post_learn_range = Some(range);
    }

    pub(crate) fn set_synapse_dynamics_range(&mut self, range: PaddedRange) {
        self.synapse_dynamics_range = Some(range);
    }
}
