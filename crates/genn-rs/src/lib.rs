//! # GeNN-RS: GeNN Model Finalization Revival
//!
//! Revival of the model-definition layer of GeNN
//! (GPU-enhanced Neuronal Networks, https://genn-team.github.io/)
//! Originally created by Thomas Nowotny and the GeNN team (2010)
//!
//! GeNN generates CUDA/C++ simulation kernels from a network description.
//! Before any code is emitted the description is *finalized*: derived
//! parameters are computed, spike-event and delay-queue requirements are
//! propagated, sparse connectivity is laid out in both orientations and every
//! population is given a block-padded range inside its kernel's thread grid.
//! This crate provides that step:
//! - Builder API over populations, synapse populations and current sources
//! - Rule capability records (neuron, weight update, postsynaptic, current source)
//! - Ragged and YALE sparse layouts with post-to-pre and synapse remapping
//! - Padded kernel grid sizing
//! - A serialisable layout for external code emitters
//!
//! ```
//! use oldies_genn::models::{neuron, postsynaptic, weight_update};
//! use oldies_genn::{ConnectivityInit, ModelSpec, SynapseMatrixType, VarInit};
//!
//! let mut model = ModelSpec::new("demo");
//! model.add_neuron_population("Pre", 10, neuron::spike_source(), &[], vec![]).unwrap();
//! model.add_neuron_population("Post", 4, neuron::izhikevich(), &[0.02, 0.2, -65.0, 8.0],
//!     vec![VarInit::constant(-65.0), VarInit::constant(-13.0)]).unwrap();
//! model.add_synapse_population("Syn", SynapseMatrixType::DENSE_GLOBALG, 0, "Pre", "Post",
//!     weight_update::static_pulse(), &[], vec![VarInit::constant(0.5)],
//!     postsynaptic::delta_curr(), &[], vec![],
//!     ConnectivityInit::uninitialised()).unwrap();
//! model.finalize().unwrap();
//! assert_eq!(model.neuron_grid_size(), 64);
//! ```

use std::fmt;
use thiserror::Error;

pub mod connectivity;
pub mod current_source;
pub mod grid;
pub mod layout;
pub mod legacy;
pub mod model;
pub mod models;
pub mod neuron_group;
pub mod sparse;
pub mod synapse_group;
pub mod var_init;

pub use connectivity::{ConnectivityInit, SparseConnectivitySnippet};
pub use current_source::CurrentSource;
pub use grid::{calc_block_padded_range, GridSizes, KernelBlockSizes, KernelCategory, PaddedRange};
pub use layout::ModelLayout;
pub use model::{KernelParameters, ModelConfig, ModelSpec};
pub use neuron_group::NeuronGroup;
pub use sparse::{RaggedProjection, SparseConfig, YaleProjection};
pub use synapse_group::{
    SpanType, SynapseGroup, SynapseMatrixConnectivity, SynapseMatrixType, SynapseMatrixWeight,
};
pub use var_init::{VarInit, VarInitDomain, VarLocation, VarMode};

/// Kind of named entity, used to give errors context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    NeuronPopulation,
    SynapsePopulation,
    CurrentSource,
    NeuronModel,
    WeightUpdateModel,
    PostsynapticModel,
    CurrentSourceModel,
    Variable,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::NeuronPopulation => "neuron population",
            EntityKind::SynapsePopulation => "synapse population",
            EntityKind::CurrentSource => "current source",
            EntityKind::NeuronModel => "neuron model",
            EntityKind::WeightUpdateModel => "weight update model",
            EntityKind::PostsynapticModel => "postsynaptic model",
            EntityKind::CurrentSourceModel => "current source model",
            EntityKind::Variable => "variable",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum GennError {
    #[error("Cannot add a {kind} with duplicate name: {name}")]
    DuplicateName { kind: EntityKind, name: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: EntityKind, name: String },

    #[error("The number of {what} for {owner} does not match that of its model, {actual} != {expected}")]
    ArityMismatch {
        owner: String,
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("Weight update model variables must be initialised in same place as sparse connectivity: variable '{variable}' in population '{group}' is not")]
    CrossDomainMismatch { group: String, variable: String },

    #[error("Invalid connectivity: {0}")]
    InvalidConnectivity(String),

    #[error(transparent)]
    Core(#[from] oldies_core::OldiesError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GennError>;

/// Check a value vector against the names declared by a model
pub(crate) fn check_arity(
    owner: &str,
    what: &'static str,
    expected: usize,
    actual: usize,
) -> Result<()> {
    if expected != actual {
        return Err(GennError::ArityMismatch {
            owner: owner.to_string(),
            what,
            expected,
            actual,
        });
    }
    Ok(())
}
