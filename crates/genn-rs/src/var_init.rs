//! Variable initialisation snippets and variable residency modes.

use crate::models::{uses_rng, DerivedParam};
use crate::{check_arity, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

// ============================================================================
// VARIABLE MODES
// ============================================================================

/// Where a variable's storage lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarLocation {
    Device,
    HostDevice,
    /// Host memory mapped into the device address space
    ZeroCopy,
}

/// Which side runs a variable's initialiser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarInitDomain {
    Host,
    Device,
}

/// Valid combinations of location and initialisation domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VarMode {
    LocDeviceInitDevice,
    #[default]
    LocHostDeviceInitHost,
    LocHostDeviceInitDevice,
    LocZeroCopyInitHost,
    LocZeroCopyInitDevice,
}

impl VarMode {
    pub fn location(&self) -> VarLocation {
        match self {
            VarMode::LocDeviceInitDevice => VarLocation::Device,
            VarMode::LocHostDeviceInitHost | VarMode::LocHostDeviceInitDevice => {
                VarLocation::HostDevice
            }
            VarMode::LocZeroCopyInitHost | VarMode::LocZeroCopyInitDevice => VarLocation::ZeroCopy,
        }
    }

    pub fn init_domain(&self) -> VarInitDomain {
        match self {
            VarMode::LocHostDeviceInitHost | VarMode::LocZeroCopyInitHost => VarInitDomain::Host,
            _ => VarInitDomain::Device,
        }
    }

    pub fn inits_on(&self, domain: VarInitDomain) -> bool {
        self.init_domain() == domain
    }

    pub fn has_host_copy(&self) -> bool {
        self.location() != VarLocation::Device
    }

    pub fn is_zero_copy(&self) -> bool {
        self.location() == VarLocation::ZeroCopy
    }
}

// ============================================================================
// INITIALISATION SNIPPETS
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct InitVarSnippet {
    pub name: String,
    pub param_names: Vec<String>,
    pub derived_params: Vec<DerivedParam>,
    /// Empty code leaves the variable uninitialised
    pub code: String,
}

macro_rules! snippet {
    ($fn_name:ident, $name:expr, [$($param:expr),*], $code:expr) => {
        pub fn $fn_name() -> Arc<InitVarSnippet> {
            static SNIPPET: OnceLock<Arc<InitVarSnippet>> = OnceLock::new();
            SNIPPET
                .get_or_init(|| {
                    Arc::new(InitVarSnippet {
                        name: $name.into(),
                        param_names: vec![$($param.to_string()),*],
                        derived_params: Vec::new(),
                        code: $code.into(),
                    })
                })
                .clone()
        }
    };
}

/// Standard initialisation snippets
pub mod snippets {
    use super::*;

    snippet!(uninitialised, "Uninitialised", [], "");
    snippet!(constant, "Constant", ["value"], "$(value) = $(value);");
    snippet!(
        uniform,
        "Uniform",
        ["min", "max"],
        "const scalar scale = $(max) - $(min);\n$(value) = $(min) + ($(gennrand_uniform) * scale);"
    );
    snippet!(
        normal,
        "Normal",
        ["mean", "sd"],
        "$(value) = $(mean) + ($(gennrand_normal) * $(sd));"
    );
    snippet!(
        exponential,
        "Exponential",
        ["lambda"],
        "$(value) = $(lambda) * $(gennrand_exponential);"
    );
}

/// A snippet bound to concrete parameter values
#[derive(Debug, Clone)]
pub struct VarInit {
    snippet: Arc<InitVarSnippet>,
    params: Vec<f64>,
}

impl VarInit {
    pub fn new(snippet: Arc<InitVarSnippet>, params: &[f64]) -> Result<Self> {
        check_arity(
            &format!("initialiser {}", snippet.name),
            "parameter values",
            snippet.param_names.len(),
            params.len(),
        )?;
        Ok(Self {
            snippet,
            params: params.to_vec(),
        })
    }

    pub fn constant(value: f64) -> Self {
        Self {
            snippet: snippets::constant(),
            params: vec![value],
        }
    }

    pub fn uninitialised() -> Self {
        Self {
            snippet: snippets::uninitialised(),
            params: Vec::new(),
        }
    }

    pub fn uniform(min: f64, max: f64) -> Self {
        Self {
            snippet: snippets::uniform(),
            params: vec![min, max],
        }
    }

    pub fn normal(mean: f64, sd: f64) -> Self {
        Self {
            snippet: snippets::normal(),
            params: vec![mean, sd],
        }
    }

    pub fn exponential(lambda: f64) -> Self {
        Self {
            snippet: snippets::exponential(),
            params: vec![lambda],
        }
    }

    pub fn snippet(&self) -> &Arc<InitVarSnippet> {
        &self.snippet
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub fn derived_params(&self, dt: f64) -> Vec<f64> {
        self.snippet
            .derived_params
            .iter()
            .map(|d| (d.func)(&self.params, dt))
            .collect()
    }

    pub fn is_uninitialised(&self) -> bool {
        self.snippet.code.is_empty()
    }

    pub fn is_rng_required(&self) -> bool {
        uses_rng(&self.snippet.code)
    }

    /// Value of a constant initialiser
    pub fn constant_value(&self) -> Option<f64> {
        if Arc::ptr_eq(&self.snippet, &snippets::constant()) {
            self.params.first().copied()
        } else {
            None
        }
    }
}

/// Does any initialiser initialised in `domain` draw random numbers?
pub(crate) fn any_init_rng(inits: &[VarInit], modes: &[VarMode], domain: VarInitDomain) -> bool {
    inits
        .iter()
        .zip(modes)
        .any(|(init, mode)| mode.inits_on(domain) && init.is_rng_required())
}

/// Does any initialiser need to run on the device?
pub(crate) fn any_device_init(inits: &[VarInit], modes: &[VarMode]) -> bool {
    inits
        .iter()
        .zip(modes)
        .any(|(init, mode)| mode.inits_on(VarInitDomain::Device) && !init.is_uninitialised())
}
