//! Rule capability records and the standard rule library.
//!
//! A rule is an opaque record: parameter names, state variables, derived
//! parameter functions and code strings. Finalization only inspects the
//! code for references (`$(name)`, `$(name_pre)`, `$(gennrand_...)`) and
//! performs value substitution; it never interprets it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Marker that code draws from the random number generator
pub const RNG_MARKER: &str = "$(gennrand_";

/// Derived parameter function: (parameter values, timestep) -> value
pub type DerivedParamFn = fn(&[f64], f64) -> f64;

// ============================================================================
// CODE INSPECTION
// ============================================================================

/// Does this code request random numbers?
pub fn uses_rng(code: &str) -> bool {
    code.contains(RNG_MARKER)
}

/// Does `code` reference `$(name{suffix})`?
pub fn references(code: &str, name: &str, suffix: &str) -> bool {
    code.contains(&format!("$({}{})", name, suffix))
}

/// Replace every `$(name)` with `(value)`
pub fn value_substitutions(code: &mut String, names: &[String], values: &[f64]) {
    for (name, value) in names.iter().zip(values) {
        let token = format!("$({})", name);
        if code.contains(&token) {
            *code = code.replace(&token, &format!("({})", value));
        }
    }
}

/// Replace every `$(name)` with `name{suffix}`
pub fn name_substitutions(code: &mut String, names: &[String], suffix: &str) {
    for name in names {
        let token = format!("$({})", name);
        if code.contains(&token) {
            *code = code.replace(&token, &format!("{}{}", name, suffix));
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

/// Named, typed slot (state variable or extra global parameter)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameType {
    pub name: String,
    pub ty: String,
}

impl NameType {
    pub fn new(name: &str, ty: &str) -> Self {
        Self {
            name: name.to_string(),
            ty: ty.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct DerivedParam {
    pub name: String,
    pub func: DerivedParamFn,
}

impl DerivedParam {
    pub fn new(name: &str, func: DerivedParamFn) -> Self {
        Self {
            name: name.to_string(),
            func,
        }
    }
}

impl fmt::Debug for DerivedParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedParam").field("name", &self.name).finish()
    }
}

/// Names shared by every rule kind
#[derive(Debug, Clone, Default)]
pub struct ModelSchema {
    pub name: String,
    pub param_names: Vec<String>,
    pub derived_params: Vec<DerivedParam>,
    pub vars: Vec<NameType>,
    pub extra_global_params: Vec<NameType>,
}

impl ModelSchema {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_params(mut self, names: &[&str]) -> Self {
        self.param_names = names.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_derived(mut self, derived: Vec<DerivedParam>) -> Self {
        self.derived_params = derived;
        self
    }

    pub fn with_vars(mut self, vars: &[(&str, &str)]) -> Self {
        self.vars = vars.iter().map(|(n, t)| NameType::new(n, t)).collect();
        self
    }

    pub fn with_extra_global_params(mut self, egps: &[(&str, &str)]) -> Self {
        self.extra_global_params = egps.iter().map(|(n, t)| NameType::new(n, t)).collect();
        self
    }

    pub fn var_index(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|v| v.name == name)
    }

    pub fn derived_param_names(&self) -> Vec<String> {
        self.derived_params.iter().map(|d| d.name.clone()).collect()
    }

    pub fn extra_global_param_names(&self) -> Vec<String> {
        self.extra_global_params.iter().map(|e| e.name.clone()).collect()
    }

    /// Evaluate every derived parameter against `params`
    pub fn derive(&self, params: &[f64], dt: f64) -> Vec<f64> {
        self.derived_params
            .iter()
            .map(|d| (d.func)(params, dt))
            .collect()
    }
}

// ============================================================================
// RULE KINDS
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct NeuronModel {
    pub schema: ModelSchema,
    pub sim_code: String,
    pub threshold_condition_code: String,
    pub reset_code: String,
    pub support_code: String,
}

impl NeuronModel {
    /// Does any simulation-time code draw random numbers?
    pub fn is_sim_rng_required(&self) -> bool {
        uses_rng(&self.sim_code)
            || uses_rng(&self.threshold_condition_code)
            || uses_rng(&self.reset_code)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WeightUpdateModel {
    pub schema: ModelSchema,
    pub sim_code: String,
    pub event_code: String,
    pub event_threshold_condition_code: String,
    pub learn_post_code: String,
    pub synapse_dynamics_code: String,
    pub sim_support_code: String,
    pub learn_post_support_code: String,
    pub synapse_dynamics_support_code: String,
}

impl WeightUpdateModel {
    pub fn has_event_code(&self) -> bool {
        !self.event_code.is_empty()
    }

    /// Rule needs a reverse (post-to-pre) view of sparse connectivity
    pub fn has_learn_post_code(&self) -> bool {
        !self.learn_post_code.is_empty()
    }

    /// Rule needs a per-synapse remap of sparse connectivity
    pub fn has_synapse_dynamics_code(&self) -> bool {
        !self.synapse_dynamics_code.is_empty()
    }

    /// Delivers input with per-synapse dendritic delay
    pub fn has_dendritic_delay(&self) -> bool {
        self.sim_code.contains("$(addToInSynDelay")
            || self.event_code.contains("$(addToInSynDelay")
    }

    /// Code strings that may reference presynaptic variables, in fixed order
    pub fn codes(&self) -> [&str; 4] {
        [
            &self.sim_code,
            &self.event_code,
            &self.learn_post_code,
            &self.synapse_dynamics_code,
        ]
    }
}

#[derive(Debug, Clone, Default)]
pub struct PostsynapticModel {
    pub schema: ModelSchema,
    pub decay_code: String,
    pub apply_input_code: String,
    pub support_code: String,
}

#[derive(Debug, Clone, Default)]
pub struct CurrentSourceModel {
    pub schema: ModelSchema,
    pub injection_code: String,
}

impl CurrentSourceModel {
    pub fn is_sim_rng_required(&self) -> bool {
        uses_rng(&self.injection_code)
    }
}

// ============================================================================
// STANDARD LIBRARY
// ============================================================================

/// Standard neuron models
pub mod neuron {
    use super::*;

    /// Izhikevich (2003) with parameters a, b, c, d
    pub fn izhikevich() -> Arc<NeuronModel> {
        static MODEL: OnceLock<Arc<NeuronModel>> = OnceLock::new();
        MODEL
            .get_or_init(|| {
                Arc::new(NeuronModel {
                    schema: ModelSchema::new("Izhikevich")
                        .with_params(&["a", "b", "c", "d"])
                        .with_vars(&[("V", "scalar"), ("U", "scalar")]),
                    sim_code: concat!(
                        "if ($(V) >= 30.0){\n",
                        "   $(V)=$(c);\n",
                        "   $(U)+=$(d);\n",
                        "}\n",
                        "$(V)+=0.5*(0.04*$(V)*$(V)+5.0*$(V)+140.0-$(U)+$(Isyn))*DT;\n",
                        "$(V)+=0.5*(0.04*$(V)*$(V)+5.0*$(V)+140.0-$(U)+$(Isyn))*DT;\n",
                        "$(U)+=$(a)*($(b)*$(V)-$(U))*DT;\n"
                    )
                    .into(),
                    threshold_condition_code: "$(V) >= 29.99".into(),
                    ..Default::default()
                })
            })
            .clone()
    }

    /// Leaky integrate-and-fire with absolute refractory period
    pub fn lif() -> Arc<NeuronModel> {
        static MODEL: OnceLock<Arc<NeuronModel>> = OnceLock::new();
        MODEL
            .get_or_init(|| {
                Arc::new(NeuronModel {
                    schema: ModelSchema::new("LIF")
                        .with_params(&[
                            "C", "TauM", "Vrest", "Vreset", "Vthresh", "Ioffset", "TauRefrac",
                        ])
                        .with_derived(vec![
                            DerivedParam::new("ExpTC", |p, dt| (-dt / p[1]).exp()),
                            DerivedParam::new("Rmembrane", |p, _| p[1] / p[0]),
                        ])
                        .with_vars(&[("V", "scalar"), ("RefracTime", "scalar")]),
                    sim_code: concat!(
                        "if ($(RefracTime) <= 0.0) {\n",
                        "  scalar alpha = (($(Isyn) + $(Ioffset)) * $(Rmembrane)) + $(Vrest);\n",
                        "  $(V) = alpha - ($(ExpTC) * (alpha - $(V)));\n",
                        "}\n",
                        "else {\n",
                        "  $(RefracTime) -= DT;\n",
                        "}\n"
                    )
                    .into(),
                    threshold_condition_code: "$(RefracTime) <= 0.0 && $(V) >= $(Vthresh)".into(),
                    reset_code: "$(V) = $(Vreset);\n$(RefracTime) = $(TauRefrac);\n".into(),
                    ..Default::default()
                })
            })
            .clone()
    }

    /// Poisson spike train drawn with exponential inter-spike intervals
    pub fn poisson() -> Arc<NeuronModel> {
        static MODEL: OnceLock<Arc<NeuronModel>> = OnceLock::new();
        MODEL
            .get_or_init(|| {
                Arc::new(NeuronModel {
                    schema: ModelSchema::new("PoissonNew")
                        .with_params(&["rate"])
                        .with_derived(vec![DerivedParam::new("isi", |p, dt| {
                            1000.0 / (p[0] * dt)
                        })])
                        .with_vars(&[("timeStepToSpike", "scalar")]),
                    sim_code: concat!(
                        "if($(timeStepToSpike) <= 0.0f) {\n",
                        "    $(timeStepToSpike) += $(isi) * $(gennrand_exponential);\n",
                        "}\n",
                        "$(timeStepToSpike) -= 1.0;\n"
                    )
                    .into(),
                    threshold_condition_code: "$(timeStepToSpike) <= 0.0".into(),
                    ..Default::default()
                })
            })
            .clone()
    }

    /// Empty neuron that only emits externally injected spikes
    pub fn spike_source() -> Arc<NeuronModel> {
        static MODEL: OnceLock<Arc<NeuronModel>> = OnceLock::new();
        MODEL
            .get_or_init(|| {
                Arc::new(NeuronModel {
                    schema: ModelSchema::new("SpikeSource"),
                    threshold_condition_code: "0".into(),
                    ..Default::default()
                })
            })
            .clone()
    }
}

/// Standard weight update models
pub mod weight_update {
    use super::*;

    pub fn static_pulse() -> Arc<WeightUpdateModel> {
        static MODEL: OnceLock<Arc<WeightUpdateModel>> = OnceLock::new();
        MODEL
            .get_or_init(|| {
                Arc::new(WeightUpdateModel {
                    schema: ModelSchema::new("StaticPulse").with_vars(&[("g", "scalar")]),
                    sim_code: "$(addToInSyn, $(g));\n".into(),
                    ..Default::default()
                })
            })
            .clone()
    }

    /// Static pulse with a per-synapse dendritic delay `d` (timesteps)
    pub fn static_pulse_dendritic_delay() -> Arc<WeightUpdateModel> {
        static MODEL: OnceLock<Arc<WeightUpdateModel>> = OnceLock::new();
        MODEL
            .get_or_init(|| {
                Arc::new(WeightUpdateModel {
                    schema: ModelSchema::new("StaticPulseDendriticDelay")
                        .with_vars(&[("g", "scalar"), ("d", "uint8_t")]),
                    sim_code: "$(addToInSynDelay, $(g), $(d));\n".into(),
                    ..Default::default()
                })
            })
            .clone()
    }

    /// Graded transmission triggered by a presynaptic voltage condition
    pub fn static_graded() -> Arc<WeightUpdateModel> {
        static MODEL: OnceLock<Arc<WeightUpdateModel>> = OnceLock::new();
        MODEL
            .get_or_init(|| {
                Arc::new(WeightUpdateModel {
                    schema: ModelSchema::new("StaticGraded")
                        .with_params(&["Epre", "Vslope"])
                        .with_vars(&[("g", "scalar")]),
                    event_code: "$(addToInSyn, fmax(0.0, $(g) * tanh(($(V_pre) - $(Epre)) / $(Vslope))* DT));\n"
                        .into(),
                    event_threshold_condition_code: "$(V_pre) > $(Epre)".into(),
                    ..Default::default()
                })
            })
            .clone()
    }

    /// Pair-based additive STDP, clipped to [Wmin, Wmax]
    pub fn stdp_additive() -> Arc<WeightUpdateModel> {
        static MODEL: OnceLock<Arc<WeightUpdateModel>> = OnceLock::new();
        MODEL
            .get_or_init(|| {
                Arc::new(WeightUpdateModel {
                    schema: ModelSchema::new("STDPAdditive")
                        .with_params(&["tauPlus", "tauMinus", "Aplus", "Aminus", "Wmin", "Wmax"])
                        .with_vars(&[("g", "scalar")]),
                    sim_code: concat!(
                        "$(addToInSyn, $(g));\n",
                        "scalar dt = $(t) - $(sT_post);\n",
                        "if (dt > 0) {\n",
                        "    scalar newWeight = $(g) - ($(Aminus) * exp(-dt / $(tauMinus)));\n",
                        "    $(g) = fmin($(Wmax), fmax($(Wmin), newWeight));\n",
                        "}\n"
                    )
                    .into(),
                    learn_post_code: concat!(
                        "scalar dt = $(t) - $(sT_pre);\n",
                        "if (dt > 0) {\n",
                        "    scalar newWeight = $(g) + ($(Aplus) * exp(-dt / $(tauPlus)));\n",
                        "    $(g) = fmin($(Wmax), fmax($(Wmin), newWeight));\n",
                        "}\n"
                    )
                    .into(),
                    ..Default::default()
                })
            })
            .clone()
    }

    /// Continuous graded transmission evaluated every timestep
    pub fn graded_continuous() -> Arc<WeightUpdateModel> {
        static MODEL: OnceLock<Arc<WeightUpdateModel>> = OnceLock::new();
        MODEL
            .get_or_init(|| {
                Arc::new(WeightUpdateModel {
                    schema: ModelSchema::new("GradedContinuous").with_vars(&[("g", "scalar")]),
                    synapse_dynamics_code: "$(addToInSyn, $(g) * $(V_pre));\n".into(),
                    ..Default::default()
                })
            })
            .clone()
    }
}

/// Standard postsynaptic models
pub mod postsynaptic {
    use super::*;

    pub fn delta_curr() -> Arc<PostsynapticModel> {
        static MODEL: OnceLock<Arc<PostsynapticModel>> = OnceLock::new();
        MODEL
            .get_or_init(|| {
                Arc::new(PostsynapticModel {
                    schema: ModelSchema::new("DeltaCurr"),
                    apply_input_code: "$(Isyn) += $(inSyn); $(inSyn) = 0;\n".into(),
                    ..Default::default()
                })
            })
            .clone()
    }

    /// Exponentially decaying current, normalised so total charge is independent of tau
    pub fn exp_curr() -> Arc<PostsynapticModel> {
        static MODEL: OnceLock<Arc<PostsynapticModel>> = OnceLock::new();
        MODEL
            .get_or_init(|| {
                Arc::new(PostsynapticModel {
                    schema: ModelSchema::new("ExpCurr")
                        .with_params(&["tau"])
                        .with_derived(vec![
                            DerivedParam::new("expDecay", |p, dt| (-dt / p[0]).exp()),
                            DerivedParam::new("init", |p, dt| {
                                (p[0] * (1.0 - (-dt / p[0]).exp())) * (1.0 / dt)
                            }),
                        ]),
                    decay_code: "$(inSyn)*=$(expDecay);\n".into(),
                    apply_input_code: "$(Isyn) += $(init) * $(inSyn);\n".into(),
                    ..Default::default()
                })
            })
            .clone()
    }

    /// Exponentially decaying conductance with reversal potential E
    pub fn exp_cond() -> Arc<PostsynapticModel> {
        static MODEL: OnceLock<Arc<PostsynapticModel>> = OnceLock::new();
        MODEL
            .get_or_init(|| {
                Arc::new(PostsynapticModel {
                    schema: ModelSchema::new("ExpCond")
                        .with_params(&["tau", "E"])
                        .with_derived(vec![DerivedParam::new("expDecay", |p, dt| {
                            (-dt / p[0]).exp()
                        })]),
                    decay_code: "$(inSyn)*=$(expDecay);\n".into(),
                    apply_input_code: "$(Isyn) += $(inSyn) * ($(E) - $(V));\n".into(),
                    ..Default::default()
                })
            })
            .clone()
    }
}

/// Standard current source models
pub mod current_source {
    use super::*;

    /// Constant current
    pub fn dc() -> Arc<CurrentSourceModel> {
        static MODEL: OnceLock<Arc<CurrentSourceModel>> = OnceLock::new();
        MODEL
            .get_or_init(|| {
                Arc::new(CurrentSourceModel {
                    schema: ModelSchema::new("DC").with_params(&["amp"]),
                    injection_code: "$(injectCurrent, $(amp));\n".into(),
                })
            })
            .clone()
    }

    /// Normally distributed noise current
    pub fn gaussian_noise() -> Arc<CurrentSourceModel> {
        static MODEL: OnceLock<Arc<CurrentSourceModel>> = OnceLock::new();
        MODEL
            .get_or_init(|| {
                Arc::new(CurrentSourceModel {
                    schema: ModelSchema::new("GaussianNoise").with_params(&["mean", "sd"]),
                    injection_code: "$(injectCurrent, $(mean) + $(gennrand_normal) * $(sd));\n"
                        .into(),
                })
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_references() {
        let wu = weight_update::static_graded();
        assert!(references(&wu.event_code, "V", "_pre"));
        assert!(!references(&wu.event_code, "U", "_pre"));
        assert!(!references("$(Vx_pre)", "V", "_pre"));
    }

    #[test]
    fn test_value_substitutions() {
        let mut code = "$(V_pre) > $(Epre) && $(Epre) < $(Vslope)".to_string();
        value_substitutions(
            &mut code,
            &["Epre".to_string(), "Vslope".to_string()],
            &[-50.0, 2.5],
        );
        assert_eq!(code, "$(V_pre) > (-50) && (-50) < (2.5)");
    }

    #[test]
    fn test_name_substitutions() {
        let mut code = "$(rates)[$(id)]".to_string();
        name_substitutions(&mut code, &["rates".to_string()], "Stim");
        assert_eq!(code, "ratesStim[$(id)]");
    }

    #[test]
    fn test_rng_detection() {
        assert!(neuron::poisson().is_sim_rng_required());
        assert!(!neuron::izhikevich().is_sim_rng_required());
        assert!(current_source::gaussian_noise().is_sim_rng_required());
        assert!(!current_source::dc().is_sim_rng_required());
    }

    #[test]
    fn test_weight_update_capabilities() {
        assert!(weight_update::static_graded().has_event_code());
        assert!(weight_update::stdp_additive().has_learn_post_code());
        assert!(weight_update::graded_continuous().has_synapse_dynamics_code());
        assert!(weight_update::static_pulse_dendritic_delay().has_dendritic_delay());
        assert!(!weight_update::static_pulse().has_dendritic_delay());
    }

    #[test]
    fn test_derived_params() {
        let lif = neuron::lif();
        let derived = lif
            .schema
            .derive(&[0.25, 10.0, -65.0, -65.0, -50.0, 0.0, 2.0], 0.1);
        assert!((derived[0] - (-0.01f64).exp()).abs() < 1e-12);
        assert!((derived[1] - 40.0).abs() < 1e-12);
    }

    #[test]
    fn test_library_models_are_shared() {
        assert!(Arc::ptr_eq(&postsynaptic::exp_curr(), &postsynaptic::exp_curr()));
        assert_eq!(neuron::izhikevich().schema.var_index("U"), Some(1));
    }
}
