//! Sparse connectivity initialisation snippets.
//!
//! A snippet describes how rows of a sparse projection are generated. Most
//! carry device code only; some also provide a host row builder so the
//! projection can be materialised during finalization, and closed-form
//! bounds on row and column lengths used to size the layout.

use crate::models::{uses_rng, DerivedParam, ModelSchema, NameType};
use crate::sparse::RaggedProjection;
use crate::{check_arity, GennError, Result};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Upper bound on row or column length: (num_pre, num_post, params) -> length
pub type CalcMaxLengthFn = fn(u32, u32, &[f64]) -> u32;

/// Host-side row generator: (pre index, num_post, params) -> postsynaptic targets
pub type RowBuildFn = fn(u32, u32, &[f64]) -> Vec<u32>;

#[derive(Clone, Default)]
pub struct SparseConnectivitySnippet {
    pub schema: ModelSchema,
    pub row_build_code: String,
    pub row_build_state_vars: Vec<NameType>,
    pub calc_max_row_length: Option<CalcMaxLengthFn>,
    pub calc_max_col_length: Option<CalcMaxLengthFn>,
    pub host_row_build: Option<RowBuildFn>,
}

impl fmt::Debug for SparseConnectivitySnippet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SparseConnectivitySnippet")
            .field("schema", &self.schema)
            .field("row_build_code", &self.row_build_code)
            .field("has_max_row_length", &self.calc_max_row_length.is_some())
            .field("has_max_col_length", &self.calc_max_col_length.is_some())
            .field("has_host_row_build", &self.host_row_build.is_some())
            .finish()
    }
}

// ============================================================================
// BINOMIAL BOUNDS
// ============================================================================

/// Smallest k such that P(X <= k) >= cdf for X ~ Binomial(n, p)
pub fn binomial_inverse_cdf(cdf: f64, n: u32, p: f64) -> Result<u32> {
    if !(0.0..=1.0).contains(&cdf) {
        return Err(GennError::UnsupportedConfiguration(format!(
            "binomial inverse CDF requires 0 <= cdf <= 1, got {}",
            cdf
        )));
    }
    if p <= 0.0 {
        return Ok(0);
    }
    if p >= 1.0 {
        return Ok(n);
    }

    let log_p = p.ln();
    let log_1m_p = (1.0 - p).ln();
    let nf = n as f64;

    // ln C(n, k) built incrementally from ln C(n, k - 1)
    let mut log_choose = 0.0;
    let mut total = 0.0;
    for k in 0..=n {
        if k > 0 {
            log_choose += (nf - k as f64 + 1.0).ln() - (k as f64).ln();
        }
        let log_pmf = log_choose + k as f64 * log_p + (nf - k as f64) * log_1m_p;
        total += log_pmf.exp();
        if total >= cdf {
            return Ok(k);
        }
    }
    Ok(n)
}

/// Bound that holds for all `num_rows` rows at once with probability 0.9999
fn fixed_probability_bound(num_rows: u32, row_width: u32, prob: f64) -> u32 {
    let quantile = 0.9999f64.powf(1.0 / num_rows.max(1) as f64);
    binomial_inverse_cdf(quantile, row_width, prob).unwrap_or(row_width)
}

// ============================================================================
// STANDARD SNIPPETS
// ============================================================================

pub mod snippets {
    use super::*;

    pub fn uninitialised() -> Arc<SparseConnectivitySnippet> {
        static SNIPPET: OnceLock<Arc<SparseConnectivitySnippet>> = OnceLock::new();
        SNIPPET
            .get_or_init(|| {
                Arc::new(SparseConnectivitySnippet {
                    schema: ModelSchema::new("Uninitialised"),
                    ..Default::default()
                })
            })
            .clone()
    }

    pub fn one_to_one() -> Arc<SparseConnectivitySnippet> {
        static SNIPPET: OnceLock<Arc<SparseConnectivitySnippet>> = OnceLock::new();
        SNIPPET
            .get_or_init(|| {
                Arc::new(SparseConnectivitySnippet {
                    schema: ModelSchema::new("OneToOne"),
                    row_build_code: "$(addSynapse, $(id_pre));\n$(endRow);\n".into(),
                    calc_max_row_length: Some(|_, _, _| 1),
                    calc_max_col_length: Some(|_, _, _| 1),
                    host_row_build: Some(|pre, num_post, _| {
                        if pre < num_post {
                            vec![pre]
                        } else {
                            Vec::new()
                        }
                    }),
                    ..Default::default()
                })
            })
            .clone()
    }

    /// Each pair connected independently with probability `prob`
    pub fn fixed_probability() -> Arc<SparseConnectivitySnippet> {
        static SNIPPET: OnceLock<Arc<SparseConnectivitySnippet>> = OnceLock::new();
        SNIPPET
            .get_or_init(|| {
                Arc::new(SparseConnectivitySnippet {
                    schema: ModelSchema::new("FixedProbability")
                        .with_params(&["prob"])
                        .with_derived(vec![DerivedParam::new("probLogRecip", |p, _| {
                            1.0 / (1.0 - p[0]).ln()
                        })]),
                    row_build_code: concat!(
                        "const scalar u = $(gennrand_uniform);\n",
                        "prevJ += (1 + (int)(log(u) * $(probLogRecip)));\n",
                        "if(prevJ < $(num_post)) {\n",
                        "   $(addSynapse, prevJ);\n",
                        "}\n",
                        "else {\n",
                        "   $(endRow);\n",
                        "}\n"
                    )
                    .into(),
                    row_build_state_vars: vec![NameType::new("prevJ", "int")],
                    calc_max_row_length: Some(|num_pre, num_post, p| {
                        fixed_probability_bound(num_pre, num_post, p[0])
                    }),
                    calc_max_col_length: Some(|num_pre, num_post, p| {
                        fixed_probability_bound(num_post, num_pre, p[0])
                    }),
                    host_row_build: None,
                })
            })
            .clone()
    }
}

// ============================================================================
// CONNECTIVITY INITIALISER
// ============================================================================

/// A connectivity snippet bound to concrete parameter values
#[derive(Debug, Clone)]
pub struct ConnectivityInit {
    snippet: Arc<SparseConnectivitySnippet>,
    params: Vec<f64>,
    derived_params: Vec<f64>,
}

impl ConnectivityInit {
    pub fn new(snippet: Arc<SparseConnectivitySnippet>, params: &[f64]) -> Result<Self> {
        check_arity(
            &format!("connectivity initialiser {}", snippet.schema.name),
            "parameter values",
            snippet.schema.param_names.len(),
            params.len(),
        )?;
        Ok(Self {
            snippet,
            params: params.to_vec(),
            derived_params: Vec::new(),
        })
    }

    pub fn uninitialised() -> Self {
        Self {
            snippet: snippets::uninitialised(),
            params: Vec::new(),
            derived_params: Vec::new(),
        }
    }

    pub fn one_to_one() -> Self {
        Self {
            snippet: snippets::one_to_one(),
            params: Vec::new(),
            derived_params: Vec::new(),
        }
    }

    pub fn fixed_probability(prob: f64) -> Self {
        Self {
            snippet: snippets::fixed_probability(),
            params: vec![prob],
            derived_params: Vec::new(),
        }
    }

    pub fn snippet(&self) -> &Arc<SparseConnectivitySnippet> {
        &self.snippet
    }

    pub fn params(&self) -> &[f64] {
        &self.params
    }

    pub fn derived_params(&self) -> &[f64] {
        &self.derived_params
    }

    pub(crate) fn init_derived_params(&mut self, dt: f64) {
        self.derived_params = self.snippet.schema.derive(&self.params, dt);
    }

    /// No row-build code: connectivity must be supplied by the user
    pub fn is_uninitialised(&self) -> bool {
        self.snippet.row_build_code.is_empty()
    }

    pub fn is_rng_required(&self) -> bool {
        uses_rng(&self.snippet.row_build_code)
    }

    pub fn defines_max_row_length(&self) -> bool {
        self.snippet.calc_max_row_length.is_some()
    }

    pub fn defines_max_col_length(&self) -> bool {
        self.snippet.calc_max_col_length.is_some()
    }

    pub fn max_row_length(&self, num_pre: usize, num_post: usize) -> Option<usize> {
        self.snippet
            .calc_max_row_length
            .map(|f| f(num_pre as u32, num_post as u32, &self.params) as usize)
    }

    pub fn max_col_length(&self, num_pre: usize, num_post: usize) -> Option<usize> {
        self.snippet
            .calc_max_col_length
            .map(|f| f(num_pre as u32, num_post as u32, &self.params) as usize)
    }

    pub fn can_build_on_host(&self) -> bool {
        self.snippet.host_row_build.is_some()
    }

    /// Materialise rows with the host builder, if the snippet has one
    pub fn build_on_host(
        &self,
        num_pre: usize,
        num_post: usize,
        max_row_length: usize,
    ) -> Result<Option<RaggedProjection>> {
        let Some(build) = self.snippet.host_row_build else {
            return Ok(None);
        };
        let mut projection = RaggedProjection::new(num_pre, max_row_length);
        for pre in 0..num_pre {
            for post in build(pre as u32, num_post as u32, &self.params) {
                projection.push(pre, post)?;
            }
        }
        Ok(Some(projection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binomial_inverse_cdf_edges() {
        assert_eq!(binomial_inverse_cdf(0.5, 100, 0.0).unwrap(), 0);
        assert_eq!(binomial_inverse_cdf(0.5, 100, 1.0).unwrap(), 100);
        assert_eq!(binomial_inverse_cdf(0.0, 100, 0.3).unwrap(), 0);
        assert_eq!(binomial_inverse_cdf(1.0, 10, 0.5).unwrap(), 10);
        assert!(binomial_inverse_cdf(1.5, 10, 0.5).is_err());
    }

    #[test]
    fn test_binomial_inverse_cdf_median() {
        // Binomial(10, 0.5): P(X <= 4) = 0.377, P(X <= 5) = 0.623
        assert_eq!(binomial_inverse_cdf(0.5, 10, 0.5).unwrap(), 5);
        assert_eq!(binomial_inverse_cdf(0.3, 10, 0.5).unwrap(), 4);
    }

    #[test]
    fn test_fixed_probability_bounds() {
        let init = ConnectivityInit::fixed_probability(0.1);
        let max_row = init.max_row_length(1000, 1000).unwrap();
        // Mean row length is 100, the bound sits well above it but below num_post
        assert!(max_row > 100 && max_row < 1000);
        assert!(init.max_col_length(1000, 1000).is_some());
        assert!(init.is_rng_required());
        assert!(!init.can_build_on_host());
    }

    #[test]
    fn test_fixed_probability_derived() {
        let mut init = ConnectivityInit::fixed_probability(0.5);
        init.init_derived_params(0.1);
        assert!((init.derived_params()[0] - 1.0 / 0.5f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_one_to_one_host_build() {
        let init = ConnectivityInit::one_to_one();
        assert_eq!(init.max_row_length(5, 5), Some(1));
        let proj = init.build_on_host(5, 3, 1).unwrap().unwrap();
        assert_eq!(proj.row_length(), &[1, 1, 1, 0, 0]);
        assert_eq!(proj.row(2), Some(&[2][..]));
    }

    #[test]
    fn test_uninitialised() {
        let init = ConnectivityInit::uninitialised();
        assert!(init.is_uninitialised());
        assert!(init.max_row_length(3, 3).is_none());
        assert!(init.build_on_host(3, 3, 3).unwrap().is_none());
    }

    #[test]
    fn test_arity_checked() {
        assert!(ConnectivityInit::new(snippets::fixed_probability(), &[]).is_err());
    }
}
