//! Sparse connectivity layouts.
//!
//! Two storage formats are supported:
//!
//! - **Ragged**: fixed stride of `max_row_length` slots per presynaptic row
//!   with a per-row fill count. This is what finalization produces.
//! - **YALE** (compressed sparse row): prefix-summed row starts. Kept for
//!   interoperability with dense weight matrices.
//!
//! Both support a reverse (post-to-pre) view for learning rules that run on
//! postsynaptic spikes, and a per-synapse index for continuous dynamics.
//! Derived views are snapshots: they must be rebuilt after the forward
//! structure changes.

use crate::{GennError, Result};
use ndarray::ArrayView2;
use num_traits::Float;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Sparse layout tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SparseConfig {
    /// Dense entries with magnitude at or below this are treated as absent
    pub as_good_as_zero: f64,
}

impl Default for SparseConfig {
    fn default() -> Self {
        Self {
            as_good_as_zero: 1e-19,
        }
    }
}

/// Number of values whose magnitude exceeds `threshold`
pub fn count_entries_above<T: Float>(values: &[T], threshold: T) -> usize {
    values.iter().filter(|v| v.abs() > threshold).count()
}

/// Scan a dense matrix row by row, keeping entries above the threshold
fn scan_dense<T>(weights: &ArrayView2<'_, T>, config: &SparseConfig) -> Vec<Vec<(u32, T)>>
where
    T: Float + Send + Sync,
{
    let threshold = T::from(config.as_good_as_zero).unwrap_or_else(T::zero);
    (0..weights.nrows())
        .into_par_iter()
        .map(|pre| {
            weights
                .row(pre)
                .iter()
                .enumerate()
                .filter(|(_, w)| w.abs() > threshold)
                .map(|(post, &w)| (post as u32, w))
                .collect()
        })
        .collect()
}

// ============================================================================
// RAGGED LAYOUT
// ============================================================================

/// Column-major reverse view of a ragged projection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseProjection {
    max_col_length: usize,
    col_length: Vec<u32>,
    /// Forward slot index (`pre * max_row_length + j`) per column slot
    remap: Vec<u32>,
}

impl ReverseProjection {
    pub fn max_col_length(&self) -> usize {
        self.max_col_length
    }

    pub fn col_length(&self) -> &[u32] {
        &self.col_length
    }

    pub fn remap(&self) -> &[u32] {
        &self.remap
    }

    /// Forward slot indices of synapses onto `post`, `None` if out of range
    pub fn column(&self, post: usize) -> Option<&[u32]> {
        let start = post * self.max_col_length;
        let len = *self.col_length.get(post)? as usize;
        self.remap.get(start..start + len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaggedProjection {
    max_row_length: usize,
    row_length: Vec<u32>,
    ind: Vec<u32>,
    reverse: Option<ReverseProjection>,
    /// `[count, slot_0, slot_1, ...]` in source-major order
    syn_remap: Option<Vec<u32>>,
}

impl RaggedProjection {
    /// Empty projection with `num_pre` rows of capacity `max_row_length`
    pub fn new(num_pre: usize, max_row_length: usize) -> Self {
        Self {
            max_row_length,
            row_length: vec![0; num_pre],
            ind: vec![0; num_pre * max_row_length],
            reverse: None,
            syn_remap: None,
        }
    }

    /// Build from explicit target lists, one per presynaptic row
    pub fn from_rows(max_row_length: usize, rows: &[Vec<u32>]) -> Result<Self> {
        let mut projection = Self::new(rows.len(), max_row_length);
        for (pre, row) in rows.iter().enumerate() {
            for &post in row {
                projection.push(pre, post)?;
            }
        }
        Ok(projection)
    }

    /// Build from a dense weight matrix, with row stride equal to the longest row.
    ///
    /// Returns the projection and the retained weights in slot order, with
    /// padding slots set to zero.
    pub fn from_dense<T>(weights: ArrayView2<'_, T>, config: &SparseConfig) -> (Self, Vec<T>)
    where
        T: Float + Send + Sync,
    {
        let rows = scan_dense(&weights, config);
        let max_row_length = rows.iter().map(Vec::len).max().unwrap_or(0);
        Self::pack(rows, max_row_length)
    }

    /// As [`RaggedProjection::from_dense`] with a caller-chosen stride
    pub fn from_dense_padded<T>(
        weights: ArrayView2<'_, T>,
        max_row_length: usize,
        config: &SparseConfig,
    ) -> Result<(Self, Vec<T>)>
    where
        T: Float + Send + Sync,
    {
        let rows = scan_dense(&weights, config);
        if let Some((pre, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() > max_row_length)
        {
            return Err(GennError::InvalidConnectivity(format!(
                "row {} has {} entries above threshold but max row length is {}",
                pre,
                row.len(),
                max_row_length
            )));
        }
        Ok(Self::pack(rows, max_row_length))
    }

    fn pack<T: Float>(rows: Vec<Vec<(u32, T)>>, max_row_length: usize) -> (Self, Vec<T>) {
        let mut projection = Self::new(rows.len(), max_row_length);
        let mut values = vec![T::zero(); rows.len() * max_row_length];
        for (pre, row) in rows.into_iter().enumerate() {
            projection.row_length[pre] = row.len() as u32;
            for (j, (post, w)) in row.into_iter().enumerate() {
                let slot = pre * max_row_length + j;
                projection.ind[slot] = post;
                values[slot] = w;
            }
        }
        (projection, values)
    }

    /// Append a synapse to the end of `pre`'s row, invalidating derived views
    pub fn push(&mut self, pre: usize, post: u32) -> Result<()> {
        let num_pre = self.num_pre();
        let len = self.row_length.get_mut(pre).ok_or_else(|| {
            GennError::InvalidConnectivity(format!(
                "presynaptic index {} out of range for {} rows",
                pre, num_pre
            ))
        })?;
        if *len as usize >= self.max_row_length {
            return Err(GennError::InvalidConnectivity(format!(
                "row {} exceeds max row length {}",
                pre, self.max_row_length
            )));
        }
        self.ind[pre * self.max_row_length + *len as usize] = post;
        *len += 1;
        self.reverse = None;
        self.syn_remap = None;
        Ok(())
    }

    pub fn num_pre(&self) -> usize {
        self.row_length.len()
    }

    pub fn max_row_length(&self) -> usize {
        self.max_row_length
    }

    pub fn row_length(&self) -> &[u32] {
        &self.row_length
    }

    pub fn ind(&self) -> &[u32] {
        &self.ind
    }

    /// Valid targets of `pre`, `None` if out of range
    pub fn row(&self, pre: usize) -> Option<&[u32]> {
        let start = pre * self.max_row_length;
        let len = *self.row_length.get(pre)? as usize;
        self.ind.get(start..start + len)
    }

    pub fn num_synapses(&self) -> usize {
        self.row_length.iter().map(|&l| l as usize).sum()
    }

    /// (pre, post) pairs in source-major order
    pub fn synapses(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        (0..self.num_pre()).flat_map(move |pre| {
            self.row(pre)
                .into_iter()
                .flatten()
                .map(move |&post| (pre, post))
        })
    }

    /// Slot index of the synapse `pre -> post`
    pub fn find(&self, pre: usize, post: u32) -> Option<usize> {
        self.row(pre)?
            .iter()
            .position(|&p| p == post)
            .map(|j| pre * self.max_row_length + j)
    }

    /// Longest column, i.e. the smallest valid reverse stride
    pub fn max_col_length_required(&self, num_post: usize) -> usize {
        let mut counts = vec![0usize; num_post];
        for (_, post) in self.synapses() {
            if let Some(c) = counts.get_mut(post as usize) {
                *c += 1;
            }
        }
        counts.into_iter().max().unwrap_or(0)
    }

    /// Check dimensions and target indices against a postsynaptic population
    pub fn validate(&self, num_pre: usize, num_post: usize) -> Result<()> {
        if self.num_pre() != num_pre {
            return Err(GennError::InvalidConnectivity(format!(
                "projection has {} rows but source population has {} neurons",
                self.num_pre(),
                num_pre
            )));
        }
        if let Some((pre, post)) = self.synapses().find(|&(_, post)| post as usize >= num_post) {
            return Err(GennError::InvalidConnectivity(format!(
                "synapse {} -> {} targets beyond postsynaptic population of {}",
                pre, post, num_post
            )));
        }
        Ok(())
    }

    /// Build the column-major reverse view.
    ///
    /// Column slots are filled in source-major scan order.
    pub fn create_post_to_pre(&mut self, num_post: usize, max_col_length: usize) -> Result<()> {
        let mut col_length = vec![0u32; num_post];
        let mut remap = vec![0u32; num_post * max_col_length];
        for pre in 0..self.num_pre() {
            for j in 0..self.row_length[pre] as usize {
                let slot = pre * self.max_row_length + j;
                let post = self.ind[slot] as usize;
                let count = col_length.get_mut(post).ok_or_else(|| {
                    GennError::InvalidConnectivity(format!(
                        "synapse {} -> {} targets beyond postsynaptic population of {}",
                        pre, post, num_post
                    ))
                })?;
                if *count as usize >= max_col_length {
                    return Err(GennError::InvalidConnectivity(format!(
                        "column {} exceeds max column length {}",
                        post, max_col_length
                    )));
                }
                remap[post * max_col_length + *count as usize] = slot as u32;
                *count += 1;
            }
        }
        self.reverse = Some(ReverseProjection {
            max_col_length,
            col_length,
            remap,
        });
        Ok(())
    }

    /// Build the flat per-synapse index, prefixed by the synapse count
    pub fn create_pre_indices(&mut self) {
        let mut remap = Vec::with_capacity(self.num_synapses() + 1);
        remap.push(self.num_synapses() as u32);
        for pre in 0..self.num_pre() {
            let start = pre * self.max_row_length;
            remap.extend((0..self.row_length[pre]).map(|j| (start + j as usize) as u32));
        }
        self.syn_remap = Some(remap);
    }

    pub fn reverse(&self) -> Option<&ReverseProjection> {
        self.reverse.as_ref()
    }

    pub fn syn_remap(&self) -> Option<&[u32]> {
        self.syn_remap.as_deref()
    }
}

// ============================================================================
// YALE LAYOUT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YaleReverse {
    rev_ind_in_g: Vec<u32>,
    rev_ind: Vec<u32>,
    remap: Vec<u32>,
}

impl YaleReverse {
    /// Prefix-summed column starts, length `num_post + 1`
    pub fn rev_ind_in_g(&self) -> &[u32] {
        &self.rev_ind_in_g
    }

    /// Presynaptic index per column entry
    pub fn rev_ind(&self) -> &[u32] {
        &self.rev_ind
    }

    /// Forward synapse index per column entry
    pub fn remap(&self) -> &[u32] {
        &self.remap
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YaleProjection {
    ind_in_g: Vec<u32>,
    ind: Vec<u32>,
    reverse: Option<YaleReverse>,
    pre_ind: Option<Vec<u32>>,
}

impl YaleProjection {
    /// Compress a dense weight matrix, returning the retained weights in synapse order
    pub fn from_dense<T>(weights: ArrayView2<'_, T>, config: &SparseConfig) -> (Self, Vec<T>)
    where
        T: Float + Send + Sync,
    {
        let rows = scan_dense(&weights, config);
        let mut ind_in_g = Vec::with_capacity(rows.len() + 1);
        let mut ind = Vec::new();
        let mut values = Vec::new();
        ind_in_g.push(0);
        for row in rows {
            for (post, w) in row {
                ind.push(post);
                values.push(w);
            }
            ind_in_g.push(ind.len() as u32);
        }
        (
            Self {
                ind_in_g,
                ind,
                reverse: None,
                pre_ind: None,
            },
            values,
        )
    }

    pub fn num_pre(&self) -> usize {
        self.ind_in_g.len() - 1
    }

    /// Total number of synapses
    pub fn conn_n(&self) -> usize {
        self.ind.len()
    }

    pub fn ind_in_g(&self) -> &[u32] {
        &self.ind_in_g
    }

    pub fn ind(&self) -> &[u32] {
        &self.ind
    }

    /// Synapse index of `pre -> post`
    pub fn find(&self, pre: usize, post: u32) -> Option<usize> {
        if pre >= self.num_pre() {
            return None;
        }
        let start = self.ind_in_g[pre] as usize;
        let end = self.ind_in_g[pre + 1] as usize;
        self.ind[start..end]
            .iter()
            .position(|&p| p == post)
            .map(|j| start + j)
    }

    /// Weight of `pre -> post`, if that synapse exists
    pub fn get_sparse_var<T: Copy>(&self, values: &[T], pre: usize, post: u32) -> Option<T> {
        self.find(pre, post).and_then(|syn| values.get(syn).copied())
    }

    pub fn create_post_to_pre(&mut self, num_post: usize) -> Result<()> {
        let mut counts = vec![0u32; num_post];
        for &post in &self.ind {
            let count = counts.get_mut(post as usize).ok_or_else(|| {
                GennError::InvalidConnectivity(format!(
                    "target {} beyond postsynaptic population of {}",
                    post, num_post
                ))
            })?;
            *count += 1;
        }

        let mut rev_ind_in_g = Vec::with_capacity(num_post + 1);
        rev_ind_in_g.push(0);
        for c in &counts {
            let last = rev_ind_in_g[rev_ind_in_g.len() - 1];
            rev_ind_in_g.push(last + c);
        }

        let mut fill = vec![0u32; num_post];
        let mut rev_ind = vec![0u32; self.ind.len()];
        let mut remap = vec![0u32; self.ind.len()];
        for pre in 0..self.num_pre() {
            for syn in self.ind_in_g[pre]..self.ind_in_g[pre + 1] {
                let post = self.ind[syn as usize] as usize;
                let pos = (rev_ind_in_g[post] + fill[post]) as usize;
                rev_ind[pos] = pre as u32;
                remap[pos] = syn;
                fill[post] += 1;
            }
        }

        self.reverse = Some(YaleReverse {
            rev_ind_in_g,
            rev_ind,
            remap,
        });
        Ok(())
    }

    /// Presynaptic index of every synapse
    pub fn create_pre_indices(&mut self) {
        let mut pre_ind = vec![0u32; self.ind.len()];
        for pre in 0..self.num_pre() {
            for syn in self.ind_in_g[pre]..self.ind_in_g[pre + 1] {
                pre_ind[syn as usize] = pre as u32;
            }
        }
        self.pre_ind = Some(pre_ind);
    }

    pub fn reverse(&self) -> Option<&YaleReverse> {
        self.reverse.as_ref()
    }

    pub fn pre_ind(&self) -> Option<&[u32]> {
        self.pre_ind.as_deref()
    }
}
