//! Tuning-space enumeration for external search loops.
//!
//! A [`TuningSpace`] is the cartesian product of candidate values per
//! axis. The search loop that times candidates lives outside this crate;
//! it walks the space by index or iterator and feeds each
//! [`ParameterVector`] to the engine.

use serde::{Deserialize, Serialize};

use crate::device::DeviceLimits;
use crate::error::{ExecutionError, Result};
use crate::params::{CachePreference, ParameterVector};

/// Candidate values per axis, as read from a search description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningSpaceConfig {
    /// Threads per block (`TC`).
    pub threads_per_block: Vec<i64>,
    /// Block caps (`BC`). Empty means uncapped.
    pub block_counts: Vec<i64>,
    /// Stream counts.
    pub stream_counts: Vec<i64>,
    /// Unroll factors (`UIF`).
    pub unroll_factors: Vec<i64>,
    /// Preferred L1 sizes in KiB (`PL`), mapped to cache preferences.
    pub prefer_l1_kib: Vec<u32>,
    /// Host pinning choices.
    pub pinned: Vec<bool>,
}

impl Default for TuningSpaceConfig {
    fn default() -> Self {
        Self {
            threads_per_block: vec![32, 64, 128, 256],
            block_counts: vec![16, 32, 48, 64, 80],
            stream_counts: vec![1, 2, 4],
            unroll_factors: (1..=5).collect(),
            prefer_l1_kib: vec![16, 48],
            pinned: vec![false],
        }
    }
}

/// Validated tuning space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuningSpace {
    threads: Vec<i64>,
    blocks: Vec<Option<i64>>,
    streams: Vec<i64>,
    unrolls: Vec<i64>,
    caches: Vec<CachePreference>,
    pinned: Vec<bool>,
}

impl TuningSpace {
    /// Build a space, rejecting empty axes and non-positive values.
    pub fn from_config(config: &TuningSpaceConfig) -> Result<Self> {
        non_empty("threads_per_block", &config.threads_per_block)?;
        non_empty("stream_counts", &config.stream_counts)?;
        non_empty("unroll_factors", &config.unroll_factors)?;

        let blocks = if config.block_counts.is_empty() {
            vec![None]
        } else {
            config.block_counts.iter().copied().map(Some).collect()
        };
        let caches = if config.prefer_l1_kib.is_empty() {
            vec![CachePreference::PreferNone]
        } else {
            config
                .prefer_l1_kib
                .iter()
                .map(|&kib| CachePreference::from_l1_kib(kib))
                .collect()
        };
        let pinned = if config.pinned.is_empty() {
            vec![false]
        } else {
            config.pinned.clone()
        };

        let space = Self {
            threads: config.threads_per_block.clone(),
            blocks,
            streams: config.stream_counts.clone(),
            unrolls: config.unroll_factors.clone(),
            caches,
            pinned,
        };

        // Every axis value must produce a valid vector on its own.
        for index in 0..space.axis_max() {
            space.vector_at(
                index.min(space.threads.len() - 1),
                index.min(space.blocks.len() - 1),
                index.min(space.streams.len() - 1),
                index.min(space.unrolls.len() - 1),
                0,
                0,
            )?;
        }
        Ok(space)
    }

    /// Number of points in the space.
    pub fn len(&self) -> usize {
        self.dims().iter().product()
    }

    /// Whether the space has no points.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The point at `index` in row-major order (threads slowest, pinning fastest).
    pub fn get(&self, index: usize) -> Option<ParameterVector> {
        if index >= self.len() {
            return None;
        }
        let dims = self.dims();
        let mut coords = [0usize; 6];
        let mut rest = index;
        for axis in (0..6).rev() {
            coords[axis] = rest % dims[axis];
            rest /= dims[axis];
        }
        self.vector_at(coords[0], coords[1], coords[2], coords[3], coords[4], coords[5])
            .ok()
    }

    /// Iterate every point.
    pub fn iter(&self) -> impl Iterator<Item = ParameterVector> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Points that fit within `limits`.
    pub fn filter_for(&self, limits: &DeviceLimits) -> Vec<ParameterVector> {
        self.iter().filter(|p| p.validate_for(limits).is_ok()).collect()
    }

    fn dims(&self) -> [usize; 6] {
        [
            self.threads.len(),
            self.blocks.len(),
            self.streams.len(),
            self.unrolls.len(),
            self.caches.len(),
            self.pinned.len(),
        ]
    }

    fn axis_max(&self) -> usize {
        self.dims().into_iter().max().unwrap_or(0)
    }

    fn vector_at(
        &self,
        t: usize,
        b: usize,
        s: usize,
        u: usize,
        c: usize,
        p: usize,
    ) -> Result<ParameterVector> {
        let mut builder = ParameterVector::builder()
            .threads_per_block(self.threads[t])
            .stream_count(self.streams[s])
            .unroll_factor(self.unrolls[u])
            .cache_preference(self.caches[c])
            .use_pinned_host(self.pinned[p]);
        if let Some(blocks) = self.blocks[b] {
            builder = builder.block_count(blocks);
        }
        builder.build()
    }
}

fn non_empty(name: &str, values: &[i64]) -> Result<()> {
    if values.is_empty() {
        return Err(ExecutionError::InvalidParameter(format!(
            "tuning axis {} has no candidates",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_space() {
        let space = TuningSpace::from_config(&TuningSpaceConfig::default()).unwrap();
        assert_eq!(space.len(), 4 * 5 * 3 * 5 * 2);

        let first = space.get(0).unwrap();
        assert_eq!(first.threads_per_block(), 32);
        assert_eq!(first.block_count(), Some(16));
        assert_eq!(first.stream_count(), 1);
        assert_eq!(first.unroll_factor(), 1);
        assert_eq!(first.cache_preference(), CachePreference::PreferShared);

        let last = space.get(space.len() - 1).unwrap();
        assert_eq!(last.threads_per_block(), 256);
        assert_eq!(last.block_count(), Some(80));
        assert_eq!(last.cache_preference(), CachePreference::PreferL1);
        assert!(space.get(space.len()).is_none());
    }

    #[test]
    fn test_iter_visits_each_point_once() {
        let config = TuningSpaceConfig {
            threads_per_block: vec![32, 64],
            block_counts: Vec::new(),
            stream_counts: vec![1, 2, 3],
            unroll_factors: vec![1],
            prefer_l1_kib: Vec::new(),
            pinned: vec![false, true],
        };
        let space = TuningSpace::from_config(&config).unwrap();
        let points: Vec<_> = space.iter().collect();
        assert_eq!(points.len(), 12);
        let unique: std::collections::HashSet<_> = points.iter().collect();
        assert_eq!(unique.len(), 12);
        assert!(points.iter().all(|p| p.block_count().is_none()));
    }

    #[test]
    fn test_rejects_invalid_axes() {
        let empty = TuningSpaceConfig {
            stream_counts: Vec::new(),
            ..TuningSpaceConfig::default()
        };
        assert!(TuningSpace::from_config(&empty).is_err());

        let negative = TuningSpaceConfig {
            unroll_factors: vec![1, 2, -1],
            ..TuningSpaceConfig::default()
        };
        assert!(TuningSpace::from_config(&negative).is_err());
    }

    #[test]
    fn test_filter_for_limits() {
        let config = TuningSpaceConfig {
            threads_per_block: vec![512, 1024, 2048],
            block_counts: Vec::new(),
            stream_counts: vec![2, 64],
            unroll_factors: vec![1],
            prefer_l1_kib: Vec::new(),
            pinned: Vec::new(),
        };
        let space = TuningSpace::from_config(&config).unwrap();
        let fitting = space.filter_for(&DeviceLimits::default());
        assert_eq!(fitting.len(), 2);
        assert!(fitting.iter().all(|p| p.stream_count() == 2));
    }

    #[test]
    fn test_from_toml() {
        let config: TuningSpaceConfig = toml::from_str(
            r#"
            threads_per_block = [128]
            stream_counts = [4]
            "#,
        )
        .unwrap();
        assert_eq!(config.unroll_factors, vec![1, 2, 3, 4, 5]);
        let space = TuningSpace::from_config(&config).unwrap();
        assert_eq!(space.len(), 5 * 5 * 2);
    }
}
