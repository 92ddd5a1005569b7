//! Partition planning.
//!
//! Splits `[0, N)` into per-stream chunks. Each stream gets `N / S`
//! elements at increasing offsets; the remainder always lands on the last
//! stream, either folded into its chunk or as a trailing chunk of its own.

use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, Result};

/// Where the `N % S` leftover elements go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemainderPolicy {
    /// Extend the last stream's chunk (one launch per stream).
    #[default]
    FoldIntoLast,
    /// Emit a separate trailing chunk on the last stream.
    TrailingChunk,
}

/// A contiguous range of logical elements assigned to one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    /// Index of the stream (creation order) that processes this chunk.
    pub stream_index: usize,
    /// First element.
    pub offset: usize,
    /// Number of elements. Always > 0.
    pub len: usize,
}

impl Chunk {
    /// One past the last element.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Ordered chunk list for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlan {
    problem_size: usize,
    stream_count: usize,
    chunks: Vec<Chunk>,
}

impl PartitionPlan {
    /// Plan `problem_size` elements over `requested_streams` streams.
    ///
    /// The effective stream count is clamped to `max(1, min(S, N))` so no
    /// zero-length chunk is ever produced. `N == 0` yields an empty plan.
    pub fn new(problem_size: i64, requested_streams: u32, policy: RemainderPolicy) -> Result<Self> {
        if problem_size < 0 {
            return Err(ExecutionError::InvalidPartition { size: problem_size });
        }
        let n = usize::try_from(problem_size)
            .map_err(|_| ExecutionError::InvalidPartition { size: problem_size })?;
        if requested_streams == 0 {
            return Err(ExecutionError::InvalidParameter(
                "stream_count must be positive, got 0".to_string(),
            ));
        }

        let streams = (requested_streams as usize).min(n).max(1);
        if n == 0 {
            return Ok(Self {
                problem_size: 0,
                stream_count: streams,
                chunks: Vec::new(),
            });
        }

        let base = n / streams;
        let remainder = n % streams;
        let mut chunks = Vec::with_capacity(streams + 1);
        for stream_index in 0..streams {
            chunks.push(Chunk {
                stream_index,
                offset: stream_index * base,
                len: base,
            });
        }

        if remainder > 0 {
            let last = streams - 1;
            match policy {
                RemainderPolicy::FoldIntoLast => {
                    chunks[last].len += remainder;
                }
                RemainderPolicy::TrailingChunk => chunks.push(Chunk {
                    stream_index: last,
                    offset: streams * base,
                    len: remainder,
                }),
            }
        }

        Ok(Self {
            problem_size: n,
            stream_count: streams,
            chunks,
        })
    }

    /// Problem size `N`.
    pub fn problem_size(&self) -> usize {
        self.problem_size
    }

    /// Effective number of streams after clamping.
    pub fn stream_count(&self) -> usize {
        self.stream_count
    }

    /// Chunks in dispatch order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Whether there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunk lengths in dispatch order.
    pub fn lengths(&self) -> Vec<usize> {
        self.chunks.iter().map(|c| c.len).collect()
    }

    /// Chunks assigned to one stream.
    pub fn chunks_for_stream(&self, stream_index: usize) -> impl Iterator<Item = &Chunk> {
        self.chunks
            .iter()
            .filter(move |c| c.stream_index == stream_index)
    }
}
