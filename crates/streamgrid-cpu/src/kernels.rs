//! Simulated compute grid.
//!
//! A launch runs its blocks in parallel on the rayon pool. Block `b`
//! covers tiles `b, b + blocks, b + 2 * blocks, ...` of `threads_per_block`
//! elements each (a grid-stride loop), so a block cap never changes which
//! elements are computed. Each block owns a staging area sized from the
//! launch's shared-memory request.

use std::sync::Arc;

use rayon::prelude::*;

use streamgrid_core::error::{DeviceError, DeviceResult};
use streamgrid_core::kernel::{dia_row, KernelLaunch};

use crate::memory::DeviceMemory;

/// Launch arguments with buffer handles resolved to memory.
#[derive(Debug, Clone)]
pub(crate) enum ResolvedArgs {
    Axpy {
        scalars: Arc<DeviceMemory>,
        x: Arc<DeviceMemory>,
        y: Arc<DeviceMemory>,
    },
    SparseDia {
        scalars: Arc<DeviceMemory>,
        values: Arc<DeviceMemory>,
        x: Arc<DeviceMemory>,
        y: Arc<DeviceMemory>,
        num_diagonals: usize,
    },
}

/// A launch ready to run on a stream worker.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedLaunch {
    pub launch: KernelLaunch,
    pub args: ResolvedArgs,
}

/// Tile ranges (relative to the chunk) that block `block` processes.
fn block_tiles(
    block: usize,
    blocks: usize,
    threads: usize,
    len: usize,
) -> impl Iterator<Item = (usize, usize)> {
    let tiles = len.div_ceil(threads);
    (block..tiles).step_by(blocks).map(move |tile| {
        let start = tile * threads;
        (start, threads.min(len - start))
    })
}

/// Run one launch to completion.
pub(crate) fn execute(resolved: &ResolvedLaunch) -> DeviceResult<()> {
    let launch = &resolved.launch;
    let blocks = launch.geometry.blocks as usize;
    let threads = launch.geometry.threads_per_block as usize;
    if blocks == 0 || threads == 0 {
        return Err(DeviceError::Launch(format!(
            "empty grid {}x{}",
            blocks, threads
        )));
    }

    match &resolved.args {
        ResolvedArgs::Axpy { scalars, x, y } => axpy(launch, blocks, threads, scalars, x, y),
        ResolvedArgs::SparseDia {
            scalars,
            values,
            x,
            y,
            num_diagonals,
        } => dia_matvec(launch, blocks, threads, scalars, values, x, y, *num_diagonals),
    }
}

fn axpy(
    launch: &KernelLaunch,
    blocks: usize,
    threads: usize,
    scalars: &DeviceMemory,
    x: &DeviceMemory,
    y: &DeviceMemory,
) -> DeviceResult<()> {
    let staging_len = launch.shared_mem_bytes / std::mem::size_of::<f64>();
    if staging_len < 2 * threads {
        return Err(DeviceError::Launch(format!(
            "axpy needs {} bytes of shared memory, got {}",
            2 * threads * std::mem::size_of::<f64>(),
            launch.shared_mem_bytes
        )));
    }

    // SAFETY: the scalar block is written once before any launch.
    let a = unsafe { scalars.region(0, 1) }?[0];
    let chunk = launch.chunk;

    (0..blocks).into_par_iter().try_for_each(|block| {
        let mut shared = vec![0.0f64; staging_len];
        let (shared_y, shared_x) = shared.split_at_mut(threads);
        for (start, len) in block_tiles(block, blocks, threads, chunk.len) {
            let offset = chunk.offset + start;
            // SAFETY: tiles are disjoint across blocks and lie inside this
            // launch's chunk, which no other stream touches.
            let (xs, ys) = unsafe { (x.region(offset, len)?, y.region_mut(offset, len)?) };
            for tid in 0..len {
                shared_y[tid] = ys[tid];
                shared_x[tid] = xs[tid];
                shared_y[tid] = a * shared_x[tid] + shared_y[tid];
                ys[tid] = shared_y[tid];
            }
        }
        Ok(())
    })
}

#[allow(clippy::too_many_arguments)]
fn dia_matvec(
    launch: &KernelLaunch,
    blocks: usize,
    threads: usize,
    scalars: &DeviceMemory,
    values: &DeviceMemory,
    x: &DeviceMemory,
    y: &DeviceMemory,
    num_diagonals: usize,
) -> DeviceResult<()> {
    let n = launch.problem_size;
    let chunk = launch.chunk;
    let unroll = launch.unroll_factor as usize;

    // SAFETY: scalars and x are broadcast before any launch and never
    // written afterwards.
    let (offsets, x_all): (Vec<i64>, &[f64]) = unsafe {
        let raw = scalars.region(0, num_diagonals)?;
        (raw.iter().map(|&o| o as i64).collect(), x.region(0, n)?)
    };

    // SAFETY: each plane region belongs to this launch's chunk; other
    // streams only write other chunks' regions.
    let planes: Vec<&[f64]> = (0..num_diagonals)
        .map(|k| unsafe { values.region(k * n + chunk.offset, chunk.len) })
        .collect::<DeviceResult<_>>()?;

    (0..blocks).into_par_iter().try_for_each(|block| {
        for (start, len) in block_tiles(block, blocks, threads, chunk.len) {
            // SAFETY: disjoint tile inside this chunk.
            let ys = unsafe { y.region_mut(chunk.offset + start, len)? };
            for (tid, yv) in ys.iter_mut().enumerate() {
                let local = start + tid;
                let row = chunk.offset + local;
                *yv += dia_row(row, &offsets, unroll, x_all, |k| planes[k][local]);
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamgrid_core::device::BufferHandle;
    use streamgrid_core::kernel::{reference, KernelArgs, LaunchGeometry};
    use streamgrid_core::params::CachePreference;
    use streamgrid_core::partition::Chunk;

    fn memory(data: &[f64]) -> Arc<DeviceMemory> {
        let mem = DeviceMemory::new(data.len()).unwrap();
        unsafe { mem.write(0, data) }.unwrap();
        Arc::new(mem)
    }

    fn contents(mem: &DeviceMemory) -> Vec<f64> {
        unsafe { mem.region(0, mem.len()) }.unwrap().to_vec()
    }

    fn launch(blocks: u32, threads: u32, chunk: Chunk, n: usize, shared: usize) -> KernelLaunch {
        KernelLaunch {
            geometry: LaunchGeometry {
                blocks,
                threads_per_block: threads,
            },
            shared_mem_bytes: shared,
            cache_preference: CachePreference::PreferNone,
            unroll_factor: 1,
            chunk,
            problem_size: n,
            args: KernelArgs::Axpy {
                scalars: BufferHandle(0),
                x: BufferHandle(0),
                y: BufferHandle(0),
            },
        }
    }

    #[test]
    fn test_block_tiles_grid_stride() {
        let tiles: Vec<_> = block_tiles(1, 2, 4, 18).collect();
        assert_eq!(tiles, vec![(4, 4), (12, 4)]);
        let tiles: Vec<_> = block_tiles(0, 2, 4, 18).collect();
        assert_eq!(tiles, vec![(0, 4), (8, 4), (16, 2)]);
    }

    #[test]
    fn test_axpy_chunk_only() {
        let n = 20;
        let x: Vec<f64> = (0..n).map(|i| i as f64).collect();
        let y = vec![1.0; n];
        let resolved = ResolvedLaunch {
            launch: launch(
                2,
                4,
                Chunk {
                    stream_index: 0,
                    offset: 5,
                    len: 10,
                },
                n,
                64,
            ),
            args: ResolvedArgs::Axpy {
                scalars: memory(&[3.0]),
                x: memory(&x),
                y: memory(&y),
            },
        };
        execute(&resolved).unwrap();

        let ResolvedArgs::Axpy { y, .. } = &resolved.args else {
            unreachable!()
        };
        let out = contents(y);
        for (i, v) in out.iter().enumerate() {
            if (5..15).contains(&i) {
                assert_eq!(*v, 3.0 * i as f64 + 1.0);
            } else {
                assert_eq!(*v, 1.0);
            }
        }
    }

    #[test]
    fn test_axpy_rejects_small_staging() {
        let resolved = ResolvedLaunch {
            launch: launch(
                1,
                8,
                Chunk {
                    stream_index: 0,
                    offset: 0,
                    len: 4,
                },
                4,
                8,
            ),
            args: ResolvedArgs::Axpy {
                scalars: memory(&[1.0]),
                x: memory(&[0.0; 4]),
                y: memory(&[0.0; 4]),
            },
        };
        assert!(matches!(execute(&resolved), Err(DeviceError::Launch(_))));
    }

    #[test]
    fn test_dia_matches_reference() {
        let n = 16;
        let offsets = reference::stencil_offsets(4, 1);
        let values: Vec<f64> = (0..n * offsets.len())
            .map(|i| ((i * 7) % 11) as f64 - 5.0)
            .collect();
        let x: Vec<f64> = (0..n).map(|i| (i as f64).sin()).collect();
        let scalars: Vec<f64> = offsets.iter().map(|&o| o as f64).collect();

        let y_mem = memory(&vec![0.5; n]);
        for (offset, len) in [(0, 7), (7, 9)] {
            let mut l = launch(
                1,
                4,
                Chunk {
                    stream_index: 0,
                    offset,
                    len,
                },
                n,
                0,
            );
            l.unroll_factor = 3;
            let resolved = ResolvedLaunch {
                launch: l,
                args: ResolvedArgs::SparseDia {
                    scalars: memory(&scalars),
                    values: memory(&values),
                    x: memory(&x),
                    y: y_mem.clone(),
                    num_diagonals: offsets.len(),
                },
            };
            execute(&resolved).unwrap();
        }

        let mut expected = vec![0.5; n];
        reference::dia_matvec(&values, &offsets, &x, &mut expected);
        for (got, want) in contents(&y_mem).iter().zip(&expected) {
            assert!((got - want).abs() < 1e-12, "{} vs {}", got, want);
        }
    }
}
