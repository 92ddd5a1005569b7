//! # Poisson Stencil Example
//!
//! Applies the five-point Laplacian of a 2-D grid, stored by diagonals, and
//! checks the result against the dense product.
//!
//! ## Run this example:
//! ```bash
//! cargo run -p streamgrid --example poisson_stencil
//! ```

use streamgrid::kernel::reference;
use streamgrid::prelude::*;

fn main() -> streamgrid::Result<()> {
    let grid = StreamGrid::new()?;
    let m = 64;
    let a = DiaMatrix::laplacian_2d(m, 1);
    let n = a.order();

    // Smooth field: the Laplacian is small in the interior.
    let x: Vec<f64> = (0..n)
        .map(|i| {
            let (r, c) = ((i / m) as f64, (i % m) as f64);
            (r * 0.1).sin() + (c * 0.1).cos()
        })
        .collect();
    let mut y = vec![0.0; n];

    let tuning = ParameterVector::builder()
        .threads_per_block(128)
        .stream_count(4)
        .unroll_factor(5)
        .cache_preference(CachePreference::PreferL1)
        .build()?;
    grid.dia_matvec(&a, &x, &mut y, &tuning)?;

    let mut expected = vec![0.0; n];
    reference::dense_matvec(&a.to_dense(), &x, &mut expected);
    let max_err = y
        .iter()
        .zip(&expected)
        .map(|(g, w)| (g - w).abs())
        .fold(0.0f64, f64::max);

    println!("{}x{} grid, {} diagonals on {}", m, m, a.num_diagonals(), grid.device_name());
    println!("max |error| vs dense: {:.3e}", max_err);
    Ok(())
}
