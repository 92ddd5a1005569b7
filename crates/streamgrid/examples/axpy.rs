//! # AXPY Example
//!
//! Runs `y = a * x + y` over a million elements with four streams and
//! prints the dispatch report.
//!
//! ## Run this example:
//! ```bash
//! cargo run -p streamgrid --example axpy
//! ```

use streamgrid::prelude::*;

fn main() -> streamgrid::Result<()> {
    let grid = StreamGrid::new()?;
    println!("Backend: {} ({})", grid.backend(), grid.device_name());

    let n = 1_000_000;
    let x = vec![1.0; n];
    let mut y = vec![0.0; n];
    let tuning = ParameterVector::builder()
        .threads_per_block(256)
        .stream_count(4)
        .use_pinned_host(true)
        .build()?;

    let report = grid.execute_with_report(
        ExecutionRequest::axpy(2.0, &x, &mut y, tuning),
        &ExecutionControl::new(),
    )?;

    println!("{}", report);
    println!("y[0] = {}, y[{}] = {}", y[0], n - 1, y[n - 1]);
    Ok(())
}
