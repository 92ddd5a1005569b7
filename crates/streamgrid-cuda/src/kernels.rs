//! CUDA C source for the supported kernels.
//!
//! Both kernels are grid-stride loops over one chunk `[offset, offset + len)`
//! so any grid size covers the chunk. Products and sums use the `_rn`
//! intrinsics, which keeps NVCC from contracting them into FMAs and makes
//! results match the host reference exactly.

/// Kernel entry point for `y = a * x + y`.
pub const AXPY_ENTRY: &str = "streamgrid_axpy";

/// Kernel entry point for the diagonal-format product.
pub const DIA_MATVEC_ENTRY: &str = "streamgrid_dia_matvec";

/// Source compiled with NVRTC when the device is opened.
pub const KERNEL_SOURCE: &str = r#"
extern "C" __global__ void streamgrid_axpy(
    const double* __restrict__ scalars,
    const double* __restrict__ x,
    double* __restrict__ y,
    unsigned long long offset,
    unsigned long long len)
{
    extern __shared__ double smem[];
    double* sy = smem;
    double* sx = smem + blockDim.x;
    const double a = scalars[0];

    for (unsigned long long i = (unsigned long long)blockIdx.x * blockDim.x + threadIdx.x;
         i < len;
         i += (unsigned long long)gridDim.x * blockDim.x) {
        unsigned long long idx = offset + i;
        sy[threadIdx.x] = y[idx];
        sx[threadIdx.x] = x[idx];
        sy[threadIdx.x] = __dadd_rn(__dmul_rn(a, sx[threadIdx.x]), sy[threadIdx.x]);
        y[idx] = sy[threadIdx.x];
    }
}

extern "C" __global__ void streamgrid_dia_matvec(
    const double* __restrict__ offsets,
    const double* __restrict__ values,
    const double* __restrict__ x,
    double* __restrict__ y,
    unsigned long long offset,
    unsigned long long len,
    unsigned long long n,
    unsigned int num_diagonals,
    unsigned int unroll)
{
    const unsigned int step = unroll == 0 ? 1 : unroll;

    for (unsigned long long i = (unsigned long long)blockIdx.x * blockDim.x + threadIdx.x;
         i < len;
         i += (unsigned long long)gridDim.x * blockDim.x) {
        const long long row = (long long)(offset + i);
        double acc = 0.0;
        for (unsigned int k = 0; k < num_diagonals; k += step) {
            const unsigned int end = min(k + step, num_diagonals);
            for (unsigned int j = k; j < end; ++j) {
                const long long col = row + (long long)offsets[j];
                if (col >= 0 && col < (long long)n) {
                    const double a = values[(unsigned long long)j * n + row];
                    acc = __dadd_rn(acc, __dmul_rn(a, x[col]));
                }
            }
        }
        y[row] = __dadd_rn(y[row], acc);
    }
}
"#;
