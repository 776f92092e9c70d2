/// Matmul and elementwise kernels with runtime CPU dispatch.
///
/// The kernel path is detected once at engine init and threaded through
/// every call as a tagged value; there is no per-call feature probing and
/// no runtime polymorphism. Every path must pass the same numerical
/// tolerance, so the choice is observable only in performance.
pub mod dense;
pub mod fused;
pub mod ops;

#[cfg(target_arch = "x86_64")]
pub(crate) mod avx2;

use crate::error::NoctuaResult;
use crate::tensor::quantized::QuantizedTensor;
use rayon::prelude::*;

/// Kernel implementation selected at engine init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelPath {
    /// AVX2 + FMA intrinsics (x86-64).
    Avx2Fma,
    /// Portable 8-lane vector abstraction the compiler autovectorizes.
    Portable,
    /// Plain scalar loops; the reference for the other two.
    Scalar,
}

impl KernelPath {
    /// Pick the widest path the running CPU supports.
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            if std::arch::is_x86_feature_detected!("avx2")
                && std::arch::is_x86_feature_detected!("fma")
            {
                return KernelPath::Avx2Fma;
            }
        }
        KernelPath::Portable
    }

    pub fn name(self) -> &'static str {
        match self {
            KernelPath::Avx2Fma => "avx2+fma",
            KernelPath::Portable => "portable",
            KernelPath::Scalar => "scalar",
        }
    }
}

/// Minimum rows before the parallel wrapper splits work across threads.
const PAR_MIN_ROWS: usize = 8;

/// Fused matmul with row-panel parallelism layered above the
/// single-threaded kernel. Each thread works on a disjoint horizontal
/// stripe of A and C; B is shared read-only.
pub fn matmul_fused_parallel(
    path: KernelPath,
    a: &[f32],
    m: usize,
    k: usize,
    b: &QuantizedTensor,
    c: &mut [f32],
) -> NoctuaResult<()> {
    if m <= PAR_MIN_ROWS {
        return fused::matmul_fused(path, a, m, k, b, c);
    }
    let n = b.cols();
    let stripes = rayon::current_num_threads().max(1);
    let rows_per = m.div_ceil(stripes).max(PAR_MIN_ROWS);

    c.par_chunks_mut(rows_per * n)
        .zip(a.par_chunks(rows_per * k))
        .try_for_each(|(c_stripe, a_stripe)| {
            let rows = a_stripe.len() / k;
            fused::matmul_fused(path, a_stripe, rows, k, b, c_stripe)
        })
}

/// Portable 8-lane f32 vector. Written so LLVM lowers the lane loops to
/// whatever SIMD the target has; this is the middle rung of the dispatch
/// ladder.
#[derive(Debug, Clone, Copy)]
pub(crate) struct F32x8(pub [f32; 8]);

impl F32x8 {
    #[inline(always)]
    pub fn zero() -> Self {
        F32x8([0.0; 8])
    }

    #[inline(always)]
    pub fn load(src: &[f32]) -> Self {
        let mut lanes = [0.0; 8];
        lanes.copy_from_slice(&src[..8]);
        F32x8(lanes)
    }

    #[inline(always)]
    pub fn splat(v: f32) -> Self {
        F32x8([v; 8])
    }

    /// `self + a * b` per lane.
    #[inline(always)]
    pub fn mul_add(self, a: F32x8, b: F32x8) -> Self {
        let mut out = self.0;
        for i in 0..8 {
            out[i] += a.0[i] * b.0[i];
        }
        F32x8(out)
    }

    #[inline(always)]
    pub fn add(self, other: F32x8) -> Self {
        let mut out = self.0;
        for i in 0..8 {
            out[i] += other.0[i];
        }
        F32x8(out)
    }

    #[inline(always)]
    pub fn store(self, dst: &mut [f32]) {
        dst[..8].copy_from_slice(&self.0);
    }
}
