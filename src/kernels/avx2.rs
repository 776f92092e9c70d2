/// AVX2 + FMA microkernels.
///
/// Callers must have verified CPU support via `KernelPath::detect`; every
/// function here is `unsafe` for that reason. The microkernel shape is
/// MR=6 rows by NR=16 columns: 12 ymm accumulators stay register-resident
/// across the K loop, one A value is broadcast per row, and one 16-wide
/// strip of B is loaded (dense) or dequantized (fused) per K iteration.
use crate::tensor::quantized::{QuantizedTensor, SPAN};
use std::arch::x86_64::*;

const MR: usize = 6;
const NR: usize = 16;

#[target_feature(enable = "avx2", enable = "fma")]
pub(crate) unsafe fn matmul_f32_avx2(
    a: &[f32],
    m: usize,
    k: usize,
    b: &[f32],
    n: usize,
    c: &mut [f32],
) {
    let n16 = n - n % NR;
    let mut p0 = 0;
    while p0 < m {
        let mr = (m - p0).min(MR);
        let mut j = 0;
        while j < n16 {
            unsafe { dense_microkernel(a, k, p0, mr, b, n, j, c) };
            j += NR;
        }
        // column tail: identical semantics, scalar
        for r in p0..p0 + mr {
            for jj in n16..n {
                let mut sum = 0.0f32;
                for kk in 0..k {
                    sum += a[r * k + kk] * b[kk * n + jj];
                }
                c[r * n + jj] = sum;
            }
        }
        p0 += mr;
    }
}

#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn dense_microkernel(
    a: &[f32],
    k: usize,
    p0: usize,
    mr: usize,
    b: &[f32],
    n: usize,
    j: usize,
    c: &mut [f32],
) {
    unsafe {
        let mut acc = [[_mm256_setzero_ps(); 2]; MR];
        for kk in 0..k {
            let b0 = _mm256_loadu_ps(b.as_ptr().add(kk * n + j));
            let b1 = _mm256_loadu_ps(b.as_ptr().add(kk * n + j + 8));
            for r in 0..mr {
                let va = _mm256_set1_ps(*a.get_unchecked((p0 + r) * k + kk));
                acc[r][0] = _mm256_fmadd_ps(va, b0, acc[r][0]);
                acc[r][1] = _mm256_fmadd_ps(va, b1, acc[r][1]);
            }
        }
        for r in 0..mr {
            let dst = c.as_mut_ptr().add((p0 + r) * n + j);
            _mm256_storeu_ps(dst, acc[r][0]);
            _mm256_storeu_ps(dst.add(8), acc[r][1]);
        }
    }
}

/// Fused panel: MR rows of A against one K-tile and N-tile of quantized B,
/// accumulated into C. Each K step dequantizes one 16-wide span of B into a
/// stack buffer that the FMA loop consumes immediately; B is never expanded
/// to f32 in memory.
#[target_feature(enable = "avx2", enable = "fma")]
#[allow(clippy::too_many_arguments)]
pub(crate) unsafe fn fused_panel_avx2(
    a: &[f32],
    lda: usize,
    p0: usize,
    mr: usize,
    b: &QuantizedTensor,
    k0: usize,
    k1: usize,
    n0: usize,
    n1: usize,
    c: &mut [f32],
    ldc: usize,
) {
    let fmt = b.format();
    let bs = fmt.block_size();
    let bpb = fmt.bytes_per_block();
    let mut span_buf = [0.0f32; SPAN];

    let mut ns = n0;
    while ns < n1 {
        unsafe {
            let mut acc = [[_mm256_setzero_ps(); 2]; MR];
            for kk in k0..k1 {
                let row = b.row_bytes(kk);
                let bi = ns / bs;
                let si = (ns % bs) / SPAN;
                fmt.dequant_span(&row[bi * bpb..(bi + 1) * bpb], si, &mut span_buf);
                let b0 = _mm256_loadu_ps(span_buf.as_ptr());
                let b1 = _mm256_loadu_ps(span_buf.as_ptr().add(8));
                for r in 0..mr {
                    let va = _mm256_set1_ps(*a.get_unchecked((p0 + r) * lda + kk));
                    acc[r][0] = _mm256_fmadd_ps(va, b0, acc[r][0]);
                    acc[r][1] = _mm256_fmadd_ps(va, b1, acc[r][1]);
                }
            }
            for r in 0..mr {
                let dst = c.as_mut_ptr().add((p0 + r) * ldc + ns);
                _mm256_storeu_ps(dst, _mm256_add_ps(_mm256_loadu_ps(dst), acc[r][0]));
                _mm256_storeu_ps(dst.add(8), _mm256_add_ps(_mm256_loadu_ps(dst.add(8)), acc[r][1]));
            }
        }
        ns += SPAN;
    }
}

/// M=1 decode path: outer loop over K, broadcast `a[k]`, scatter-accumulate
/// across C. B streams in storage order, one pass per call.
#[target_feature(enable = "avx2", enable = "fma")]
pub(crate) unsafe fn gemv_fused_avx2(a: &[f32], b: &QuantizedTensor, c: &mut [f32]) {
    let fmt = b.format();
    let bs = fmt.block_size();
    let bpb = fmt.bytes_per_block();
    let spans = bs / SPAN;
    let mut buf = [0.0f32; SPAN];

    for (kk, &ak) in a.iter().enumerate() {
        if ak == 0.0 {
            continue;
        }
        unsafe {
            let va = _mm256_set1_ps(ak);
            let row = b.row_bytes(kk);
            for (bi, block) in row.chunks_exact(bpb).enumerate() {
                for si in 0..spans {
                    fmt.dequant_span(block, si, &mut buf);
                    let dst = c.as_mut_ptr().add(bi * bs + si * SPAN);
                    let b0 = _mm256_loadu_ps(buf.as_ptr());
                    let b1 = _mm256_loadu_ps(buf.as_ptr().add(8));
                    _mm256_storeu_ps(dst, _mm256_fmadd_ps(va, b0, _mm256_loadu_ps(dst)));
                    _mm256_storeu_ps(
                        dst.add(8),
                        _mm256_fmadd_ps(va, b1, _mm256_loadu_ps(dst.add(8))),
                    );
                }
            }
        }
    }
}
