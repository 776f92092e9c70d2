/// Fused dequantize-and-multiply matmul.
///
/// `C[M,N] = A[M,K] · B_q[K,N]` where B is block-quantized. The wall-clock
/// bound here is memory bandwidth, so B is never expanded to f32 in memory:
/// each 16-wide span of a block is dequantized into a stack buffer (SIMD
/// registers on the AVX2 path) and consumed by the FMA loop immediately.
///
/// Blocking is three-level: K tiles of 512, N tiles of 128 (256 for the
/// 256-element super-block formats, whose B bytes are smaller per value),
/// and M tiles of 32, with an MR=6 by NR=16 register microkernel inside.
/// Partial panels fall back to the same loops with a narrower MR; column
/// tails cannot occur because row lengths are block-aligned.
///
/// The kernels are single-threaded; `matmul_fused_parallel` layers rayon
/// row-stripes above them. All paths reconstruct B values through the same
/// span primitives as the reference `dequantize`, so they agree with the
/// dequantize-then-matmul reference to well within the contract tolerance.
use super::{F32x8, KernelPath};
use crate::error::{NoctuaError, NoctuaResult};
use crate::tensor::quantized::{QK_SUPER, QuantizedTensor, SPAN};

const MR: usize = 6;
const M_TILE: usize = 32;
const K_TILE: usize = 512;

fn n_tile(b: &QuantizedTensor) -> usize {
    if b.format().block_size() == QK_SUPER {
        256
    } else {
        128
    }
}

pub fn matmul_fused(
    path: KernelPath,
    a: &[f32],
    m: usize,
    k: usize,
    b: &QuantizedTensor,
    c: &mut [f32],
) -> NoctuaResult<()> {
    let n = b.cols();
    if b.rows() != k || a.len() != m * k || c.len() != m * n {
        return Err(NoctuaError::ShapeMismatch {
            op: "matmul_fused",
            expected: format!("A={}x{} B={}x{} C={}x{}", m, k, k, n, m, n),
            actual: format!(
                "A.len={} B={}x{} C.len={}",
                a.len(),
                b.rows(),
                b.cols(),
                c.len()
            ),
        });
    }

    c.fill(0.0);
    if m == 1 {
        gemv_fused(path, a, b, c);
        return Ok(());
    }

    let nt = n_tile(b);
    let mut k0 = 0;
    while k0 < k {
        let k1 = (k0 + K_TILE).min(k);
        let mut n0 = 0;
        while n0 < n {
            let n1 = (n0 + nt).min(n);
            let mut m0 = 0;
            while m0 < m {
                let m1 = (m0 + M_TILE).min(m);
                let mut p0 = m0;
                while p0 < m1 {
                    let mr = (m1 - p0).min(MR);
                    match path {
                        #[cfg(target_arch = "x86_64")]
                        KernelPath::Avx2Fma => unsafe {
                            super::avx2::fused_panel_avx2(a, k, p0, mr, b, k0, k1, n0, n1, c, n)
                        },
                        #[cfg(not(target_arch = "x86_64"))]
                        KernelPath::Avx2Fma => {
                            fused_panel_portable(a, k, p0, mr, b, k0, k1, n0, n1, c, n)
                        }
                        KernelPath::Portable => {
                            fused_panel_portable(a, k, p0, mr, b, k0, k1, n0, n1, c, n)
                        }
                        KernelPath::Scalar => {
                            fused_panel_scalar(a, k, p0, mr, b, k0, k1, n0, n1, c, n)
                        }
                    }
                    p0 += mr;
                }
                m0 = m1;
            }
            n0 = n1;
        }
        k0 = k1;
    }
    Ok(())
}

/// Scalar microkernel: MR×16 accumulator array, one A broadcast per row,
/// one dequantized span of B per K iteration.
#[allow(clippy::too_many_arguments)]
fn fused_panel_scalar(
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
        let mut acc = [[0.0f32; SPAN]; MR];
        for kk in k0..k1 {
            let row = b.row_bytes(kk);
            let bi = ns / bs;
            let si = (ns % bs) / SPAN;
            fmt.dequant_span(&row[bi * bpb..(bi + 1) * bpb], si, &mut span_buf);
            for (r, acc_row) in acc.iter_mut().enumerate().take(mr) {
                let aik = a[(p0 + r) * lda + kk];
                if aik == 0.0 {
                    continue;
                }
                for (slot, &bv) in acc_row.iter_mut().zip(&span_buf) {
                    *slot += aik * bv;
                }
            }
        }
        for (r, acc_row) in acc.iter().enumerate().take(mr) {
            let dst = &mut c[(p0 + r) * ldc + ns..(p0 + r) * ldc + ns + SPAN];
            for (cv, &av) in dst.iter_mut().zip(acc_row) {
                *cv += av;
            }
        }
        ns += SPAN;
    }
}

/// Portable microkernel: identical structure over two 8-lane vectors.
#[allow(clippy::too_many_arguments)]
fn fused_panel_portable(
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
        let mut acc = [[F32x8::zero(); 2]; MR];
        for kk in k0..k1 {
            let row = b.row_bytes(kk);
            let bi = ns / bs;
            let si = (ns % bs) / SPAN;
            fmt.dequant_span(&row[bi * bpb..(bi + 1) * bpb], si, &mut span_buf);
            let b0 = F32x8::load(&span_buf[..8]);
            let b1 = F32x8::load(&span_buf[8..]);
            for (r, acc_row) in acc.iter_mut().enumerate().take(mr) {
                let aik = a[(p0 + r) * lda + kk];
                if aik == 0.0 {
                    continue;
                }
                let va = F32x8::splat(aik);
                acc_row[0] = acc_row[0].mul_add(va, b0);
                acc_row[1] = acc_row[1].mul_add(va, b1);
            }
        }
        for (r, acc_row) in acc.iter().enumerate().take(mr) {
            let base = (p0 + r) * ldc + ns;
            let lo = F32x8::load(&c[base..base + 8]).add(acc_row[0]);
            lo.store(&mut c[base..base + 8]);
            let hi = F32x8::load(&c[base + 8..base + 16]).add(acc_row[1]);
            hi.store(&mut c[base + 8..base + 16]);
        }
        ns += SPAN;
    }
}

/// M=1 vector-matrix product, used on every decode step. Outer loop over K
/// broadcasts `a[k]` and scatter-accumulates across C, so B streams through
/// memory exactly once per call. A values that are exactly zero skip their
/// contribution entirely.
fn gemv_fused(path: KernelPath, a: &[f32], b: &QuantizedTensor, c: &mut [f32]) {
    match path {
        #[cfg(target_arch = "x86_64")]
        KernelPath::Avx2Fma => unsafe { super::avx2::gemv_fused_avx2(a, b, c) },
        #[cfg(not(target_arch = "x86_64"))]
        KernelPath::Avx2Fma => gemv_fused_portable(a, b, c),
        KernelPath::Portable => gemv_fused_portable(a, b, c),
        KernelPath::Scalar => gemv_fused_scalar(a, b, c),
    }
}

fn gemv_fused_scalar(a: &[f32], b: &QuantizedTensor, c: &mut [f32]) {
    let fmt = b.format();
    let bs = fmt.block_size();
    let bpb = fmt.bytes_per_block();
    let spans = bs / SPAN;
    let mut buf = [0.0f32; SPAN];

    for (kk, &ak) in a.iter().enumerate() {
        if ak == 0.0 {
            continue;
        }
        let row = b.row_bytes(kk);
        for (bi, block) in row.chunks_exact(bpb).enumerate() {
            for si in 0..spans {
                fmt.dequant_span(block, si, &mut buf);
                let base = bi * bs + si * SPAN;
                for (cv, &bv) in c[base..base + SPAN].iter_mut().zip(&buf) {
                    *cv += ak * bv;
                }
            }
        }
    }
}

fn gemv_fused_portable(a: &[f32], b: &QuantizedTensor, c: &mut [f32]) {
    let fmt = b.format();
    let bs = fmt.block_size();
    let bpb = fmt.bytes_per_block();
    let spans = bs / SPAN;
    let mut buf = [0.0f32; SPAN];

    for (kk, &ak) in a.iter().enumerate() {
        if ak == 0.0 {
            continue;
        }
        let va = F32x8::splat(ak);
        let row = b.row_bytes(kk);
        for (bi, block) in row.chunks_exact(bpb).enumerate() {
            for si in 0..spans {
                fmt.dequant_span(block, si, &mut buf);
                let base = bi * bs + si * SPAN;
                let lo = F32x8::load(&c[base..base + 8]).mul_add(va, F32x8::load(&buf[..8]));
                lo.store(&mut c[base..base + 8]);
                let hi =
                    F32x8::load(&c[base + 8..base + 16]).mul_add(va, F32x8::load(&buf[8..]));
                hi.store(&mut c[base + 8..base + 16]);
            }
        }
    }
}
