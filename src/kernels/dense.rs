/// Baseline dense fp32 matmul.
///
/// `C[M,N] = A[M,K] · B[K,N]`, all row-major, output overwritten. This is
/// the reference the fused quantized kernels are tested against, and the
/// path dense (unquantized) weights take at inference time. Single-threaded
/// by contract; parallelism is layered above.
use super::{F32x8, KernelPath};
use crate::error::{NoctuaError, NoctuaResult};

pub fn matmul_f32(
    path: KernelPath,
    a: &[f32],
    m: usize,
    k: usize,
    b: &[f32],
    n: usize,
    c: &mut [f32],
) -> NoctuaResult<()> {
    if a.len() != m * k || b.len() != k * n || c.len() != m * n {
        return Err(NoctuaError::ShapeMismatch {
            op: "matmul_f32",
            expected: format!("A={}x{} B={}x{} C={}x{}", m, k, k, n, m, n),
            actual: format!("A.len={} B.len={} C.len={}", a.len(), b.len(), c.len()),
        });
    }
    c.fill(0.0);

    match path {
        #[cfg(target_arch = "x86_64")]
        KernelPath::Avx2Fma => unsafe { super::avx2::matmul_f32_avx2(a, m, k, b, n, c) },
        #[cfg(not(target_arch = "x86_64"))]
        KernelPath::Avx2Fma => matmul_f32_portable(a, m, k, b, n, c),
        KernelPath::Portable => matmul_f32_portable(a, m, k, b, n, c),
        KernelPath::Scalar => matmul_f32_scalar(a, m, k, b, n, c),
    }
    Ok(())
}

/// Scalar reference: row-major axpy order so B streams once per A row.
fn matmul_f32_scalar(a: &[f32], m: usize, k: usize, b: &[f32], n: usize, c: &mut [f32]) {
    for i in 0..m {
        let c_row = &mut c[i * n..(i + 1) * n];
        for kk in 0..k {
            let aik = a[i * k + kk];
            if aik == 0.0 {
                continue;
            }
            let b_row = &b[kk * n..(kk + 1) * n];
            for (cv, &bv) in c_row.iter_mut().zip(b_row) {
                *cv += aik * bv;
            }
        }
    }
}

/// Portable path: the same axpy order over 8-lane chunks.
fn matmul_f32_portable(a: &[f32], m: usize, k: usize, b: &[f32], n: usize, c: &mut [f32]) {
    let n8 = n - n % 8;
    for i in 0..m {
        let c_row = &mut c[i * n..(i + 1) * n];
        for kk in 0..k {
            let aik = a[i * k + kk];
            if aik == 0.0 {
                continue;
            }
            let b_row = &b[kk * n..(kk + 1) * n];
            let va = F32x8::splat(aik);
            let mut j = 0;
            while j < n8 {
                let acc = F32x8::load(&c_row[j..]);
                acc.mul_add(va, F32x8::load(&b_row[j..]))
                    .store(&mut c_row[j..]);
                j += 8;
            }
            for j in n8..n {
                c_row[j] += aik * b_row[j];
            }
        }
    }
}
