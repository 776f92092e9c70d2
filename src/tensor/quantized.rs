/// Block-structured quantized tensor formats.
///
/// A quantized tensor stores a 2-D weight matrix as a sequence of fixed-size
/// blocks. Each block carries one or more fp16 scales and packed integer
/// values; dequantizing one block produces exactly one block of f32 output.
///
/// # Wire layouts (all multibyte values little-endian)
///
/// | Format | Block | Bytes | Layout |
/// |--------|-------|-------|--------|
/// | Q4_0   | 32    | 18    | fp16 scale, 16 nibble bytes (even=low nibble) |
/// | Q5_0   | 32    | 22    | fp16 scale, 4-byte high-bit plane, 16 nibble bytes |
/// | Q8_0   | 32    | 34    | fp16 scale, 32 signed bytes |
/// | Q4_K   | 256   | 144   | fp16 d, fp16 dmin, 12 packed 6-bit sc/min, 128 nibble bytes |
/// | Q6_K   | 256   | 210   | 128 ql bytes, 64 qh bytes, 16 int8 scales, fp16 d |
///
/// Scalar dequantization here is the reference against which the fused
/// matmul kernels are tested. The fused kernels consume the same span-level
/// primitives, so both paths reconstruct bit-identical values. Malformed
/// scale bits that decode to NaN are propagated, never sanitized.
use crate::error::{NoctuaError, NoctuaResult};
use crate::tensor::checked_element_count;
use crate::tensor::fp16::f16_from_le_bytes;
use std::fmt;

/// Elements per block for the 32-wide formats.
pub const QK_BLOCK: usize = 32;
/// Elements per super-block for the K-quant formats.
pub const QK_SUPER: usize = 256;
/// Elements per dequantization span, the unit the fused kernels consume.
pub(crate) const SPAN: usize = 16;

/// Supported quantized block formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum QuantFormat {
    Q4_0,
    Q5_0,
    Q8_0,
    Q4_K,
    Q6_K,
}

impl QuantFormat {
    /// Elements covered by one block.
    pub fn block_size(self) -> usize {
        match self {
            QuantFormat::Q4_0 | QuantFormat::Q5_0 | QuantFormat::Q8_0 => QK_BLOCK,
            QuantFormat::Q4_K | QuantFormat::Q6_K => QK_SUPER,
        }
    }

    /// Stored bytes per block.
    pub fn bytes_per_block(self) -> usize {
        match self {
            QuantFormat::Q4_0 => 18,
            QuantFormat::Q5_0 => 22,
            QuantFormat::Q8_0 => 34,
            QuantFormat::Q4_K => 144,
            QuantFormat::Q6_K => 210,
        }
    }

    /// Stored bytes for `elements` values.
    pub fn storage_bytes(self, elements: usize) -> usize {
        elements / self.block_size() * self.bytes_per_block()
    }

    /// Dequantize `dst.len()` elements from `src`.
    ///
    /// `dst.len()` must be a whole number of blocks and `src` must hold
    /// exactly the matching byte count.
    pub fn dequantize(self, src: &[u8], dst: &mut [f32]) -> NoctuaResult<()> {
        let bs = self.block_size();
        if dst.len() % bs != 0 {
            return Err(NoctuaError::MalformedBlock(format!(
                "{} element count {} is not a multiple of the block size {}",
                self,
                dst.len(),
                bs
            )));
        }
        let blocks = dst.len() / bs;
        let expected = blocks * self.bytes_per_block();
        if src.len() != expected {
            return Err(NoctuaError::MalformedBlock(format!(
                "{} data is {} bytes, expected {} for {} blocks",
                self,
                src.len(),
                expected,
                blocks
            )));
        }

        let bpb = self.bytes_per_block();
        for (block, out) in src.chunks_exact(bpb).zip(dst.chunks_exact_mut(bs)) {
            self.dequantize_block(block, out);
        }
        Ok(())
    }

    /// Dequantize one whole block. `out.len()` must equal `block_size()`.
    #[inline]
    pub(crate) fn dequantize_block(self, block: &[u8], out: &mut [f32]) {
        debug_assert_eq!(out.len(), self.block_size());
        let mut span = [0.0f32; SPAN];
        for (s, chunk) in out.chunks_exact_mut(SPAN).enumerate() {
            self.dequant_span(block, s, &mut span);
            chunk.copy_from_slice(&span);
        }
    }

    /// Dequantize elements `span*16 .. span*16+16` of one block.
    ///
    /// This is the shared primitive: the reference `dequantize` and the
    /// fused matmul microkernels both reconstruct values through it, which
    /// pins their numerics to each other exactly.
    #[inline]
    pub(crate) fn dequant_span(self, block: &[u8], span: usize, out: &mut [f32; SPAN]) {
        match self {
            QuantFormat::Q4_0 => dequant_span_q4_0(block, span, out),
            QuantFormat::Q5_0 => dequant_span_q5_0(block, span, out),
            QuantFormat::Q8_0 => dequant_span_q8_0(block, span, out),
            QuantFormat::Q4_K => dequant_span_q4_k(block, span, out),
            QuantFormat::Q6_K => dequant_span_q6_k(block, span, out),
        }
    }
}

impl fmt::Display for QuantFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantFormat::Q4_0 => write!(f, "Q4_0"),
            QuantFormat::Q5_0 => write!(f, "Q5_0"),
            QuantFormat::Q8_0 => write!(f, "Q8_0"),
            QuantFormat::Q4_K => write!(f, "Q4_K"),
            QuantFormat::Q6_K => write!(f, "Q6_K"),
        }
    }
}

/// Extract nibble `i` from an interleaved nibble plane: even indices read
/// the low nibble, odd indices the high nibble.
#[inline(always)]
fn nibble(qs: &[u8], i: usize) -> u8 {
    let byte = qs[i / 2];
    if i % 2 == 0 { byte & 0x0F } else { byte >> 4 }
}

#[inline]
fn dequant_span_q4_0(block: &[u8], span: usize, out: &mut [f32; SPAN]) {
    let d = f16_from_le_bytes(block[0], block[1]);
    let qs = &block[2..18];
    let base = span * SPAN;
    for (j, slot) in out.iter_mut().enumerate() {
        let n = nibble(qs, base + j) as i32;
        *slot = (n - 8) as f32 * d;
    }
}

#[inline]
fn dequant_span_q5_0(block: &[u8], span: usize, out: &mut [f32; SPAN]) {
    let d = f16_from_le_bytes(block[0], block[1]);
    let plane = u32::from_le_bytes([block[2], block[3], block[4], block[5]]);
    let qs = &block[6..22];
    let base = span * SPAN;
    for (j, slot) in out.iter_mut().enumerate() {
        let i = base + j;
        let lo = nibble(qs, i);
        let hi = ((plane >> i) & 1) as u8;
        let q = ((hi << 4) | lo) as i32;
        *slot = (q - 16) as f32 * d;
    }
}

#[inline]
fn dequant_span_q8_0(block: &[u8], span: usize, out: &mut [f32; SPAN]) {
    let d = f16_from_le_bytes(block[0], block[1]);
    let qs = &block[2..34];
    let base = span * SPAN;
    for (j, slot) in out.iter_mut().enumerate() {
        *slot = qs[base + j] as i8 as f32 * d;
    }
}

/// Unpack the 6-bit scale and min for sub-block `j` from the 12-byte pack.
///
/// Sub-blocks 0-3 read the scale from the low 6 bits of bytes 0-3 and the
/// min from bytes 4-7. Sub-blocks 4-7 combine the nibbles of bytes 8-11
/// with the high 2 bits of bytes 0-7.
#[inline]
pub(crate) fn unpack_scale_min(j: usize, q: &[u8]) -> (u8, u8) {
    debug_assert!(j < 8 && q.len() >= 12);
    if j < 4 {
        (q[j] & 63, q[j + 4] & 63)
    } else {
        (
            (q[j + 4] & 0x0F) | ((q[j - 4] >> 6) << 4),
            (q[j + 4] >> 4) | ((q[j] >> 6) << 4),
        )
    }
}

#[inline]
fn dequant_span_q4_k(block: &[u8], span: usize, out: &mut [f32; SPAN]) {
    let d = f16_from_le_bytes(block[0], block[1]);
    let dmin = f16_from_le_bytes(block[2], block[3]);
    let scales = &block[4..16];
    let qs = &block[16..144];

    // 16-element span sits entirely inside one 32-element sub-block
    let sub = span / 2;
    let (sc, mn) = unpack_scale_min(sub, scales);
    let scale = d * sc as f32;
    let offset = dmin * mn as f32;

    let base = span * SPAN;
    for (j, slot) in out.iter_mut().enumerate() {
        let n = nibble(qs, base + j) as f32;
        *slot = scale * n - offset;
    }
}

#[inline]
fn dequant_span_q6_k(block: &[u8], span: usize, out: &mut [f32; SPAN]) {
    let ql = &block[0..128];
    let qh = &block[128..192];
    let scales = &block[192..208];
    let d = f16_from_le_bytes(block[208], block[209]);

    // spans and 16-element sub-blocks coincide for Q6_K
    let scale = d * scales[span] as i8 as f32;

    let base = span * SPAN;
    for (j, slot) in out.iter_mut().enumerate() {
        let i = base + j;
        let lo = nibble(ql, i);
        let hi = (qh[i / 4] >> ((i % 4) * 2)) & 3;
        let q = (lo | (hi << 4)) as i32;
        *slot = scale * (q - 32) as f32;
    }
}

/// A 2-D quantized weight matrix of shape (rows, cols), row-major, with
/// blocks running along each row.
///
/// `cols` must be block-aligned so no block straddles a row boundary; the
/// matmul kernels stream one row of blocks at a time.
#[derive(Clone)]
pub struct QuantizedTensor {
    format: QuantFormat,
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl QuantizedTensor {
    pub fn new(
        format: QuantFormat,
        rows: usize,
        cols: usize,
        data: Vec<u8>,
    ) -> NoctuaResult<Self> {
        checked_element_count(&[rows, cols])?;
        let bs = format.block_size();
        if cols == 0 || cols % bs != 0 {
            return Err(NoctuaError::MalformedBlock(format!(
                "{} row length {} is not a multiple of the block size {}",
                format, cols, bs
            )));
        }
        let expected = format.storage_bytes(rows * cols);
        if data.len() != expected {
            return Err(NoctuaError::MalformedBlock(format!(
                "{} tensor {}x{} holds {} bytes, expected {}",
                format,
                rows,
                cols,
                data.len(),
                expected
            )));
        }
        Ok(Self {
            format,
            rows,
            cols,
            data,
        })
    }

    pub fn format(&self) -> QuantFormat {
        self.format
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn blocks_per_row(&self) -> usize {
        self.cols / self.format.block_size()
    }

    /// Raw block bytes of row `r`.
    pub fn row_bytes(&self, r: usize) -> &[u8] {
        let row_stride = self.blocks_per_row() * self.format.bytes_per_block();
        &self.data[r * row_stride..(r + 1) * row_stride]
    }

    /// Expand the whole matrix to f32. Reference path for tests and for
    /// callers that need a dense copy; the matmul hot path never does this.
    pub fn dequantize(&self) -> NoctuaResult<Vec<f32>> {
        let mut out = vec![0.0f32; self.rows * self.cols];
        self.format.dequantize(&self.data, &mut out)?;
        Ok(out)
    }
}

impl fmt::Debug for QuantizedTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuantizedTensor")
            .field("format", &self.format)
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::fp16::f32_to_f16;

    fn scale_bytes(scale: f32) -> [u8; 2] {
        f32_to_f16(scale).to_le_bytes()
    }

    #[test]
    fn test_format_tables() {
        assert_eq!(QuantFormat::Q4_0.block_size(), 32);
        assert_eq!(QuantFormat::Q4_0.bytes_per_block(), 18);
        assert_eq!(QuantFormat::Q5_0.bytes_per_block(), 22);
        assert_eq!(QuantFormat::Q8_0.bytes_per_block(), 34);
        assert_eq!(QuantFormat::Q4_K.block_size(), 256);
        assert_eq!(QuantFormat::Q4_K.bytes_per_block(), 144);
        assert_eq!(QuantFormat::Q6_K.block_size(), 256);
        assert_eq!(QuantFormat::Q6_K.bytes_per_block(), 210);
    }

    #[test]
    fn test_q4_0_reconstruction() {
        // nibble pattern 0..15 twice, scale 2.0
        let mut block = Vec::new();
        block.extend_from_slice(&scale_bytes(2.0));
        for b in 0..16u8 {
            let even = (2 * b) % 16;
            let odd = (2 * b + 1) % 16;
            block.push((odd << 4) | even);
        }
        let mut out = vec![0.0; 32];
        QuantFormat::Q4_0.dequantize(&block, &mut out).unwrap();
        for (i, &v) in out.iter().enumerate() {
            let n = (i % 16) as i32;
            assert_eq!(v, (n - 8) as f32 * 2.0, "element {}", i);
        }
    }

    #[test]
    fn test_q4_0_nibble_order_low_first() {
        // byte 0 = 0x2A: element 0 reads the low nibble (10), element 1 the high (2)
        let mut block = vec![0u8; 18];
        block[..2].copy_from_slice(&scale_bytes(1.0));
        block[2] = 0x2A;
        let mut out = vec![0.0; 32];
        QuantFormat::Q4_0.dequantize(&block, &mut out).unwrap();
        assert_eq!(out[0], 2.0); // 10 - 8
        assert_eq!(out[1], -6.0); // 2 - 8
    }

    #[test]
    fn test_q4_0_quantized_zero_block() {
        // every nibble 8 with scale 1.0 decodes to exactly zero
        let mut block = vec![0x88u8; 18];
        block[..2].copy_from_slice(&scale_bytes(1.0));
        let mut out = vec![1.0; 32];
        QuantFormat::Q4_0.dequantize(&block, &mut out).unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_q5_0_high_bit_plane() {
        let mut block = vec![0u8; 22];
        block[..2].copy_from_slice(&scale_bytes(1.0));
        // high bit set for elements 0 and 17 only
        let plane: u32 = (1 << 0) | (1 << 17);
        block[2..6].copy_from_slice(&plane.to_le_bytes());
        // all nibbles zero
        let mut out = vec![0.0; 32];
        QuantFormat::Q5_0.dequantize(&block, &mut out).unwrap();
        for (i, &v) in out.iter().enumerate() {
            let expected = if i == 0 || i == 17 {
                (16 - 16) as f32 // high bit contributes +16 before the -16 zero point
            } else {
                (0 - 16) as f32
            };
            assert_eq!(v, expected, "element {}", i);
        }
    }

    #[test]
    fn test_q8_0_signed_bytes() {
        let mut block = Vec::new();
        block.extend_from_slice(&scale_bytes(0.5));
        for i in 0..32i8 {
            block.push((i - 16) as u8);
        }
        let mut out = vec![0.0; 32];
        QuantFormat::Q8_0.dequantize(&block, &mut out).unwrap();
        for (i, &v) in out.iter().enumerate() {
            assert_eq!(v, (i as i32 - 16) as f32 * 0.5);
        }
    }

    /// Pack 8 six-bit scales and mins into the 12-byte layout that
    /// `unpack_scale_min` reads back.
    fn pack_scales_mins(sc: &[u8; 8], mn: &[u8; 8]) -> [u8; 12] {
        let mut q = [0u8; 12];
        for j in 0..4 {
            q[j] = (sc[j] & 63) | ((sc[j + 4] >> 4) << 6);
            q[j + 4] = (mn[j] & 63) | ((mn[j + 4] >> 4) << 6);
            q[j + 8] = (sc[j + 4] & 0x0F) | ((mn[j + 4] & 0x0F) << 4);
        }
        q
    }

    #[test]
    fn test_q4_k_scale_min_bitslicing() {
        let sc = [1u8, 13, 25, 37, 49, 55, 60, 63];
        let mn = [2u8, 7, 19, 31, 42, 50, 58, 61];
        let packed = pack_scales_mins(&sc, &mn);
        for j in 0..8 {
            let (s, m) = unpack_scale_min(j, &packed);
            assert_eq!(s, sc[j], "scale for sub-block {}", j);
            assert_eq!(m, mn[j], "min for sub-block {}", j);
        }
    }

    #[test]
    fn test_q4_k_reconstruction() {
        let sc = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mn = [0u8, 1, 0, 1, 0, 1, 0, 1];
        let mut block = Vec::new();
        block.extend_from_slice(&scale_bytes(0.5)); // d
        block.extend_from_slice(&scale_bytes(0.25)); // dmin
        block.extend_from_slice(&pack_scales_mins(&sc, &mn));
        // nibbles: value 5 everywhere
        block.extend_from_slice(&[0x55u8; 128]);
        assert_eq!(block.len(), 144);

        let mut out = vec![0.0; 256];
        QuantFormat::Q4_K.dequantize(&block, &mut out).unwrap();
        for (i, &v) in out.iter().enumerate() {
            let sub = i / 32;
            let expected = 0.5 * sc[sub] as f32 * 5.0 - 0.25 * mn[sub] as f32;
            assert!((v - expected).abs() < 1e-6, "element {}: {} vs {}", i, v, expected);
        }
    }

    #[test]
    fn test_q6_k_reconstruction() {
        let mut block = vec![0u8; 210];
        // ql: nibble value 3 everywhere
        for b in &mut block[0..128] {
            *b = 0x33;
        }
        // qh: 2-bit value 1 for every element -> adds 16
        for b in &mut block[128..192] {
            *b = 0b01_01_01_01;
        }
        // per-sub scales: alternating 2 and -1
        for (s, b) in block[192..208].iter_mut().enumerate() {
            *b = if s % 2 == 0 { 2u8 } else { (-1i8) as u8 };
        }
        block[208..210].copy_from_slice(&scale_bytes(1.5));

        let mut out = vec![0.0; 256];
        QuantFormat::Q6_K.dequantize(&block, &mut out).unwrap();
        for (i, &v) in out.iter().enumerate() {
            let sub = i / 16;
            let sc = if sub % 2 == 0 { 2.0 } else { -1.0 };
            // q = 3 | (1 << 4) = 19, zero point 32
            let expected = 1.5 * sc * (19.0 - 32.0);
            assert!((v - expected).abs() < 1e-5, "element {}: {} vs {}", i, v, expected);
        }
    }

    #[test]
    fn test_nan_scale_propagates() {
        let mut block = vec![0u8; 18];
        // fp16 NaN: exponent all ones, non-zero mantissa
        block[..2].copy_from_slice(&0x7C01u16.to_le_bytes());
        block[2] = 0x01; // non-center nibble so the product is NaN, not 0*NaN
        let mut out = vec![0.0; 32];
        QuantFormat::Q4_0.dequantize(&block, &mut out).unwrap();
        assert!(out[0].is_nan());
    }

    #[test]
    fn test_dequantize_rejects_bad_lengths() {
        let block = vec![0u8; 18];
        let mut out = vec![0.0; 31]; // not a multiple of 32
        assert!(matches!(
            QuantFormat::Q4_0.dequantize(&block, &mut out),
            Err(NoctuaError::MalformedBlock(_))
        ));

        let short = vec![0u8; 17];
        let mut out = vec![0.0; 32];
        assert!(matches!(
            QuantFormat::Q4_0.dequantize(&short, &mut out),
            Err(NoctuaError::MalformedBlock(_))
        ));
    }

    #[test]
    fn test_quantized_tensor_validation() {
        let data = vec![0u8; QuantFormat::Q4_0.storage_bytes(64 * 32)];
        let t = QuantizedTensor::new(QuantFormat::Q4_0, 64, 32, data).unwrap();
        assert_eq!(t.blocks_per_row(), 1);
        assert_eq!(t.row_bytes(0).len(), 18);

        // cols not block-aligned
        let data = vec![0u8; 18];
        assert!(QuantizedTensor::new(QuantFormat::Q4_0, 2, 16, data).is_err());

        // byte count mismatch
        let data = vec![0u8; 17];
        assert!(QuantizedTensor::new(QuantFormat::Q4_0, 1, 32, data).is_err());
    }

    #[test]
    fn test_block_vs_span_agreement() {
        // dequantize_block must equal concatenated spans for every format
        let mut q6 = vec![0u8; 210];
        for (i, b) in q6.iter_mut().enumerate() {
            *b = (i * 7 + 3) as u8;
        }
        q6[208..210].copy_from_slice(&scale_bytes(0.75));

        let mut whole = vec![0.0; 256];
        QuantFormat::Q6_K.dequantize_block(&q6, &mut whole);

        let mut span = [0.0f32; SPAN];
        for s in 0..256 / SPAN {
            QuantFormat::Q6_K.dequant_span(&q6, s, &mut span);
            assert_eq!(&whole[s * SPAN..(s + 1) * SPAN], &span[..]);
        }
    }
}
