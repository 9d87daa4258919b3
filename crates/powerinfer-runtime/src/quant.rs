//! Quantized block formats and dot-product kernels
//!
//! Weight rows are stored as runs of fixed-size blocks. Q4_0 and Q8_0 rows
//! are multiplied against activations packed as Q8_0; F32 and F16 rows
//! against activations kept in f32. Q6_K is recognised for sizing only.

use std::fmt;

use half::f16;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

#[cfg(target_arch = "aarch64")]
use std::arch::aarch64::*;

/// Elements per Q4_0 / Q8_0 block
pub const QK: usize = 32;

/// Bytes per Q4_0 block: f16 scale + 16 bytes of nibbles
pub const Q4_0_BLOCK_BYTES: usize = 2 + QK / 2;

/// Bytes per Q8_0 block: f16 scale + 32 signed bytes
pub const Q8_0_BLOCK_BYTES: usize = 2 + QK;

/// Elements per Q6_K super-block
pub const QK_K: usize = 256;

/// Weight element encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum QuantType {
    /// 4-bit, 32-element blocks with an f16 scale
    Q4_0 = 0,
    /// 8-bit, 32-element blocks with an f16 scale
    Q8_0 = 1,
    /// IEEE half precision
    F16 = 2,
    /// IEEE single precision
    F32 = 3,
    /// 6-bit k-quant, 256-element super-blocks
    Q6K = 4,
}

impl QuantType {
    /// Elements per block
    pub const fn block_size(self) -> usize {
        match self {
            QuantType::Q4_0 | QuantType::Q8_0 => QK,
            QuantType::F16 | QuantType::F32 => 1,
            QuantType::Q6K => QK_K,
        }
    }

    /// Bytes per block
    pub const fn type_size(self) -> usize {
        match self {
            QuantType::Q4_0 => Q4_0_BLOCK_BYTES,
            QuantType::Q8_0 => Q8_0_BLOCK_BYTES,
            QuantType::F16 => 2,
            QuantType::F32 => 4,
            QuantType::Q6K => 210,
        }
    }

    /// Short name, as used in error messages
    pub const fn name(self) -> &'static str {
        match self {
            QuantType::Q4_0 => "q4_0",
            QuantType::Q8_0 => "q8_0",
            QuantType::F16 => "f16",
            QuantType::F32 => "f32",
            QuantType::Q6K => "q6_k",
        }
    }

    /// Bytes in a row of `n` elements
    pub fn row_size(self, n: usize) -> Result<usize> {
        if n % self.block_size() != 0 {
            return Err(RuntimeError::Precondition(format!(
                "row of {} elements is not a whole number of {} blocks",
                n,
                self.name()
            )));
        }
        Ok(n / self.block_size() * self.type_size())
    }

    /// Encoding the activation must be packed in to be dotted with rows of this type
    pub fn vec_dot_type(self) -> Result<QuantType> {
        match self {
            QuantType::Q4_0 | QuantType::Q8_0 => Ok(QuantType::Q8_0),
            QuantType::F16 | QuantType::F32 => Ok(QuantType::F32),
            QuantType::Q6K => Err(self.unsupported("vec_dot")),
        }
    }

    pub(crate) fn unsupported(self, operation: &'static str) -> RuntimeError {
        RuntimeError::UnsupportedType {
            qtype: self.name(),
            operation,
        }
    }
}

impl TryFrom<i32> for QuantType {
    type Error = RuntimeError;

    fn try_from(tag: i32) -> Result<Self> {
        match tag {
            0 => Ok(QuantType::Q4_0),
            1 => Ok(QuantType::Q8_0),
            2 => Ok(QuantType::F16),
            3 => Ok(QuantType::F32),
            4 => Ok(QuantType::Q6K),
            other => Err(RuntimeError::Precondition(format!(
                "unknown quantization type tag {}",
                other
            ))),
        }
    }
}

impl fmt::Display for QuantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Row-by-activation dot product over raw encoded bytes: `(n, row, packed)`
pub type DotFn = fn(usize, &[u8], &[u8]) -> f32;

/// Kernel multiplying rows of `qtype` by an activation packed as `qtype.vec_dot_type()`
pub fn dot_kernel(qtype: QuantType) -> Result<DotFn> {
    match qtype {
        QuantType::Q4_0 => Ok(vec_dot_q4_0_q8_0),
        QuantType::Q8_0 => Ok(vec_dot_q8_0_q8_0),
        QuantType::F32 => Ok(vec_dot_f32_bytes),
        QuantType::F16 => Ok(vec_dot_f16_f32),
        QuantType::Q6K => Err(qtype.unsupported("vec_dot")),
    }
}

/// Encode `src` as `qtype` into `dst`
pub fn quantize_row(qtype: QuantType, src: &[f32], dst: &mut [u8]) -> Result<()> {
    let needed = qtype.row_size(src.len())?;
    if dst.len() < needed {
        return Err(RuntimeError::dims("quantized row", needed, dst.len()));
    }
    match qtype {
        QuantType::Q4_0 => quantize_row_q4_0(src, dst),
        QuantType::Q8_0 => quantize_row_q8_0(src, dst),
        QuantType::F32 => {
            for (out, v) in dst.chunks_exact_mut(4).zip(src) {
                out.copy_from_slice(&v.to_le_bytes());
            }
        }
        QuantType::F16 => {
            for (out, v) in dst.chunks_exact_mut(2).zip(src) {
                out.copy_from_slice(&f16::from_f32(*v).to_le_bytes());
            }
        }
        QuantType::Q6K => return Err(qtype.unsupported("quantize")),
    }
    Ok(())
}

/// Decode a row of `qtype` into `dst`
pub fn dequantize_row(qtype: QuantType, src: &[u8], dst: &mut [f32]) -> Result<()> {
    let needed = qtype.row_size(dst.len())?;
    if src.len() < needed {
        return Err(RuntimeError::dims("quantized row", needed, src.len()));
    }
    match qtype {
        QuantType::Q4_0 => dequantize_row_q4_0(src, dst),
        QuantType::Q8_0 => dequantize_row_q8_0(src, dst),
        QuantType::F32 => {
            for (out, b) in dst.iter_mut().zip(src.chunks_exact(4)) {
                *out = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            }
        }
        QuantType::F16 => {
            for (out, b) in dst.iter_mut().zip(src.chunks_exact(2)) {
                *out = f16::from_le_bytes([b[0], b[1]]).to_f32();
            }
        }
        QuantType::Q6K => return Err(qtype.unsupported("dequantize")),
    }
    Ok(())
}

/// Quantize a whole row-major matrix of `cols`-wide rows
pub fn quantize_matrix(qtype: QuantType, values: &[f32], cols: usize) -> Result<Vec<u8>> {
    if cols == 0 || values.len() % cols != 0 {
        return Err(RuntimeError::dims("matrix columns", cols, values.len()));
    }
    let row_bytes = qtype.row_size(cols)?;
    let mut out = vec![0u8; values.len() / cols * row_bytes];
    for (src, dst) in values.chunks_exact(cols).zip(out.chunks_exact_mut(row_bytes)) {
        quantize_row(qtype, src, dst)?;
    }
    Ok(out)
}

#[inline]
fn block_scale(block: &[u8]) -> f32 {
    f16::from_le_bytes([block[0], block[1]]).to_f32()
}

/// Q4_0: signed scale from the largest-magnitude element, nibbles offset by 8
pub fn quantize_row_q4_0(src: &[f32], dst: &mut [u8]) {
    debug_assert_eq!(src.len() % QK, 0);

    for (x, block) in src.chunks_exact(QK).zip(dst.chunks_exact_mut(Q4_0_BLOCK_BYTES)) {
        let mut amax = 0.0f32;
        let mut max = 0.0f32;
        for &v in x {
            if amax < v.abs() {
                amax = v.abs();
                max = v;
            }
        }

        let d = max / -8.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        block[..2].copy_from_slice(&f16::from_f32(d).to_le_bytes());

        for j in 0..QK / 2 {
            let x0 = ((x[j] * id + 8.5) as i8).min(15) as u8;
            let x1 = ((x[j + QK / 2] * id + 8.5) as i8).min(15) as u8;
            block[2 + j] = x0 | (x1 << 4);
        }
    }
}

/// Inverse of [`quantize_row_q4_0`]
pub fn dequantize_row_q4_0(src: &[u8], dst: &mut [f32]) {
    debug_assert_eq!(dst.len() % QK, 0);

    for (block, y) in src.chunks_exact(Q4_0_BLOCK_BYTES).zip(dst.chunks_exact_mut(QK)) {
        let d = block_scale(block);
        for j in 0..QK / 2 {
            let q = block[2 + j];
            y[j] = ((q & 0x0F) as i32 - 8) as f32 * d;
            y[j + QK / 2] = ((q >> 4) as i32 - 8) as f32 * d;
        }
    }
}

/// Q8_0: symmetric scale `amax / 127`, rounded signed bytes
pub fn quantize_row_q8_0(src: &[f32], dst: &mut [u8]) {
    debug_assert_eq!(src.len() % QK, 0);

    for (x, block) in src.chunks_exact(QK).zip(dst.chunks_exact_mut(Q8_0_BLOCK_BYTES)) {
        let amax = x.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let d = amax / 127.0;
        let id = if d != 0.0 { 1.0 / d } else { 0.0 };
        block[..2].copy_from_slice(&f16::from_f32(d).to_le_bytes());

        for (q, &v) in block[2..].iter_mut().zip(x) {
            *q = ((v * id).round() as i8) as u8;
        }
    }
}

/// Inverse of [`quantize_row_q8_0`]
pub fn dequantize_row_q8_0(src: &[u8], dst: &mut [f32]) {
    debug_assert_eq!(dst.len() % QK, 0);

    for (block, y) in src.chunks_exact(Q8_0_BLOCK_BYTES).zip(dst.chunks_exact_mut(QK)) {
        let d = block_scale(block);
        for (out, &q) in y.iter_mut().zip(&block[2..]) {
            *out = (q as i8) as f32 * d;
        }
    }
}

/// Dot product of a Q4_0 row with a Q8_0 activation
pub fn vec_dot_q4_0_q8_0(n: usize, x: &[u8], y: &[u8]) -> f32 {
    debug_assert_eq!(n % QK, 0);
    let nb = n / QK;

    let mut sumf = 0.0f32;
    for (bx, by) in x
        .chunks_exact(Q4_0_BLOCK_BYTES)
        .zip(y.chunks_exact(Q8_0_BLOCK_BYTES))
        .take(nb)
    {
        let mut sumi = 0i32;
        for j in 0..QK / 2 {
            let q = bx[2 + j];
            let v0 = (q & 0x0F) as i32 - 8;
            let v1 = (q >> 4) as i32 - 8;
            sumi += v0 * (by[2 + j] as i8) as i32 + v1 * (by[2 + j + QK / 2] as i8) as i32;
        }
        sumf += sumi as f32 * block_scale(bx) * block_scale(by);
    }
    sumf
}

/// Dot product of a Q8_0 row with a Q8_0 activation
pub fn vec_dot_q8_0_q8_0(n: usize, x: &[u8], y: &[u8]) -> f32 {
    debug_assert_eq!(n % QK, 0);
    let nb = n / QK;

    let mut sumf = 0.0f32;
    for (bx, by) in x
        .chunks_exact(Q8_0_BLOCK_BYTES)
        .zip(y.chunks_exact(Q8_0_BLOCK_BYTES))
        .take(nb)
    {
        let sumi: i32 = bx[2..]
            .iter()
            .zip(&by[2..])
            .map(|(&a, &b)| (a as i8) as i32 * (b as i8) as i32)
            .sum();
        sumf += sumi as f32 * block_scale(bx) * block_scale(by);
    }
    sumf
}

/// Dot product of an F16 row with an f32 activation stored as bytes
pub fn vec_dot_f16_f32(n: usize, x: &[u8], y: &[u8]) -> f32 {
    let y = f32_view(&y[..n * 4]);
    x.chunks_exact(2)
        .zip(y.iter())
        .take(n)
        .map(|(b, &v)| f16::from_le_bytes([b[0], b[1]]).to_f32() * v)
        .sum()
}

/// Dot product of an F32 row with an f32 activation, both stored as bytes
pub fn vec_dot_f32_bytes(n: usize, x: &[u8], y: &[u8]) -> f32 {
    let x = f32_view(&x[..n * 4]);
    let y = f32_view(&y[..n * 4]);
    vec_dot_f32(&x, &y)
}

/// Reinterpret little-endian f32 bytes, copying only when misaligned
pub fn f32_view(bytes: &[u8]) -> std::borrow::Cow<'_, [f32]> {
    // every bit pattern is a valid f32
    let (head, body, tail) = unsafe { bytes.align_to::<f32>() };
    if head.is_empty() && tail.is_empty() && cfg!(target_endian = "little") {
        std::borrow::Cow::Borrowed(body)
    } else {
        std::borrow::Cow::Owned(
            bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
        )
    }
}

/// f32 dot product, vectorised where the CPU allows
pub fn vec_dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
        return unsafe { dot_product_avx2(a, b) };
    }

    #[cfg(target_arch = "aarch64")]
    {
        unsafe { dot_product_neon(a, b) }
    }

    #[cfg(not(target_arch = "aarch64"))]
    {
        dot_product_scalar(a, b)
    }
}

/// `a += b * scalar`
pub fn axpy(a: &mut [f32], b: &[f32], scalar: f32) {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
        return unsafe { axpy_avx2(a, b, scalar) };
    }

    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x += y * scalar;
    }
}

// ============ AVX2 Implementations ============

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn dot_product_avx2(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let chunks = n / 8;

    let mut sum = _mm256_setzero_ps();

    for i in 0..chunks {
        let va = _mm256_loadu_ps(a.as_ptr().add(i * 8));
        let vb = _mm256_loadu_ps(b.as_ptr().add(i * 8));
        sum = _mm256_fmadd_ps(va, vb, sum);
    }

    // Horizontal sum
    let sum128 = _mm_add_ps(_mm256_extractf128_ps(sum, 0), _mm256_extractf128_ps(sum, 1));
    let sum64 = _mm_add_ps(sum128, _mm_movehl_ps(sum128, sum128));
    let sum32 = _mm_add_ss(sum64, _mm_shuffle_ps(sum64, sum64, 1));
    let mut result = _mm_cvtss_f32(sum32);

    for i in (chunks * 8)..n {
        result += a[i] * b[i];
    }

    result
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn axpy_avx2(a: &mut [f32], b: &[f32], scalar: f32) {
    let vs = _mm256_set1_ps(scalar);
    let n = a.len().min(b.len());
    let chunks = n / 8;

    for i in 0..chunks {
        let pa = a.as_mut_ptr().add(i * 8);
        let pb = b.as_ptr().add(i * 8);
        let result = _mm256_fmadd_ps(_mm256_loadu_ps(pb), vs, _mm256_loadu_ps(pa));
        _mm256_storeu_ps(pa, result);
    }

    for i in (chunks * 8)..n {
        a[i] += b[i] * scalar;
    }
}

// ============ NEON Implementations (ARM) ============

#[cfg(target_arch = "aarch64")]
unsafe fn dot_product_neon(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len().min(b.len());
    let chunks = n / 4;

    let mut sum = vdupq_n_f32(0.0);

    for i in 0..chunks {
        let va = vld1q_f32(a.as_ptr().add(i * 4));
        let vb = vld1q_f32(b.as_ptr().add(i * 4));
        sum = vfmaq_f32(sum, va, vb);
    }

    let mut result = vaddvq_f32(sum);

    for i in (chunks * 4)..n {
        result += a[i] * b[i];
    }

    result
}

// ============ Scalar Fallbacks ============

#[cfg(not(target_arch = "aarch64"))]
fn dot_product_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}
