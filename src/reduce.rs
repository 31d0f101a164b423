//! Element-wise kernels over little-endian byte buffers.
//!
//! Bucket contents travel as raw bytes tagged with a [`DataType`]; these
//! helpers interpret them per element, so the reducer and the in-process
//! backend never need typed views of a buffer.

use crate::error::{GradSyncError, Result};
use crate::types::{DataType, ReduceOp};
use half::{bf16, f16};

/// Types that support the four reduction operations.
trait Reducible: Copy + 'static {
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;
    fn div(self, divisor: u32) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
                #[inline]
                fn div(self, divisor: u32) -> Self {
                    (self as i128 / divisor as i128) as $ty
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
                #[inline]
                fn div(self, divisor: u32) -> Self {
                    self / divisor as $ty
                }
            }
        )*
    };
    // Half types accumulate in f32 and round back once per element.
    (half: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    <$ty>::from_f32(f32::reduce(a.to_f32(), b.to_f32(), op))
                }
                #[inline]
                fn div(self, divisor: u32) -> Self {
                    <$ty>::from_f32(self.to_f32() / divisor as f32)
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);
impl_reducible!(half: f16, bf16);

/// Alignment-safe element access on byte slices.
trait LeBytes: Sized {
    const SIZE: usize;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_le_bytes {
    ($($ty:ty),*) => {
        $(
            impl LeBytes for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();
                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_le_bytes(raw)
                }
                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_le_bytes!(i8, i32, i64, u8, u32, u64, f32, f64, f16, bf16);

fn check_len(len: usize, dtype: DataType) -> Result<usize> {
    let size = dtype.size_in_bytes();
    if len % size != 0 {
        return Err(GradSyncError::BufferSizeMismatch {
            expected: len.next_multiple_of(size),
            actual: len,
        });
    }
    Ok(len / size)
}

/// `dst[i] = op(dst[i], src[i])` for every `dtype` element of the buffers.
pub fn reduce_slice(dst: &mut [u8], src: &[u8], dtype: DataType, op: ReduceOp) -> Result<()> {
    if dst.len() != src.len() {
        return Err(GradSyncError::BufferSizeMismatch {
            expected: dst.len(),
            actual: src.len(),
        });
    }
    let count = check_len(dst.len(), dtype)?;
    match dtype {
        DataType::F32 => reduce_typed::<f32>(dst, src, count, op),
        DataType::F64 => reduce_typed::<f64>(dst, src, count, op),
        DataType::F16 => reduce_typed::<f16>(dst, src, count, op),
        DataType::BF16 => reduce_typed::<bf16>(dst, src, count, op),
        DataType::I8 => reduce_typed::<i8>(dst, src, count, op),
        DataType::I32 => reduce_typed::<i32>(dst, src, count, op),
        DataType::I64 => reduce_typed::<i64>(dst, src, count, op),
        DataType::U8 => reduce_typed::<u8>(dst, src, count, op),
        DataType::U32 => reduce_typed::<u32>(dst, src, count, op),
        DataType::U64 => reduce_typed::<u64>(dst, src, count, op),
    }
    Ok(())
}

/// Divide every element in place; integer types truncate toward zero.
pub fn div_slice(buf: &mut [u8], dtype: DataType, divisor: u32) -> Result<()> {
    if divisor == 0 {
        return Err(GradSyncError::UnsupportedDType {
            dtype,
            op: "divide by zero",
        });
    }
    if divisor == 1 {
        return Ok(());
    }
    let count = check_len(buf.len(), dtype)?;
    match dtype {
        DataType::F32 => div_typed::<f32>(buf, count, divisor),
        DataType::F64 => div_typed::<f64>(buf, count, divisor),
        DataType::F16 => div_typed::<f16>(buf, count, divisor),
        DataType::BF16 => div_typed::<bf16>(buf, count, divisor),
        DataType::I8 => div_typed::<i8>(buf, count, divisor),
        DataType::I32 => div_typed::<i32>(buf, count, divisor),
        DataType::I64 => div_typed::<i64>(buf, count, divisor),
        DataType::U8 => div_typed::<u8>(buf, count, divisor),
        DataType::U32 => div_typed::<u32>(buf, count, divisor),
        DataType::U64 => div_typed::<u64>(buf, count, divisor),
    }
    Ok(())
}

fn reduce_typed<T: Reducible + LeBytes>(dst: &mut [u8], src: &[u8], count: usize, op: ReduceOp) {
    for i in 0..count {
        let off = i * T::SIZE;
        let a = T::read_le(&dst[off..off + T::SIZE]);
        let b = T::read_le(&src[off..off + T::SIZE]);
        T::reduce(a, b, op).write_le(&mut dst[off..off + T::SIZE]);
    }
}

fn div_typed<T: Reducible + LeBytes>(buf: &mut [u8], count: usize, divisor: u32) {
    for i in 0..count {
        let off = i * T::SIZE;
        let v = T::read_le(&buf[off..off + T::SIZE]);
        v.div(divisor).write_le(&mut buf[off..off + T::SIZE]);
    }
}
