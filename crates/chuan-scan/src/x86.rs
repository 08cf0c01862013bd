//! x86_64 SIMD 起始码扫描.
//!
//! SSE2 以 16 字节、AVX2 以 32 字节为一组检测零字节, 含零字节的
//! 窗口退回逐字节验证, 与可移植实现逐字节等价.
//!
//! 调用方须先通过 `is_x86_feature_detected!` 确认 CPU 能力.

#![cfg(target_arch = "x86_64")]

use std::arch::x86_64::*;

/// 逐字节验证 `[from, to)` 区间内的起点
#[inline]
fn verify_range(data: &[u8], from: usize, to: usize) -> Option<usize> {
    let limit = to.min(data.len().saturating_sub(2));
    for i in from..limit {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            return Some(i);
        }
    }
    None
}

/// SSE2 实现: 16 字节通道
///
/// # Safety
/// 需要 SSE2 支持 (x86_64 基线即有, 仍经运行时检测选择).
#[target_feature(enable = "sse2")]
pub unsafe fn scan_sse2(data: &[u8]) -> Option<usize> {
    let n = data.len();
    if n < 3 {
        return None;
    }

    let zero = unsafe { _mm_setzero_si128() };
    let mut i = 0usize;
    while i + 16 <= n {
        let chunk = unsafe { _mm_loadu_si128(data.as_ptr().add(i) as *const __m128i) };
        let mask = unsafe { _mm_movemask_epi8(_mm_cmpeq_epi8(chunk, zero)) };
        if mask == 0 {
            // 窗口内无零字节, 起点不可能落在这 16 字节内
            i += 16;
            continue;
        }
        if let Some(hit) = verify_range(data, i, i + 16) {
            return Some(hit);
        }
        i += 16;
    }
    verify_range(data, i, n)
}

/// AVX2 实现: 32 字节通道
///
/// # Safety
/// 需要 AVX2 支持, 先经 `is_x86_feature_detected!("avx2")` 检测.
#[target_feature(enable = "avx2")]
pub unsafe fn scan_avx2(data: &[u8]) -> Option<usize> {
    let n = data.len();
    if n < 3 {
        return None;
    }

    let zero = unsafe { _mm256_setzero_si256() };
    let mut i = 0usize;
    while i + 32 <= n {
        let chunk = unsafe { _mm256_loadu_si256(data.as_ptr().add(i) as *const __m256i) };
        let mask = unsafe { _mm256_movemask_epi8(_mm256_cmpeq_epi8(chunk, zero)) };
        if mask == 0 {
            i += 32;
            continue;
        }
        if let Some(hit) = verify_range(data, i, i + 32) {
            return Some(hit);
        }
        i += 32;
    }
    verify_range(data, i, n)
}
