//! # chuan-scan
//!
//! Chuan 码流重组引擎的起始码扫描器, 在连续内存中查找 Annex-B
//! 三字节标记 `00 00 01` 的首次出现.
//!
//! 提供三个逐字节等价的实现:
//! - 可移植字级实现 (零字节检测位技巧)
//! - SSE2 实现 (16 字节通道)
//! - AVX2 实现 (32 字节通道)
//!
//! 实现按 CPU 能力在会话构建时选择一次, 以 trait 对象形式存放在
//! 会话状态中, 不依赖任何进程级可变状态.

pub mod portable;
#[cfg(target_arch = "x86_64")]
pub mod x86;

use log::debug;

/// Annex-B 三字节起始码
pub const STARTCODE: [u8; 3] = [0x00, 0x00, 0x01];

/// 输出重组帧时使用的四字节起始码形式
pub const STARTCODE_4: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// 起始码扫描器
///
/// 给定一段连续内存, 返回首个 `00 00 01` 的首字节偏移.
/// 所有实现必须逐字节等价, 包括缓冲首尾与重叠候选
/// (`00 00 00 01` 只在偏移 1 命中).
pub trait StartcodeScanner: Send + Sync {
    /// 实现名称 (用于日志与基准)
    fn name(&self) -> &'static str;

    /// 查找首个起始码, 返回其首字节偏移
    fn scan(&self, data: &[u8]) -> Option<usize>;
}

/// 可移植字级扫描器
pub struct PortableScanner;

impl StartcodeScanner for PortableScanner {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn scan(&self, data: &[u8]) -> Option<usize> {
        portable::scan(data)
    }
}

/// SSE2 扫描器 (16 字节通道)
#[cfg(target_arch = "x86_64")]
pub struct Sse2Scanner;

#[cfg(target_arch = "x86_64")]
impl StartcodeScanner for Sse2Scanner {
    fn name(&self) -> &'static str {
        "sse2"
    }

    fn scan(&self, data: &[u8]) -> Option<usize> {
        // 构建期已通过运行时检测确认 SSE2 可用
        unsafe { x86::scan_sse2(data) }
    }
}

/// AVX2 扫描器 (32 字节通道)
#[cfg(target_arch = "x86_64")]
pub struct Avx2Scanner;

#[cfg(target_arch = "x86_64")]
impl StartcodeScanner for Avx2Scanner {
    fn name(&self) -> &'static str {
        "avx2"
    }

    fn scan(&self, data: &[u8]) -> Option<usize> {
        // 构建期已通过运行时检测确认 AVX2 可用
        unsafe { x86::scan_avx2(data) }
    }
}

/// 按 CPU 能力选择最优扫描器实现
///
/// 每个会话构建时调用一次, 返回的 trait 对象由会话自行持有.
pub fn select() -> Box<dyn StartcodeScanner> {
    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") {
            debug!("起始码扫描器: 选用 AVX2 实现");
            return Box::new(Avx2Scanner);
        }
        if is_x86_feature_detected!("sse2") {
            debug!("起始码扫描器: 选用 SSE2 实现");
            return Box::new(Sse2Scanner);
        }
    }
    debug!("起始码扫描器: 选用可移植实现");
    Box::new(PortableScanner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_可用() {
        let scanner = select();
        assert_eq!(scanner.scan(&[0x00, 0x00, 0x01, 0xAA]), Some(0));
        assert_eq!(scanner.scan(&[0xAA, 0xBB]), None);
    }

    #[test]
    fn test_规定向量() {
        // 00 00 00 01 55*5 00 00 01 22 22: 命中偏移 1 与 9
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x55, 0x55, 0x55, 0x55, 0x55, 0x00, 0x00, 0x01, 0x22, 0x22,
        ];
        let scanner = select();
        assert_eq!(scanner.scan(&data), Some(1));
        assert_eq!(scanner.scan(&data[2..]), Some(7));
    }
}
