//! # Chuan (串)
//!
//! 纯 Rust 实现的视频码流访问单元重组引擎.
//!
//! Chuan 把任意切分、可能不连续的输入缓冲序列还原为经校验、带时间戳
//! 的访问单元序列 (一幅编码图像一个单元), 支持 Annex-B 起始码定界与
//! hvcC 式长度前缀定界两种封装:
//! - **缓冲链**: 追加式段链 + 可移动读游标, 跨段标记查找带精确回溯
//! - **起始码扫描**: 可移植位技巧 / SSE2 / AVX2 三个等价实现, 运行时选择
//! - **HEVC 重组**: NAL 分类、参数集缓存、三队列访问单元装配
//!
//! # 快速开始
//!
//! ```rust
//! use chuan::core::Segment;
//! use chuan::hevc::{Framing, Packetizer};
//!
//! let mut pkt = Packetizer::new(Framing::AnnexB).unwrap();
//! for unit in pkt.feed(Segment::from_data(vec![0x00, 0x00, 0x01, 0x46, 0x01])) {
//!     println!("访问单元: {} 字节", unit.size());
//! }
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `chuan-core` | 核心类型: 错误、时间戳、缓冲段、ByteStream 缓冲链 |
//! | `chuan-scan` | 起始码扫描器 (portable/SSE2/AVX2) |
//! | `chuan-hevc` | HEVC 访问单元重组器与封装驱动 |

/// 核心类型与缓冲链
pub use chuan_core as core;

/// 起始码扫描器
pub use chuan_scan as scan;

/// HEVC 访问单元重组
pub use chuan_hevc as hevc;

pub mod logging;

/// 获取 Chuan 版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
