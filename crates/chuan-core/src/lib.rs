//! # chuan-core
//!
//! Chuan 码流重组引擎核心库, 提供基础类型定义、错误处理和字节流基础设施.
//!
//! 本 crate 为整个 Chuan 工作区提供底层地基: 统一错误类型、缓冲段与
//! 访问单元模型、带回溯查找的字节流缓冲链, 以及参数集解析所需的
//! 比特流读取器.

pub mod bitreader;
pub mod bytestream;
pub mod error;
pub mod rational;
pub mod segment;
pub mod timestamp;

// 重导出常用类型
pub use bytestream::ByteStream;
pub use error::{ChuanError, ChuanResult};
pub use rational::Rational;
pub use segment::{AccessUnit, Segment, SegmentFlags};
pub use timestamp::NOPTS_VALUE;
