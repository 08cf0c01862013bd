//! 统一错误类型定义.
//!
//! 所有 Chuan crate 共用的错误类型, 支持跨模块传播.

use thiserror::Error;

/// Chuan 引擎统一错误类型
#[derive(Debug, Error)]
pub enum ChuanError {
    /// 无效参数
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 不支持的操作
    #[error("不支持的操作: {0}")]
    Unsupported(String),

    /// 无效数据 (损坏的码流等)
    #[error("无效数据: {0}")]
    InvalidData(String),

    /// 数据不足, 需要更多输入
    #[error("数据不足, 需要更多输入")]
    NeedMoreData,

    /// 已到达流末尾
    #[error("已到达流末尾")]
    Eof,

    /// 内部错误 (不应发生)
    #[error("内部错误: {0}")]
    Internal(String),
}

/// Chuan 引擎统一 Result 类型
pub type ChuanResult<T> = Result<T, ChuanError>;
