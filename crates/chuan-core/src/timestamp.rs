//! 时间戳常量与工具.
//!
//! 引擎不做时间基换算, 只透传来自容器层的 PTS/DTS.

/// 表示"未定义"的时间戳值
pub const NOPTS_VALUE: i64 = i64::MIN;

/// 判断时间戳是否有效 (非 NOPTS_VALUE)
pub const fn is_valid_ts(ts: i64) -> bool {
    ts != NOPTS_VALUE
}
