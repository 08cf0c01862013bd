//! 缓冲段 (Segment) 与访问单元 (AccessUnit).
//!
//! Segment 是引擎内部流转的最小数据单元: 一段独占所有权的字节负载,
//! 附带可选的 PTS/DTS 与分类标志. 段链之间只发生所有权转移, 从不共享.

use bytes::Bytes;

use crate::timestamp::NOPTS_VALUE;

bitflags::bitflags! {
    /// 缓冲段分类标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SegmentFlags: u32 {
        /// 流不连续点 (时间戳或内容跳变)
        const DISCONTINUITY = 1 << 0;
        /// 数据已损坏
        const CORRUPTED = 1 << 1;
        /// 关键图像 (IDR/CRA/BLA 类)
        const KEY_PICTURE = 1 << 2;
        /// 前向预测图像 (P)
        const PREDICTIVE = 1 << 3;
        /// 双向预测图像 (B)
        const BI_PREDICTIVE = 1 << 4;
    }
}

/// 缓冲段
///
/// 一段独占所有权的字节数据, 由当前持有它的链 (ByteStream 或队列) 独占.
#[derive(Debug, Clone)]
pub struct Segment {
    /// 字节负载
    pub data: Vec<u8>,
    /// 显示时间戳, `NOPTS_VALUE` 表示未定义
    pub pts: i64,
    /// 解码时间戳, `NOPTS_VALUE` 表示未定义
    pub dts: i64,
    /// 分类标志
    pub flags: SegmentFlags,
}

impl Segment {
    /// 从数据创建无时间戳的段
    pub fn from_data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            pts: NOPTS_VALUE,
            dts: NOPTS_VALUE,
            flags: SegmentFlags::empty(),
        }
    }

    /// 附加时间戳
    pub fn with_ts(mut self, pts: i64, dts: i64) -> Self {
        self.pts = pts;
        self.dts = dts;
        self
    }

    /// 附加标志
    pub fn with_flags(mut self, flags: SegmentFlags) -> Self {
        self.flags = flags;
        self
    }

    /// 数据大小 (字节)
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 是否为空段
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// 重组完成的访问单元
///
/// 一幅编码图像的全部 NAL 数据, 按解码顺序拼接为一块连续内存,
/// 继承其片段的时间戳与图像类型标志.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// 拼接后的连续数据
    pub data: Bytes,
    /// 显示时间戳, `NOPTS_VALUE` 表示未定义
    pub pts: i64,
    /// 解码时间戳, `NOPTS_VALUE` 表示未定义
    pub dts: i64,
    /// OR 合并后的分类标志
    pub flags: SegmentFlags,
}

impl AccessUnit {
    /// 是否为关键图像
    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(SegmentFlags::KEY_PICTURE)
    }

    /// 数据大小 (字节)
    pub fn size(&self) -> usize {
        self.data.len()
    }
}
