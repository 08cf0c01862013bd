//! 字节流缓冲链 (ByteStream).
//!
//! 只追加的缓冲段链, 带可移动读游标, 是重组引擎读取输入的唯一通道.
//! 游标表示为 (游标段下标, 段内偏移); `base_offset` 记录已释放字节数,
//! `total_pushed` 记录累计推入字节数.
//!
//! 不变式: 段内偏移 ≤ 游标段长度; base_offset + 已消费 + remaining == total_pushed.

use std::collections::VecDeque;

use crate::segment::Segment;
use crate::timestamp::NOPTS_VALUE;
use crate::{ChuanError, ChuanResult};

/// 单段快速查找辅助函数
///
/// 在一段连续内存中查找标记候选位置, 返回相对区域起点的偏移.
/// 由调用方注入 (通常为 SIMD 加速的起始码扫描器), 仅在当前段
/// 连续剩余 ≥ 标记长度时调用.
pub type FastHelper<'h> = &'h dyn Fn(&[u8]) -> Option<usize>;

/// 字节流缓冲链
#[derive(Debug, Default)]
pub struct ByteStream {
    /// 缓冲段链, 队尾 O(1) 追加
    chain: VecDeque<Segment>,
    /// 游标所在段在链中的下标
    cursor_seg: usize,
    /// 游标段内字节偏移
    cursor_off: usize,
    /// 链中游标段之前各段的总长度
    skipped: u64,
    /// 已释放 (flush/pop) 的字节数
    base_offset: u64,
    /// 累计推入的字节总数
    total_pushed: u64,
}

impl ByteStream {
    /// 创建空字节流
    pub fn new() -> Self {
        Self::default()
    }

    /// 在链尾追加一个缓冲段, O(1)
    pub fn push(&mut self, segment: Segment) {
        self.total_pushed += segment.len() as u64;
        self.chain.push_back(segment);
    }

    /// 追加一整条段链
    pub fn push_chain(&mut self, segments: impl IntoIterator<Item = Segment>) {
        for seg in segments {
            self.push(seg);
        }
    }

    /// 游标之后尚未消费的字节数
    pub fn remaining(&self) -> usize {
        (self.total_pushed - self.base_offset - self.skipped - self.cursor_off as u64) as usize
    }

    /// 累计推入的字节总数
    pub fn total_pushed(&self) -> u64 {
        self.total_pushed
    }

    /// 检查缓冲中是否已有 `n` 字节可读, 不改变任何状态
    pub fn wait(&self, n: usize) -> ChuanResult<()> {
        if self.remaining() < n {
            return Err(ChuanError::NeedMoreData);
        }
        Ok(())
    }

    /// 从游标处复制 `dst.len()` 字节, 不移动游标
    ///
    /// 数据不足时返回 [`ChuanError::NeedMoreData`], 此时 `dst` 内容未定义.
    pub fn peek(&self, dst: &mut [u8]) -> ChuanResult<()> {
        self.wait(dst.len())?;

        let mut copied = 0usize;
        let mut seg_idx = self.cursor_seg;
        let mut off = self.cursor_off;
        while copied < dst.len() {
            let seg = &self.chain[seg_idx];
            let avail = seg.len() - off;
            let take = avail.min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&seg.data[off..off + take]);
            copied += take;
            seg_idx += 1;
            off = 0;
        }
        Ok(())
    }

    /// 从游标处读取 `dst.len()` 字节并前移游标
    pub fn get(&mut self, dst: &mut [u8]) -> ChuanResult<()> {
        self.peek(dst)?;
        self.advance(dst.len());
        Ok(())
    }

    /// 跳过 `n` 字节 (等价于丢弃目标的 `get`)
    pub fn skip(&mut self, n: usize) -> ChuanResult<()> {
        self.wait(n)?;
        self.advance(n);
        Ok(())
    }

    /// 前移游标 `n` 字节, 调用方必须保证数据足够
    fn advance(&mut self, n: usize) {
        let mut left = n;
        while left > 0 {
            let seg_len = self.chain[self.cursor_seg].len();
            let avail = seg_len - self.cursor_off;
            if avail == 0 {
                self.skipped += seg_len as u64;
                self.cursor_seg += 1;
                self.cursor_off = 0;
                continue;
            }
            let take = avail.min(left);
            self.cursor_off += take;
            left -= take;
        }
    }

    /// 取走游标段的时间戳 (取走后置为无效, 同一段只会被使用一次)
    pub fn take_timestamp(&mut self) -> (i64, i64) {
        match self.chain.get_mut(self.cursor_seg) {
            Some(seg) => {
                let ts = (seg.pts, seg.dts);
                seg.pts = NOPTS_VALUE;
                seg.dts = NOPTS_VALUE;
                ts
            }
            None => (NOPTS_VALUE, NOPTS_VALUE),
        }
    }

    /// 释放游标之前的所有段, 以及队首已整段消费完的段
    ///
    /// 幂等: 连续调用第二次不产生任何效果.
    pub fn flush(&mut self) {
        while self.cursor_seg > 0 {
            let seg = self.chain.pop_front().expect("游标段下标超出链长");
            self.base_offset += seg.len() as u64;
            self.skipped -= seg.len() as u64;
            self.cursor_seg -= 1;
        }
        while let Some(front) = self.chain.front() {
            if front.len() != self.cursor_off {
                break;
            }
            let seg = self.chain.pop_front().expect("队首段不存在");
            self.base_offset += seg.len() as u64;
            self.cursor_off = 0;
        }
    }

    /// 释放游标之前的数据, 然后把游标之后的整条链分离并交出所有权
    ///
    /// 链首段若已被部分消费则原地裁剪 (不拆分). 调用后内部链逻辑上为空.
    pub fn pop(&mut self) -> Vec<Segment> {
        self.flush();
        if self.cursor_off > 0
            && let Some(front) = self.chain.front_mut()
        {
            front.data.drain(..self.cursor_off);
            self.base_offset += self.cursor_off as u64;
            self.cursor_off = 0;
        }
        let out: Vec<Segment> = self.chain.drain(..).collect();
        let handed: u64 = out.iter().map(|s| s.len() as u64).sum();
        self.base_offset += handed;
        self.cursor_seg = 0;
        self.cursor_off = 0;
        self.skipped = 0;
        out
    }

    /// 从游标后第 `start_offset` 字节起查找标记序列的下一次出现
    ///
    /// 跨段扫描; 部分匹配失败时精确回溯到该次部分匹配起点的下一个字节,
    /// 不会漏掉与之重叠的更晚匹配. `fast_helper` 为可选的单段加速查找,
    /// 仅当当前段连续剩余 ≥ 标记长度时使用.
    ///
    /// 返回 `Ok(标记首字节相对游标的偏移)`; 未找到时返回
    /// `Err(已确定不含标记起点的字节数)`, 调用方可据此在补充数据后续扫,
    /// 不必重扫旧数据.
    pub fn find_marker(
        &self,
        start_offset: usize,
        marker: &[u8],
        fast_helper: Option<FastHelper<'_>>,
    ) -> Result<usize, usize> {
        debug_assert!(!marker.is_empty());
        let marker_len = marker.len();
        let total = self.remaining();

        let mut matched = 0usize;
        // 部分匹配起点: (段下标, 段切片内下标, 相对游标偏移)
        let mut backtrack = (0usize, 0usize, 0usize);

        let mut seg_idx = self.cursor_seg;
        let mut rel_base = 0usize;
        let mut i = 0usize;
        'segments: while seg_idx < self.chain.len() {
            let begin = if seg_idx == self.cursor_seg {
                self.cursor_off
            } else {
                0
            };
            let seg_bytes = &self.chain[seg_idx].data[begin..];

            while i < seg_bytes.len() {
                let pos = rel_base + i;
                if pos < start_offset {
                    // 尚未到达起始偏移, 整段快进
                    i += start_offset - pos;
                    continue;
                }
                if matched == 0
                    && let Some(helper) = fast_helper
                    && seg_bytes.len() - i >= marker_len
                {
                    match helper(&seg_bytes[i..]) {
                        // 命中候选, 跳到候选处由逐字节匹配确认
                        Some(hit) => i += hit,
                        // 段内无完整标记, 只剩跨段尾部需要逐字节匹配
                        None => i = seg_bytes.len() - (marker_len - 1),
                    }
                }
                if seg_bytes[i] == marker[matched] {
                    if matched == 0 {
                        backtrack = (seg_idx, i, rel_base + i);
                    }
                    matched += 1;
                    if matched == marker_len {
                        return Ok(rel_base + i + 1 - marker_len);
                    }
                    i += 1;
                } else if matched > 0 {
                    // 回溯到部分匹配起点之后一字节
                    matched = 0;
                    seg_idx = backtrack.0;
                    rel_base = backtrack.2 - backtrack.1;
                    i = backtrack.1 + 1;
                    continue 'segments;
                } else {
                    i += 1;
                }
            }

            rel_base += seg_bytes.len();
            seg_idx += 1;
            i = 0;
        }

        // 结尾的部分匹配可能随后续数据补全, 不能算作已排除
        Err(total.saturating_sub(matched).max(start_offset.min(total)))
    }
}
