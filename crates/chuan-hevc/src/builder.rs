//! HEVC 访问单元重组状态机.
//!
//! 每个以起始码开头的片段经 `parse` 分类后进入三个有序队列之一:
//! 前队列 (参数集/AUD/前缀 SEI)、帧队列 (编码片) 与后队列 (尾随
//! 数据). 图像边界由码流语义推断: 新图像的首片到来时, 上一图像的
//! 三个队列按 前→帧→后 顺序拼接为一个访问单元输出.
//!
//! 参数集缓存与序列就绪标志决定新起图像是否可信; 不可信或结构
//! 损坏的单元在拼接时被丢弃, 从不交还给调用方.

use bytes::{BufMut, BytesMut};
use chuan_core::timestamp::NOPTS_VALUE;
use chuan_core::{AccessUnit, Rational, Segment, SegmentFlags};
use log::{debug, trace, warn};

use crate::nal::{NalClass, NalHeader, NalUnitType, classify, startcode_len};
use crate::paramset::{
    ColourDescription, ParamSetTables, extract_id, parse_pps, parse_sps, parse_vps,
};
use crate::slice::{SliceType, probe_slice_header};

/// 片段的最小有效长度 (起始码 + 类型字节)
pub const MIN_FRAGMENT_LEN: usize = 5;

/// `parse` 的单次结果
#[derive(Debug)]
pub enum ParseOutcome {
    /// 尚未凑齐一个访问单元, 继续喂入
    Incomplete,
    /// 产出一个完整访问单元
    Produced(AccessUnit),
    /// 片段结构非法, 已丢弃
    Dropped,
}

/// `parse` 的返回值: 结果 + 时间戳是否被消费
///
/// `ts_used` 为假时, 调用方应把片段的时间戳结转给下一个片段.
#[derive(Debug)]
pub struct ParseResult {
    /// 本次结果
    pub outcome: ParseOutcome,
    /// 片段自带的时间戳是否已被当前图像采用
    pub ts_used: bool,
}

impl ParseResult {
    fn new(outcome: ParseOutcome, ts_used: bool) -> Self {
        Self { outcome, ts_used }
    }
}

/// 从首个 SPS 回填一次的输出属性
#[derive(Debug, Clone)]
pub struct StreamProps {
    /// 图像宽度 (像素)
    pub width: u32,
    /// 图像高度 (像素)
    pub height: u32,
    /// 帧率 (如果 SPS 的 VUI 携带 timing_info)
    pub fps: Option<Rational>,
    /// 样本宽高比
    pub sar: Rational,
    /// general_profile_idc
    pub profile_idc: u8,
    /// general_tier_flag
    pub tier_flag: bool,
    /// general_level_idc
    pub level_idc: u8,
    /// 色度格式
    pub chroma_format_idc: u32,
    /// 亮度位深
    pub bit_depth_luma: u32,
    /// 色彩描述 (如有)
    pub colour: Option<ColourDescription>,
}

/// HEVC 访问单元重组器
pub struct AccessUnitBuilder {
    /// 前队列: 图像前部数据
    pre: Vec<Segment>,
    /// 帧队列: 当前图像的编码片
    frame: Vec<Segment>,
    /// 后队列: 尾随数据
    post: Vec<Segment>,
    /// 三级参数集缓存
    tables: ParamSetTables,
    /// 序列就绪: 存在可解析的 PPS→SPS→VPS 链且已见基层关键图像
    sequence_ready: bool,
    /// 输出属性, 由首个成功解码的 SPS 回填一次
    props: Option<StreamProps>,
}

impl Default for AccessUnitBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessUnitBuilder {
    /// 创建空状态的重组器
    pub fn new() -> Self {
        Self {
            pre: Vec::new(),
            frame: Vec::new(),
            post: Vec::new(),
            tables: ParamSetTables::new(),
            sequence_ready: false,
            props: None,
        }
    }

    /// 输出属性 (首个 SPS 解码成功后可用)
    pub fn props(&self) -> Option<&StreamProps> {
        self.props.as_ref()
    }

    /// 序列是否就绪
    pub fn is_sequence_ready(&self) -> bool {
        self.sequence_ready
    }

    /// 参数集缓存 (测试与诊断用)
    pub fn tables(&self) -> &ParamSetTables {
        &self.tables
    }

    /// 处理一个以起始码开头的片段
    pub fn parse(&mut self, fragment: Segment) -> ParseResult {
        // 结构检查: 最小长度与起始码
        if fragment.len() < MIN_FRAGMENT_LEN {
            trace!("HEVC: 片段过短 ({} 字节), 丢弃", fragment.len());
            return ParseResult::new(ParseOutcome::Dropped, false);
        }
        let Some(sc_len) = startcode_len(&fragment.data) else {
            warn!("HEVC: 片段未以起始码开头, 扫描器失步, 丢弃");
            return ParseResult::new(ParseOutcome::Dropped, false);
        };
        let nal = &fragment.data[sc_len..];
        if nal.len() < 2 {
            // 长度不足只丢弃片段本身, 不波及在装配的访问单元
            trace!("HEVC: NAL 头不完整 ({} 字节), 丢弃", nal.len());
            return ParseResult::new(ParseOutcome::Dropped, false);
        }

        let header = match NalHeader::parse(nal) {
            Ok(h) => h,
            Err(_) => {
                // forbidden bit 置位的片段污染在装配的图像
                warn!("HEVC: NAL 头非法, 丢弃片段并废弃在装配的访问单元");
                self.discard_in_flight();
                return ParseResult::new(ParseOutcome::Dropped, false);
            }
        };

        match classify(header.nal_type) {
            NalClass::Vcl => self.parse_vcl(fragment, sc_len, header),
            NalClass::Head => self.parse_head(fragment, sc_len, header),
            NalClass::Tail => self.parse_tail(fragment, header),
        }
    }

    /// VCL 片段: 进入帧队列, 首片触发上一图像的输出
    fn parse_vcl(&mut self, mut fragment: Segment, sc_len: usize, header: NalHeader) -> ParseResult {
        let payload = &fragment.data[sc_len + 2..];
        if payload.is_empty() {
            trace!("HEVC: VCL 片段无负载, 丢弃");
            return ParseResult::new(ParseOutcome::Dropped, false);
        }
        let first_slice = payload[0] & 0x80 != 0;

        // 新图像的首片先输出上一图像
        let mut produced = None;
        if first_slice && !self.frame.is_empty() {
            produced = self.flush_and_gather(true, true);
        }

        let mut ts_used = false;
        if first_slice {
            let mut flags = SegmentFlags::empty();
            if header.nal_type.is_irap() {
                flags |= SegmentFlags::KEY_PICTURE;
            } else {
                // 非 IRAP: 以片类型区分 P 与其余; 探测失败按 B 处理
                match probe_slice_header(header.nal_type, payload, &self.tables) {
                    Ok(info) if info.slice_type == SliceType::P => {
                        flags |= SegmentFlags::PREDICTIVE;
                    }
                    _ => flags |= SegmentFlags::BI_PREDICTIVE,
                }
            }

            if !self.sequence_ready
                && header.layer_id == 0
                && flags.contains(SegmentFlags::KEY_PICTURE)
                && self.tables.is_sequence_resolvable()
            {
                debug!("HEVC: 参数集链可解析且遇基层关键图像, 序列就绪");
                self.sequence_ready = true;
            }
            if !self.sequence_ready {
                // 序列未就绪时新起的图像不可信, 拼接时整体丢弃
                trace!("HEVC: 序列未就绪, 图像标记为损坏");
                flags |= SegmentFlags::CORRUPTED;
            }

            fragment.flags |= flags;
            ts_used = true;
        }

        self.frame.push(fragment);
        match produced {
            Some(unit) => ParseResult::new(ParseOutcome::Produced(unit), ts_used),
            None => ParseResult::new(ParseOutcome::Incomplete, ts_used),
        }
    }

    /// 前部非 VCL 片段: 关闭上一图像, 参数集入表, 片段入前队列
    fn parse_head(&mut self, fragment: Segment, sc_len: usize, header: NalHeader) -> ParseResult {
        let mut produced = None;
        if !self.post.is_empty() || !self.frame.is_empty() {
            produced = self.flush_and_gather(true, true);
        } else if header.nal_type == NalUnitType::Aud && !self.pre.is_empty() {
            // 孤立的 AUD 也终结只有前部数据的残缺单元
            produced = self.flush_and_gather(true, true);
        }

        if matches!(
            header.nal_type,
            NalUnitType::Vps | NalUnitType::Sps | NalUnitType::Pps
        ) {
            self.ingest_parameter_set(header.nal_type, &fragment.data[sc_len..]);
        }

        self.pre.push(fragment);
        match produced {
            Some(unit) => ParseResult::new(ParseOutcome::Produced(unit), false),
            None => ParseResult::new(ParseOutcome::Incomplete, false),
        }
    }

    /// 尾随非 VCL 片段: 入后队列, EOS/EOB 立即输出
    fn parse_tail(&mut self, fragment: Segment, header: NalHeader) -> ParseResult {
        self.post.push(fragment);

        let produced = if matches!(header.nal_type, NalUnitType::Eos | NalUnitType::Eob) {
            self.flush_and_gather(true, false)
        } else if self.frame.is_empty() {
            // 无图像伴随的尾随数据不构成访问单元, 作废丢弃
            self.flush_and_gather(false, false)
        } else {
            None
        };

        match produced {
            Some(unit) => ParseResult::new(ParseOutcome::Produced(unit), false),
            None => ParseResult::new(ParseOutcome::Incomplete, false),
        }
    }

    /// 参数集入表: 先释放旧记录, 解码失败留空槽位 (非致命)
    ///
    /// `nal` 为含 2 字节 NAL 头的数据.
    fn ingest_parameter_set(&mut self, nal_type: NalUnitType, nal: &[u8]) {
        let payload = &nal[2..];
        let id = match extract_id(nal_type, payload) {
            Ok(id) => id,
            Err(err) => {
                warn!("HEVC: 参数集 id 提取失败: {err}");
                return;
            }
        };

        match nal_type {
            NalUnitType::Vps => {
                let decoded = parse_vps(payload)
                    .inspect_err(|err| warn!("HEVC: VPS id={id} 解码失败: {err}"))
                    .ok();
                self.tables.store_vps(id, decoded);
            }
            NalUnitType::Sps => {
                let decoded = parse_sps(payload)
                    .inspect_err(|err| warn!("HEVC: SPS id={id} 解码失败: {err}"))
                    .ok();
                if let Some(sps) = &decoded
                    && self.props.is_none()
                {
                    debug!(
                        "HEVC: 输出属性回填: {}x{} profile={} level={}",
                        sps.width, sps.height, sps.general_profile_idc, sps.general_level_idc
                    );
                    self.props = Some(StreamProps {
                        width: sps.width,
                        height: sps.height,
                        fps: sps.fps,
                        sar: sps.sar,
                        profile_idc: sps.general_profile_idc,
                        tier_flag: sps.general_tier_flag,
                        level_idc: sps.general_level_idc,
                        chroma_format_idc: sps.chroma_format_idc,
                        bit_depth_luma: sps.bit_depth_luma,
                        colour: sps.colour,
                    });
                }
                self.tables.store_sps(id, decoded);
            }
            NalUnitType::Pps => {
                let decoded = parse_pps(payload)
                    .inspect_err(|err| warn!("HEVC: PPS id={id} 解码失败: {err}"))
                    .ok();
                self.tables.store_pps(id, decoded);
            }
            _ => {}
        }
    }

    /// 拼接三个队列为一个访问单元
    ///
    /// `is_valid` 为假或期望图像而帧队列为空时, 单元视为损坏并丢弃
    /// (跳过拼接, 直接释放). 损坏的单元从不返回给调用方.
    fn flush_and_gather(&mut self, is_valid: bool, expect_picture: bool) -> Option<AccessUnit> {
        let frame_empty = self.frame.is_empty();
        if self.pre.is_empty() && frame_empty && self.post.is_empty() {
            return None;
        }

        let segments: Vec<Segment> = self
            .pre
            .drain(..)
            .chain(self.frame.drain(..))
            .chain(self.post.drain(..))
            .collect();

        let mut flags = SegmentFlags::empty();
        let mut pts = NOPTS_VALUE;
        let mut dts = NOPTS_VALUE;
        let mut total = 0usize;
        for seg in &segments {
            flags |= seg.flags;
            if pts == NOPTS_VALUE && dts == NOPTS_VALUE {
                pts = seg.pts;
                dts = seg.dts;
            }
            total += seg.len();
        }

        let corrupted = !is_valid
            || (expect_picture && frame_empty)
            || flags.contains(SegmentFlags::CORRUPTED);
        if corrupted {
            debug!(
                "HEVC: 丢弃损坏的访问单元 ({} 片段, {} 字节)",
                segments.len(),
                total
            );
            return None;
        }

        let mut data = BytesMut::with_capacity(total);
        for seg in segments {
            data.put_slice(&seg.data);
        }

        Some(AccessUnit {
            data: data.freeze(),
            pts,
            dts,
            flags,
        })
    }

    /// 输出当前在装配的访问单元 (会话收尾或扫描到流末尾时调用)
    pub fn finish(&mut self) -> Option<AccessUnit> {
        self.flush_and_gather(true, true)
    }

    /// 废弃在装配的访问单元, 不输出
    fn discard_in_flight(&mut self) {
        self.pre.clear();
        self.frame.clear();
        self.post.clear();
    }

    /// 不连续点处理: 丢弃在装配的图像并清除就绪标志, 参数集缓存保留
    pub fn reset(&mut self, is_discontinuity: bool) {
        if is_discontinuity {
            debug!("HEVC: 不连续点, 丢弃在装配的图像");
        }
        self.discard_in_flight();
        self.sequence_ready = false;
    }

    /// 会话结束: 无条件释放队列与参数集缓存
    pub fn close(&mut self) {
        self.discard_in_flight();
        self.tables.clear();
        self.sequence_ready = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paramset::tests::{
        build_pps_payload, build_sps_payload, build_sps_payload_cropped, build_vps_payload,
    };

    /// 以 4 字节起始码封装 NAL
    fn frag(nal_type: u8, payload: &[u8]) -> Segment {
        let mut data = vec![0, 0, 0, 1];
        data.push(nal_type << 1);
        data.push(0x01); // layer_id=0, temporal_id_plus1=1
        data.extend_from_slice(payload);
        Segment::from_data(data)
    }

    fn vcl_frag(nal_type: u8, first_slice: bool) -> Segment {
        // 片头占位: first_slice 位 + 若干填充
        let lead = if first_slice { 0xC0 } else { 0x40 };
        frag(nal_type, &[lead, 0xFF, 0xFF, 0xFF])
    }

    fn feed_parameter_sets(builder: &mut AccessUnitBuilder) {
        for (t, payload) in [
            (32u8, build_vps_payload(0)),
            (33, build_sps_payload(0)),
            (34, build_pps_payload(0, 0)),
        ] {
            let result = builder.parse(frag(t, &payload));
            assert!(matches!(result.outcome, ParseOutcome::Incomplete));
        }
    }

    #[test]
    fn test_访问单元边界() {
        let mut builder = AccessUnitBuilder::new();
        feed_parameter_sets(&mut builder);

        // 第一幅关键图像: 两个片段
        let r = builder.parse(vcl_frag(19, true).with_ts(9000, 9000));
        assert!(matches!(r.outcome, ParseOutcome::Incomplete));
        assert!(r.ts_used);
        let r = builder.parse(vcl_frag(19, false));
        assert!(!r.ts_used);

        // 中间插入参数集: 终结第一幅图像
        let r = builder.parse(frag(34, &build_pps_payload(0, 0)));
        let ParseOutcome::Produced(unit) = r.outcome else {
            panic!("应当输出第一个访问单元");
        };
        assert!(unit.is_keyframe());
        assert_eq!(unit.pts, 9000);

        // 第二幅关键图像的首片: 帧队列已清空, 不再输出
        let r = builder.parse(vcl_frag(19, true).with_ts(12600, 12600));
        assert!(matches!(r.outcome, ParseOutcome::Incomplete));
    }

    #[test]
    fn test_首片触发输出() {
        let mut builder = AccessUnitBuilder::new();
        feed_parameter_sets(&mut builder);

        assert!(matches!(
            builder.parse(vcl_frag(19, true)).outcome,
            ParseOutcome::Incomplete
        ));
        // 下一图像首片直接到来
        let r = builder.parse(vcl_frag(1, true));
        assert!(matches!(r.outcome, ParseOutcome::Produced(_)));
    }

    #[test]
    fn test_序列未就绪图像被丢弃() {
        let mut builder = AccessUnitBuilder::new();
        // 不喂参数集, 直接喂关键图像
        assert!(matches!(
            builder.parse(vcl_frag(19, true)).outcome,
            ParseOutcome::Incomplete
        ));
        assert!(!builder.is_sequence_ready());
        // 首片触发 flush, 但图像被标记损坏, 不输出
        let r = builder.parse(vcl_frag(19, true));
        assert!(matches!(r.outcome, ParseOutcome::Incomplete));
    }

    #[test]
    fn test_损坏单元抑制() {
        let mut builder = AccessUnitBuilder::new();
        feed_parameter_sets(&mut builder);

        assert!(matches!(
            builder.parse(vcl_frag(19, true)).outcome,
            ParseOutcome::Incomplete
        ));
        // forbidden bit 置位的片段: 丢弃并废弃在装配的图像
        let poisoned = Segment::from_data(vec![0, 0, 0, 1, 0xA6, 0x01, 0xFF]);
        let r = builder.parse(poisoned);
        assert!(matches!(r.outcome, ParseOutcome::Dropped));

        // 后续正常图像恢复解析
        let r = builder.parse(vcl_frag(19, true));
        assert!(matches!(r.outcome, ParseOutcome::Incomplete));
        let r = builder.parse(vcl_frag(19, true));
        assert!(matches!(r.outcome, ParseOutcome::Produced(_)));
    }

    #[test]
    fn test_eos立即输出() {
        let mut builder = AccessUnitBuilder::new();
        feed_parameter_sets(&mut builder);
        builder.parse(vcl_frag(19, true));

        let r = builder.parse(frag(36, &[]));
        let ParseOutcome::Produced(unit) = r.outcome else {
            panic!("EOS 应当立即输出访问单元");
        };
        // 单元含参数集 + 片 + EOS
        assert!(unit.size() > 0);
        assert!(unit.is_keyframe());
    }

    #[test]
    fn test_孤立尾随数据丢弃() {
        let mut builder = AccessUnitBuilder::new();
        // 无图像伴随的后缀 SEI: 不输出
        let r = builder.parse(frag(40, &[0x01, 0x02, 0x03]));
        assert!(matches!(r.outcome, ParseOutcome::Incomplete));
        // 队列已被作废清空
        let r = builder.parse(frag(40, &[0x01, 0x02, 0x03]));
        assert!(matches!(r.outcome, ParseOutcome::Incomplete));
    }

    #[test]
    fn test_不连续点保留参数集缓存() {
        let mut builder = AccessUnitBuilder::new();
        feed_parameter_sets(&mut builder);
        builder.parse(vcl_frag(19, true));
        assert!(builder.is_sequence_ready());

        builder.reset(true);
        assert!(!builder.is_sequence_ready());
        assert!(builder.tables().is_sequence_resolvable());

        // 相同缓存下的关键图像立即恢复就绪
        builder.parse(vcl_frag(19, true));
        assert!(builder.is_sequence_ready());
        let r = builder.parse(vcl_frag(19, true));
        assert!(matches!(r.outcome, ParseOutcome::Produced(_)));
    }

    #[test]
    fn test_属性回填一次() {
        let mut builder = AccessUnitBuilder::new();
        feed_parameter_sets(&mut builder);
        let props = builder.props().expect("SPS 解码后应有输出属性");
        assert_eq!(props.width, 64);
        assert_eq!(props.height, 64);
        assert_eq!(props.profile_idc, 1);
    }

    #[test]
    fn test_过短片段丢弃() {
        let mut builder = AccessUnitBuilder::new();
        let r = builder.parse(Segment::from_data(vec![0, 0, 1, 0x40]));
        assert!(matches!(r.outcome, ParseOutcome::Dropped));
        assert!(!r.ts_used);
    }

    #[test]
    fn test_nal头不完整不废弃在装配图像() {
        let mut builder = AccessUnitBuilder::new();
        feed_parameter_sets(&mut builder);
        builder.parse(vcl_frag(19, true));

        // 4 字节起始码 + 1 字节: 过 5 字节门槛但 NAL 头不完整, 只丢弃自身
        let r = builder.parse(Segment::from_data(vec![0, 0, 0, 1, 0x26]));
        assert!(matches!(r.outcome, ParseOutcome::Dropped));

        // 在装配的图像未被波及, 下一首片正常输出
        let r = builder.parse(vcl_frag(19, true));
        assert!(matches!(r.outcome, ParseOutcome::Produced(_)));
    }

    #[test]
    fn test_畸形sps不中断解析() {
        let mut builder = AccessUnitBuilder::new();
        // 裁剪窗口超出图像尺寸的 SPS: 解码失败留空槽位, 不中断
        let r = builder.parse(frag(33, &build_sps_payload_cropped(0, Some((1000, 1000, 0, 0)))));
        assert!(matches!(r.outcome, ParseOutcome::Incomplete));
        assert!(builder.tables().sps(0).is_none());
        assert!(builder.props().is_none());

        // 随后的正常参数集照常生效
        feed_parameter_sets(&mut builder);
        assert!(builder.tables().is_sequence_resolvable());
    }

    #[test]
    fn test_收尾输出在装配图像() {
        let mut builder = AccessUnitBuilder::new();
        feed_parameter_sets(&mut builder);
        builder.parse(vcl_frag(19, true).with_ts(3000, 3000));
        let unit = builder.finish().expect("收尾应输出在装配的图像");
        assert_eq!(unit.pts, 3000);
        assert!(builder.finish().is_none());
    }
}
