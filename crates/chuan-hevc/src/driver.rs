//! 片段重组驱动 (Packetizer 前端).
//!
//! 持有 ByteStream 与访问单元重组器, 把任意切分的输入缓冲还原为
//! 起始码定界的片段序列. 两种封装收敛到同一 `parse` 入口:
//!
//! - Annex-B: 以 `find_marker` 跨段扫描 `00 00 01`, 起始码扫描器
//!   作为单段加速助手注入;
//! - 长度前缀: 按大端长度字段切片, 合成 `00 00 00 01` + 负载.
//!
//! 时间戳按段结转: 片段未被当前图像采用的时间戳保留给下一片段.

use byteorder::{BigEndian, ByteOrder};
use chuan_core::bytestream::{ByteStream, FastHelper};
use chuan_core::timestamp::NOPTS_VALUE;
use chuan_core::{AccessUnit, ChuanError, ChuanResult, Segment, SegmentFlags};
use chuan_scan::{STARTCODE, STARTCODE_4, StartcodeScanner, select};
use log::{debug, warn};

use crate::builder::{AccessUnitBuilder, MIN_FRAGMENT_LEN, ParseOutcome, StreamProps};
use crate::nal::{parse_hvcc_config, startcode_len};

/// 输入封装形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Annex-B 起始码定界
    AnnexB,
    /// 大端长度前缀定界 (hvcC 式), 前缀宽度 1-4 字节
    LengthPrefixed {
        /// 长度字段的字节数
        prefix_len: u8,
    },
}

/// HEVC 访问单元重组会话
///
/// 单线程调用: 一条逻辑输入流对应一个实例, 实例之间互不共享.
pub struct Packetizer {
    framing: Framing,
    stream: ByteStream,
    builder: AccessUnitBuilder,
    scanner: Box<dyn StartcodeScanner>,
    /// 游标是否已对齐到起始码首字节
    synced: bool,
    /// 下一次标记扫描的续扫偏移 (相对游标)
    scan_offset: usize,
    /// 结转中的时间戳 (尚未被任何图像采用)
    carried: (i64, i64),
}

impl Packetizer {
    /// 创建会话, 扫描器按 CPU 能力选择一次
    pub fn new(framing: Framing) -> ChuanResult<Self> {
        if let Framing::LengthPrefixed { prefix_len } = framing
            && !(1..=4).contains(&prefix_len)
        {
            return Err(ChuanError::InvalidArgument(format!(
                "长度前缀宽度 {prefix_len} 非法, 须为 1-4"
            )));
        }
        Ok(Self {
            framing,
            stream: ByteStream::new(),
            builder: AccessUnitBuilder::new(),
            scanner: select(),
            synced: false,
            scan_offset: 0,
            carried: (NOPTS_VALUE, NOPTS_VALUE),
        })
    }

    /// 当前封装形式
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// 输出属性 (首个 SPS 解码成功后可用)
    pub fn props(&self) -> Option<&StreamProps> {
        self.builder.props()
    }

    /// 喂入一个输入缓冲, 返回其间产出的全部访问单元
    pub fn feed(&mut self, segment: Segment) -> Vec<AccessUnit> {
        let mut out = Vec::new();

        if segment
            .flags
            .intersects(SegmentFlags::DISCONTINUITY | SegmentFlags::CORRUPTED)
        {
            self.reset(segment.flags.contains(SegmentFlags::DISCONTINUITY));
            if segment.flags.contains(SegmentFlags::CORRUPTED) {
                // 损坏缓冲整段丢弃
                return out;
            }
        }

        self.stream.push(segment);
        match self.framing {
            Framing::AnnexB => self.scan_annexb(&mut out),
            Framing::LengthPrefixed { prefix_len } => {
                self.slice_length_prefixed(prefix_len as usize, &mut out)
            }
        }
        out
    }

    /// Annex-B: 循环扫描标记, 切出 标记→下一标记 的片段
    fn scan_annexb(&mut self, out: &mut Vec<AccessUnit>) {
        if !self.synced {
            let scanner = &*self.scanner;
            let helper: FastHelper<'_> = &|hay| scanner.scan(hay);
            match self.stream.find_marker(self.scan_offset, &STARTCODE, Some(helper)) {
                Ok(pos) => {
                    if pos > 0 {
                        debug!("HEVC: 跳过起始码前的 {pos} 字节杂散数据");
                        let _ = self.stream.skip(pos);
                        self.stream.flush();
                    }
                    self.synced = true;
                    self.scan_offset = STARTCODE.len();
                }
                Err(resume) => {
                    self.scan_offset = resume;
                    return;
                }
            }
        }

        loop {
            let scanner = &*self.scanner;
            let helper: FastHelper<'_> = &|hay| scanner.scan(hay);
            let next = match self.stream.find_marker(self.scan_offset, &STARTCODE, Some(helper)) {
                Ok(next) => next,
                Err(resume) => {
                    // 续扫点不得侵入当前片段自己的起始码
                    self.scan_offset = resume.max(STARTCODE.len());
                    return;
                }
            };

            let (pts, dts) = self.stream.take_timestamp();
            let mut buf = vec![0u8; next];
            if self.stream.get(&mut buf).is_err() {
                return;
            }
            self.stream.flush();
            self.scan_offset = STARTCODE.len();

            // 剥除片段尾部的零填充, 保留最小有效长度
            while buf.len() > MIN_FRAGMENT_LEN && buf.last() == Some(&0) {
                buf.pop();
            }

            self.dispatch(buf, pts, dts, out);
        }
    }

    /// 长度前缀: 按完整记录切片, 合成 4 字节起始码片段
    fn slice_length_prefixed(&mut self, prefix_len: usize, out: &mut Vec<AccessUnit>) {
        loop {
            let mut prefix = [0u8; 4];
            if self.stream.wait(prefix_len).is_err() {
                return;
            }
            if self.stream.peek(&mut prefix[..prefix_len]).is_err() {
                return;
            }
            let len = BigEndian::read_uint(&prefix[..prefix_len], prefix_len) as usize;
            if self.stream.wait(prefix_len + len).is_err() {
                // 记录未到齐, 前缀留在流中等待续喂
                return;
            }

            let (pts, dts) = self.stream.take_timestamp();
            let _ = self.stream.skip(prefix_len);
            let mut data = Vec::with_capacity(STARTCODE_4.len() + len);
            data.extend_from_slice(&STARTCODE_4);
            data.resize(STARTCODE_4.len() + len, 0);
            if self.stream.get(&mut data[STARTCODE_4.len()..]).is_err() {
                return;
            }
            self.stream.flush();

            self.dispatch(data, pts, dts, out);
        }
    }

    /// 结转时间戳并把片段交给重组器
    fn dispatch(&mut self, data: Vec<u8>, pts: i64, dts: i64, out: &mut Vec<AccessUnit>) {
        if pts != NOPTS_VALUE || dts != NOPTS_VALUE {
            self.carried = (pts, dts);
        }
        let fragment = Segment::from_data(data).with_ts(self.carried.0, self.carried.1);
        let result = self.builder.parse(fragment);
        if result.ts_used {
            self.carried = (NOPTS_VALUE, NOPTS_VALUE);
        }
        if let ParseOutcome::Produced(unit) = result.outcome {
            out.push(unit);
        }
    }

    /// 带外头部数据: Annex-B 参数集串或 HEVCDecoderConfigurationRecord
    ///
    /// 在任何片段到来之前调用, 预灌参数集缓存. hvcC 记录还会采纳
    /// 其声明的长度前缀宽度.
    pub fn header(&mut self, data: &[u8]) -> ChuanResult<()> {
        if startcode_len(data).is_some() {
            self.header_annexb(data);
            return Ok(());
        }

        let cfg = parse_hvcc_config(data)?;
        if let Framing::LengthPrefixed { prefix_len } = &mut self.framing
            && *prefix_len != cfg.length_size
        {
            debug!("HEVC: 采纳 hvcC 声明的长度前缀宽度 {}", cfg.length_size);
            *prefix_len = cfg.length_size;
        }
        for nal in cfg
            .vps_list
            .iter()
            .chain(cfg.sps_list.iter())
            .chain(cfg.pps_list.iter())
        {
            let mut framed = Vec::with_capacity(STARTCODE_4.len() + nal.len());
            framed.extend_from_slice(&STARTCODE_4);
            framed.extend_from_slice(nal);
            let _ = self.builder.parse(Segment::from_data(framed));
        }
        Ok(())
    }

    /// 按起始码切分带外的 Annex-B 参数集串
    fn header_annexb(&mut self, data: &[u8]) {
        let Some(first) = self.scanner.scan(data) else {
            warn!("HEVC: 带外头部数据中无起始码, 忽略");
            return;
        };
        let mut start = first;
        loop {
            let next = self
                .scanner
                .scan(&data[start + STARTCODE.len()..])
                .map(|off| start + STARTCODE.len() + off);
            let end = next.unwrap_or(data.len());
            let _ = self
                .builder
                .parse(Segment::from_data(data[start..end].to_vec()));
            match next {
                Some(n) => start = n,
                None => break,
            }
        }
    }

    /// 不连续点: 丢弃未消费输入与在装配图像, 参数集缓存保留
    pub fn reset(&mut self, is_discontinuity: bool) {
        self.stream = ByteStream::new();
        self.synced = false;
        self.scan_offset = 0;
        self.carried = (NOPTS_VALUE, NOPTS_VALUE);
        self.builder.reset(is_discontinuity);
    }

    /// 会话收尾: 处理滞留的最后片段并输出在装配的图像
    pub fn close(&mut self) -> Vec<AccessUnit> {
        let mut out = Vec::new();

        if self.framing == Framing::AnnexB && self.synced {
            let n = self.stream.remaining();
            if n >= MIN_FRAGMENT_LEN {
                let (pts, dts) = self.stream.take_timestamp();
                let mut buf = vec![0u8; n];
                if self.stream.get(&mut buf).is_ok() {
                    while buf.len() > MIN_FRAGMENT_LEN && buf.last() == Some(&0) {
                        buf.pop();
                    }
                    self.dispatch(buf, pts, dts, &mut out);
                }
            }
        }

        if let Some(unit) = self.builder.finish() {
            out.push(unit);
        }
        self.builder.close();
        self.stream = ByteStream::new();
        self.synced = false;
        self.scan_offset = 0;
        self.carried = (NOPTS_VALUE, NOPTS_VALUE);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paramset::tests::{build_pps_payload, build_sps_payload, build_vps_payload};

    /// 以 3 字节起始码封装 NAL
    fn nal3(nal_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0, 0, 1];
        data.push(nal_type << 1);
        data.push(0x01);
        data.extend_from_slice(payload);
        data
    }

    fn vcl(nal_type: u8, first_slice: bool) -> Vec<u8> {
        let lead = if first_slice { 0xC0 } else { 0x40 };
        nal3(nal_type, &[lead, 0xFF, 0xFF, 0xFF])
    }

    /// 参数集 + 两幅关键图像 (各两片) 的完整 Annex-B 流
    fn annexb_stream() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend(nal3(32, &build_vps_payload(0)));
        data.extend(nal3(33, &build_sps_payload(0)));
        data.extend(nal3(34, &build_pps_payload(0, 0)));
        data.extend(vcl(19, true));
        data.extend(vcl(19, false));
        data.extend(vcl(19, true));
        data.extend(vcl(19, false));
        data
    }

    #[test]
    fn test_annexb_整流重组() {
        let mut pkt = Packetizer::new(Framing::AnnexB).unwrap();
        let mut units = pkt.feed(Segment::from_data(annexb_stream()).with_ts(9000, 9000));
        units.extend(pkt.close());

        assert_eq!(units.len(), 2);
        assert!(units[0].is_keyframe());
        assert_eq!(units[0].pts, 9000);
        // 第一单元含参数集与第一幅图像的两片
        let expected: Vec<u8> = {
            let mut v = Vec::new();
            v.extend(nal3(32, &build_vps_payload(0)));
            v.extend(nal3(33, &build_sps_payload(0)));
            v.extend(nal3(34, &build_pps_payload(0, 0)));
            v.extend(vcl(19, true));
            v.extend(vcl(19, false));
            v
        };
        assert_eq!(units[0].data.as_ref(), expected.as_slice());
        // 第二单元的时间戳未提供, 保持无效
        assert_eq!(units[1].pts, NOPTS_VALUE);
    }

    #[test]
    fn test_任意切分等价() {
        let stream = annexb_stream();
        let whole = {
            let mut pkt = Packetizer::new(Framing::AnnexB).unwrap();
            let mut units = pkt.feed(Segment::from_data(stream.clone()));
            units.extend(pkt.close());
            units
        };

        for cut in 1..stream.len() {
            let mut pkt = Packetizer::new(Framing::AnnexB).unwrap();
            let mut units = pkt.feed(Segment::from_data(stream[..cut].to_vec()));
            units.extend(pkt.feed(Segment::from_data(stream[cut..].to_vec())));
            units.extend(pkt.close());

            assert_eq!(units.len(), whole.len(), "cut={cut}");
            for (a, b) in units.iter().zip(&whole) {
                assert_eq!(a.data, b.data, "cut={cut}");
            }
        }
    }

    #[test]
    fn test_逐字节喂入() {
        let stream = annexb_stream();
        let mut pkt = Packetizer::new(Framing::AnnexB).unwrap();
        let mut units = Vec::new();
        for &b in &stream {
            units.extend(pkt.feed(Segment::from_data(vec![b])));
        }
        units.extend(pkt.close());
        assert_eq!(units.len(), 2);
    }

    #[test]
    fn test_起始码前杂散数据() {
        let mut data = vec![0xDE, 0xAD, 0xBE, 0xEF];
        data.extend(annexb_stream());
        let mut pkt = Packetizer::new(Framing::AnnexB).unwrap();
        let mut units = pkt.feed(Segment::from_data(data));
        units.extend(pkt.close());
        assert_eq!(units.len(), 2);
    }

    #[test]
    fn test_尾部零填充剥除() {
        let mut data = Vec::new();
        data.extend(nal3(32, &build_vps_payload(0)));
        data.extend(nal3(33, &build_sps_payload(0)));
        data.extend(nal3(34, &build_pps_payload(0, 0)));
        let mut slice = vcl(19, true);
        slice.extend_from_slice(&[0, 0, 0, 0]); // 零填充
        data.extend(&slice);
        data.extend(vcl(19, true)); // 触发第一单元输出

        let mut pkt = Packetizer::new(Framing::AnnexB).unwrap();
        let units = pkt.feed(Segment::from_data(data));
        assert_eq!(units.len(), 1);
        // 填充的零不进入访问单元 (扫描器会把紧邻下一起始码的
        // 两个零归入 00 00 01 之前, 其余由剥除处理)
        assert!(!units[0].data.ends_with(&[0x00]));
        assert!(units[0].data.ends_with(&[0xFF]));
    }

    #[test]
    fn test_长度前缀切片() {
        let mut data = Vec::new();
        for (t, payload) in [
            (32u8, build_vps_payload(0)),
            (33, build_sps_payload(0)),
            (34, build_pps_payload(0, 0)),
        ] {
            let mut nal = vec![t << 1, 0x01];
            nal.extend_from_slice(&payload);
            data.extend_from_slice(&(nal.len() as u32).to_be_bytes());
            data.extend_from_slice(&nal);
        }
        let slice_nal = [0x26, 0x01, 0xC0, 0xFF, 0xFF, 0xFF];
        data.extend_from_slice(&(slice_nal.len() as u32).to_be_bytes());
        data.extend_from_slice(&slice_nal);

        let mut pkt = Packetizer::new(Framing::LengthPrefixed { prefix_len: 4 }).unwrap();
        let mut units = pkt.feed(Segment::from_data(data.clone()).with_ts(6000, 3000));
        units.extend(pkt.close());

        assert_eq!(units.len(), 1);
        assert!(units[0].is_keyframe());
        assert_eq!(units[0].pts, 6000);
        assert_eq!(units[0].dts, 3000);
        // 合成片段以 4 字节起始码开头
        assert!(units[0].data.starts_with(&STARTCODE_4));

        // 切成两半喂入, 结果一致
        let mut pkt = Packetizer::new(Framing::LengthPrefixed { prefix_len: 4 }).unwrap();
        let mid = data.len() / 2;
        let mut split = pkt.feed(Segment::from_data(data[..mid].to_vec()).with_ts(6000, 3000));
        split.extend(pkt.feed(Segment::from_data(data[mid..].to_vec())));
        split.extend(pkt.close());
        assert_eq!(split.len(), 1);
        assert_eq!(split[0].data, units[0].data);
    }

    #[test]
    fn test_hvcc_头部预灌() {
        // 构造 hvcC: 声明 2 字节长度前缀 + 三级参数集
        let mut cfg = vec![0u8; 21];
        cfg[0] = 1;
        cfg.push(0x01); // byte 21: lengthSizeMinusOne = 1
        cfg.push(3); // numOfArrays
        for (t, payload) in [
            (32u8, build_vps_payload(0)),
            (33, build_sps_payload(0)),
            (34, build_pps_payload(0, 0)),
        ] {
            let mut nal = vec![t << 1, 0x01];
            nal.extend_from_slice(&payload);
            cfg.push(t);
            cfg.extend_from_slice(&1u16.to_be_bytes());
            cfg.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            cfg.extend_from_slice(&nal);
        }

        let mut pkt = Packetizer::new(Framing::LengthPrefixed { prefix_len: 4 }).unwrap();
        pkt.header(&cfg).unwrap();
        assert_eq!(pkt.framing(), Framing::LengthPrefixed { prefix_len: 2 });
        assert!(pkt.props().is_some());

        // 参数集已就位, 单独一幅关键图像即可产出
        let slice_nal = [0x26u8, 0x01, 0xC0, 0xFF, 0xFF, 0xFF];
        let mut data = (slice_nal.len() as u16).to_be_bytes().to_vec();
        data.extend_from_slice(&slice_nal);
        let mut units = pkt.feed(Segment::from_data(data));
        units.extend(pkt.close());
        assert_eq!(units.len(), 1);
        assert!(units[0].is_keyframe());
    }

    #[test]
    fn test_带外annexb头部() {
        let mut oob = Vec::new();
        oob.extend(nal3(32, &build_vps_payload(0)));
        oob.extend(nal3(33, &build_sps_payload(0)));
        oob.extend(nal3(34, &build_pps_payload(0, 0)));

        let mut pkt = Packetizer::new(Framing::AnnexB).unwrap();
        pkt.header(&oob).unwrap();
        assert!(pkt.props().is_some());
    }

    #[test]
    fn test_不连续缓冲() {
        let mut pkt = Packetizer::new(Framing::AnnexB).unwrap();
        let mut units = pkt.feed(Segment::from_data(annexb_stream()));
        units.extend(pkt.feed(
            Segment::from_data(annexb_stream()).with_flags(SegmentFlags::DISCONTINUITY),
        ));
        units.extend(pkt.close());
        // 第一条流在装配中的第二幅图像随不连续点丢弃;
        // 参数集缓存仍在, 第二条流立即恢复并产出两个单元
        assert_eq!(units.len(), 3);
    }

    #[test]
    fn test_非法前缀宽度() {
        assert!(Packetizer::new(Framing::LengthPrefixed { prefix_len: 0 }).is_err());
        assert!(Packetizer::new(Framing::LengthPrefixed { prefix_len: 5 }).is_err());
    }
}
