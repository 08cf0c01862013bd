//! H.265/HEVC NAL (Network Abstraction Layer) 单元识别与分类.
//!
//! HEVC NAL 头部为 2 字节:
//! - forbidden_zero_bit (1 bit)
//! - nal_unit_type (6 bits)
//! - nuh_layer_id (6 bits)
//! - nuh_temporal_id_plus1 (3 bits)
//!
//! 除类型识别外, 本模块还提供重组器的路由分类: 每个片段根据类型被
//! 归入 VCL (片数据)、访问单元头部 (参数集/AUD/前缀 SEI) 或尾部
//! (后缀 SEI/填充/EOS/EOB) 三类之一.

use chuan_core::{ChuanError, ChuanResult};

/// HEVC NAL 单元类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum NalUnitType {
    /// TRAIL_N (非参考尾随图像)
    TrailN,
    /// TRAIL_R (参考尾随图像)
    TrailR,
    /// TSA_N
    TsaN,
    /// TSA_R
    TsaR,
    /// STSA_N
    StsaN,
    /// STSA_R
    StsaR,
    /// RADL_N
    RadlN,
    /// RADL_R
    RadlR,
    /// RASL_N
    RaslN,
    /// RASL_R
    RaslR,
    /// BLA_W_LP (Broken Link Access)
    BlaWLp,
    /// BLA_W_RADL
    BlaWRadl,
    /// BLA_N_LP
    BlaNLp,
    /// IDR_W_RADL (Instantaneous Decoding Refresh)
    IdrWRadl,
    /// IDR_N_LP
    IdrNLp,
    /// CRA_NUT (Clean Random Access)
    Cra,
    /// VPS (Video Parameter Set)
    Vps,
    /// SPS (Sequence Parameter Set)
    Sps,
    /// PPS (Picture Parameter Set)
    Pps,
    /// AUD (Access Unit Delimiter)
    Aud,
    /// EOS (End of Sequence)
    Eos,
    /// EOB (End of Bitstream)
    Eob,
    /// FD (Filler Data)
    FillerData,
    /// PREFIX_SEI
    PrefixSei,
    /// SUFFIX_SEI
    SuffixSei,
    /// 保留或未指定类型
    Unknown(u8),
}

impl NalUnitType {
    /// 从类型编号创建
    pub fn from_type_id(id: u8) -> Self {
        match id {
            0 => Self::TrailN,
            1 => Self::TrailR,
            2 => Self::TsaN,
            3 => Self::TsaR,
            4 => Self::StsaN,
            5 => Self::StsaR,
            6 => Self::RadlN,
            7 => Self::RadlR,
            8 => Self::RaslN,
            9 => Self::RaslR,
            16 => Self::BlaWLp,
            17 => Self::BlaWRadl,
            18 => Self::BlaNLp,
            19 => Self::IdrWRadl,
            20 => Self::IdrNLp,
            21 => Self::Cra,
            32 => Self::Vps,
            33 => Self::Sps,
            34 => Self::Pps,
            35 => Self::Aud,
            36 => Self::Eos,
            37 => Self::Eob,
            38 => Self::FillerData,
            39 => Self::PrefixSei,
            40 => Self::SuffixSei,
            _ => Self::Unknown(id),
        }
    }

    /// 获取类型编号
    pub fn type_id(&self) -> u8 {
        match self {
            Self::TrailN => 0,
            Self::TrailR => 1,
            Self::TsaN => 2,
            Self::TsaR => 3,
            Self::StsaN => 4,
            Self::StsaR => 5,
            Self::RadlN => 6,
            Self::RadlR => 7,
            Self::RaslN => 8,
            Self::RaslR => 9,
            Self::BlaWLp => 16,
            Self::BlaWRadl => 17,
            Self::BlaNLp => 18,
            Self::IdrWRadl => 19,
            Self::IdrNLp => 20,
            Self::Cra => 21,
            Self::Vps => 32,
            Self::Sps => 33,
            Self::Pps => 34,
            Self::Aud => 35,
            Self::Eos => 36,
            Self::Eob => 37,
            Self::FillerData => 38,
            Self::PrefixSei => 39,
            Self::SuffixSei => 40,
            Self::Unknown(id) => *id,
        }
    }

    /// 是否为 VCL (Video Coding Layer) NAL
    pub fn is_vcl(&self) -> bool {
        self.type_id() < 32
    }

    /// 是否为 IRAP (Intra Random Access Point) NAL
    pub fn is_irap(&self) -> bool {
        matches!(self.type_id(), 16..=21)
    }

    /// 是否为 IDR NAL
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp)
    }
}

/// 重组器的片段路由分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalClass {
    /// 编码片数据, 进入帧队列
    Vcl,
    /// 图像前部数据 (参数集/AUD/前缀 SEI/保留前部范围), 进入前队列
    Head,
    /// 其余尾随数据 (后缀 SEI/填充/EOS/EOB/未指定范围), 进入后队列
    Tail,
}

/// 按 NAL 类型决定片段进入哪个队列
///
/// 前部范围: VPS/SPS/PPS/AUD (32..=35), 前缀 SEI (39), 以及
/// 保留的前部类 41..=44 与 48..=55.
pub fn classify(nal_type: NalUnitType) -> NalClass {
    let id = nal_type.type_id();
    if id < 32 {
        NalClass::Vcl
    } else if matches!(id, 32..=35 | 39 | 41..=44 | 48..=55) {
        NalClass::Head
    } else {
        NalClass::Tail
    }
}

/// 解析后的 2 字节 NAL 头
#[derive(Debug, Clone, Copy)]
pub struct NalHeader {
    /// NAL 类型
    pub nal_type: NalUnitType,
    /// nuh_layer_id
    pub layer_id: u8,
    /// nuh_temporal_id_plus1
    pub temporal_id_plus1: u8,
}

impl NalHeader {
    /// 从不含起始码的 NAL 数据解析头部
    ///
    /// forbidden_zero_bit 置位视为无效数据.
    pub fn parse(data: &[u8]) -> ChuanResult<Self> {
        if data.len() < 2 {
            return Err(ChuanError::InvalidData("HEVC: NAL 数据太短".into()));
        }
        if data[0] & 0x80 != 0 {
            return Err(ChuanError::InvalidData("HEVC: forbidden_zero_bit 置位".into()));
        }
        Ok(Self {
            nal_type: NalUnitType::from_type_id((data[0] >> 1) & 0x3F),
            layer_id: ((data[0] & 1) << 5) | (data[1] >> 3),
            temporal_id_plus1: data[1] & 0x07,
        })
    }
}

/// 识别片段开头的起始码, 返回其长度 (3 或 4)
///
/// 片段应以 `00 00 01` 或 `00 00 00 01` 开头; 否则说明扫描器失步.
pub fn startcode_len(data: &[u8]) -> Option<usize> {
    if data.len() >= 4 && data[..4] == [0, 0, 0, 1] {
        Some(4)
    } else if data.len() >= 3 && data[..3] == [0, 0, 1] {
        Some(3)
    } else {
        None
    }
}

/// 移除 emulation prevention 字节 (`00 00 03` → `00 00`)
pub fn remove_emulation_prevention(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if i + 2 < data.len() && data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 3 {
            out.push(0);
            out.push(0);
            i += 3; // 跳过 0x03
        } else {
            out.push(data[i]);
            i += 1;
        }
    }
    out
}

// ============================================================
// HEVCDecoderConfigurationRecord
// ============================================================

/// hvcC 配置记录中的参数集数据
pub struct HvccConfig {
    /// VPS NAL 列表 (含 2 字节头)
    pub vps_list: Vec<Vec<u8>>,
    /// SPS NAL 列表 (含 2 字节头)
    pub sps_list: Vec<Vec<u8>>,
    /// PPS NAL 列表 (含 2 字节头)
    pub pps_list: Vec<Vec<u8>>,
    /// NAL 长度前缀字节数 (1-4)
    pub length_size: u8,
}

/// 解析 HEVCDecoderConfigurationRecord
///
/// 仅提取重组器关心的字段: 三级参数集数组与长度前缀宽度.
pub fn parse_hvcc_config(data: &[u8]) -> ChuanResult<HvccConfig> {
    if data.len() < 23 {
        return Err(ChuanError::InvalidData("HEVC: hvcC 数据太短".into()));
    }

    // byte 21: constantFrameRate(2) | numTemporalLayers(3) | temporalIdNested(1) | lengthSizeMinusOne(2)
    let length_size = (data[21] & 0x03) + 1;
    let num_arrays = data[22];

    let mut vps_list = Vec::new();
    let mut sps_list = Vec::new();
    let mut pps_list = Vec::new();
    let mut pos = 23;

    for _ in 0..num_arrays {
        if pos >= data.len() {
            break;
        }
        let nal_type = data[pos] & 0x3F;
        pos += 1;
        if pos + 1 >= data.len() {
            break;
        }
        let num_nalus = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
        pos += 2;

        for _ in 0..num_nalus {
            if pos + 1 >= data.len() {
                break;
            }
            let nal_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
            pos += 2;
            if pos + nal_len > data.len() {
                break;
            }
            let nal_data = data[pos..pos + nal_len].to_vec();
            pos += nal_len;

            match nal_type {
                32 => vps_list.push(nal_data),
                33 => sps_list.push(nal_data),
                34 => pps_list.push(nal_data),
                _ => {}
            }
        }
    }

    Ok(HvccConfig {
        vps_list,
        sps_list,
        pps_list,
        length_size,
    })
}
