//! H.265/HEVC 参数集解码与缓存表.
//!
//! VPS/SPS/PPS 三级参数集按各自内嵌的小整数 id 存入定容表;
//! 同一 id 重复插入时先释放旧记录 (由 `Option` 的替换语义保证,
//! 不存在悬空引用). PPS→SPS→VPS 的交叉引用链可解析时, 序列方可
//! 被信任 (就绪检查).

use chuan_core::bitreader::BitReader;
use chuan_core::{ChuanError, ChuanResult, Rational};
use log::warn;

use crate::nal::{NalUnitType, remove_emulation_prevention};

/// VPS 表容量 (vps_id 为 4 位)
pub const VPS_ID_MAX: usize = 16;
/// SPS 表容量 (sps_id 语法上限 15)
pub const SPS_ID_MAX: usize = 16;
/// PPS 表容量 (pps_id 语法上限 63)
pub const PPS_ID_MAX: usize = 64;

/// VPS 解码结果
#[derive(Debug, Clone)]
pub struct Vps {
    /// VPS ID
    pub vps_id: u8,
    /// 最大子层数
    pub max_sub_layers: u8,
    /// general_profile_idc
    pub general_profile_idc: u8,
    /// general_tier_flag
    pub general_tier_flag: bool,
    /// general_level_idc
    pub general_level_idc: u8,
}

/// VUI 中的色彩描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColourDescription {
    /// colour_primaries
    pub primaries: u8,
    /// transfer_characteristics
    pub transfer: u8,
    /// matrix_coeffs
    pub matrix: u8,
}

/// SPS 解码结果
#[derive(Debug, Clone)]
pub struct Sps {
    /// SPS 所引用的 VPS ID
    pub vps_id: u8,
    /// SPS ID
    pub sps_id: u8,
    /// 最大子层数
    pub max_sub_layers: u8,
    /// general_profile_idc
    pub general_profile_idc: u8,
    /// general_tier_flag
    pub general_tier_flag: bool,
    /// general_level_idc
    pub general_level_idc: u8,
    /// 色度格式 (0=单色, 1=4:2:0, 2=4:2:2, 3=4:4:4)
    pub chroma_format_idc: u32,
    /// 亮度位深
    pub bit_depth_luma: u32,
    /// 图像宽度 (像素, 已应用 conformance window)
    pub width: u32,
    /// 图像高度 (像素, 已应用 conformance window)
    pub height: u32,
    /// 帧率 (如果 VUI 中有 timing_info)
    pub fps: Option<Rational>,
    /// SAR (Sample Aspect Ratio)
    pub sar: Rational,
    /// VUI 中的色彩描述 (如有)
    pub colour: Option<ColourDescription>,
}

/// PPS 解码结果
///
/// 只解码重组器需要的前部字段.
#[derive(Debug, Clone)]
pub struct Pps {
    /// PPS ID
    pub pps_id: u8,
    /// PPS 所引用的 SPS ID
    pub sps_id: u8,
    /// dependent_slice_segments_enabled_flag
    pub dependent_slice_segments: bool,
    /// output_flag_present_flag
    pub output_flag_present: bool,
    /// num_extra_slice_header_bits
    pub extra_slice_header_bits: u8,
}

/// Exp-Golomb 无符号解码
pub(crate) fn read_ue(br: &mut BitReader) -> ChuanResult<u32> {
    let mut leading_zeros = 0u32;
    loop {
        if br.read_bits(1)? == 1 {
            break;
        }
        leading_zeros += 1;
        if leading_zeros > 31 {
            return Err(ChuanError::InvalidData("HEVC: Exp-Golomb 过长".into()));
        }
    }
    if leading_zeros == 0 {
        return Ok(0);
    }
    let val = br.read_bits(leading_zeros)?;
    Ok((1 << leading_zeros) - 1 + val)
}

/// Exp-Golomb 有符号解码
pub(crate) fn read_se(br: &mut BitReader) -> ChuanResult<i32> {
    let code = read_ue(br)?;
    let val = code.div_ceil(2) as i32;
    if code % 2 == 0 { Ok(-val) } else { Ok(val) }
}

/// 解析 profile_tier_level
fn parse_profile_tier_level(br: &mut BitReader, max_sub_layers: u8) -> ChuanResult<(u8, bool, u8)> {
    let _profile_space = br.read_bits(2)?;
    let tier_flag = br.read_bits(1)? != 0;
    let profile_idc = br.read_bits(5)? as u8;

    // general_profile_compatibility_flags (32 bits)
    br.read_bits(32)?;
    // progressive + interlaced + non_packed + frame_only
    br.read_bits(4)?;
    // constraint flags (44 bits)
    br.read_bits(32)?;
    br.read_bits(12)?;

    let level_idc = br.read_bits(8)? as u8;

    // sub_layer flags
    if max_sub_layers > 1 {
        let mut sub_layer_profile_present = Vec::new();
        let mut sub_layer_level_present = Vec::new();
        for _ in 0..max_sub_layers - 1 {
            sub_layer_profile_present.push(br.read_bits(1)? != 0);
            sub_layer_level_present.push(br.read_bits(1)? != 0);
        }
        // 对齐到 16 的倍数
        if max_sub_layers < 9 {
            for _ in max_sub_layers - 1..8 {
                br.read_bits(2)?; // reserved
            }
        }
        for i in 0..max_sub_layers as usize - 1 {
            if sub_layer_profile_present[i] {
                br.read_bits(32)?; // sub_layer_profile_space..compatibility
                br.read_bits(32)?;
                br.read_bits(24)?;
            }
            if sub_layer_level_present[i] {
                br.read_bits(8)?;
            }
        }
    }

    Ok((profile_idc, tier_flag, level_idc))
}

/// 预定义 SAR 表 (ITU-T H.265 表 E.1)
const SAR_TABLE: [(u32, u32); 17] = [
    (0, 1),
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

/// 不经完整解码, 提取参数集的内嵌 id
///
/// VPS 的 id 为负载前 4 位; SPS 的 id 在 profile_tier_level 之后的
/// 首个 Exp-Golomb; PPS 的 id 为首个 Exp-Golomb.
/// `payload` 为去掉 2 字节 NAL 头的数据 (含 emulation prevention).
pub fn extract_id(nal_type: NalUnitType, payload: &[u8]) -> ChuanResult<u8> {
    if payload.is_empty() {
        return Err(ChuanError::InvalidData("HEVC: 参数集负载为空".into()));
    }
    let clean = remove_emulation_prevention(payload);
    let mut br = BitReader::new(&clean);
    match nal_type {
        NalUnitType::Vps => Ok((payload[0] >> 4) & 0x0F),
        NalUnitType::Sps => {
            let _vps_id = br.read_bits(4)?;
            let max_sub_layers = br.read_bits(3)? as u8 + 1;
            let _temporal_id_nesting = br.read_bits(1)?;
            parse_profile_tier_level(&mut br, max_sub_layers)?;
            let id = read_ue(&mut br)?;
            if id as usize >= SPS_ID_MAX {
                return Err(ChuanError::InvalidData(format!("HEVC: sps_id={id} 超出范围")));
            }
            Ok(id as u8)
        }
        NalUnitType::Pps => {
            let id = read_ue(&mut br)?;
            if id as usize >= PPS_ID_MAX {
                return Err(ChuanError::InvalidData(format!("HEVC: pps_id={id} 超出范围")));
            }
            Ok(id as u8)
        }
        _ => Err(ChuanError::InvalidArgument("非参数集 NAL 类型".into())),
    }
}

/// 解码 VPS
///
/// `payload` 为去掉 2 字节 NAL 头的数据.
pub fn parse_vps(payload: &[u8]) -> ChuanResult<Vps> {
    if payload.len() < 2 {
        return Err(ChuanError::InvalidData("HEVC: VPS RBSP 太短".into()));
    }

    let clean = remove_emulation_prevention(payload);
    let mut br = BitReader::new(&clean);

    let vps_id = br.read_bits(4)? as u8;
    br.read_bits(2)?; // vps_reserved_three_2bits
    let _max_layers = br.read_bits(6)? + 1;
    let max_sub_layers = br.read_bits(3)? as u8 + 1;
    let _temporal_id_nesting = br.read_bits(1)?;
    br.read_bits(16)?; // vps_reserved_0xffff_16bits

    let (profile_idc, tier_flag, level_idc) = parse_profile_tier_level(&mut br, max_sub_layers)?;

    Ok(Vps {
        vps_id,
        max_sub_layers,
        general_profile_idc: profile_idc,
        general_tier_flag: tier_flag,
        general_level_idc: level_idc,
    })
}

/// 解码 SPS
///
/// `payload` 为去掉 2 字节 NAL 头的数据.
pub fn parse_sps(payload: &[u8]) -> ChuanResult<Sps> {
    if payload.len() < 3 {
        return Err(ChuanError::InvalidData("HEVC: SPS RBSP 太短".into()));
    }

    let clean = remove_emulation_prevention(payload);
    let mut br = BitReader::new(&clean);

    let vps_id = br.read_bits(4)? as u8;
    let max_sub_layers = br.read_bits(3)? as u8 + 1;
    let _temporal_id_nesting = br.read_bits(1)?;

    let (profile_idc, tier_flag, level_idc) = parse_profile_tier_level(&mut br, max_sub_layers)?;

    let sps_id = read_ue(&mut br)?;
    if sps_id as usize >= SPS_ID_MAX {
        return Err(ChuanError::InvalidData(format!("HEVC: sps_id={sps_id} 超出范围")));
    }
    let chroma_format_idc = read_ue(&mut br)?;

    if chroma_format_idc == 3 {
        let _separate_colour_plane = br.read_bits(1)?;
    }

    let pic_width = read_ue(&mut br)?;
    let pic_height = read_ue(&mut br)?;

    let conformance_window = br.read_bits(1)? != 0;
    let (win_left, win_right, win_top, win_bottom) = if conformance_window {
        (
            read_ue(&mut br)?,
            read_ue(&mut br)?,
            read_ue(&mut br)?,
            read_ue(&mut br)?,
        )
    } else {
        (0, 0, 0, 0)
    };

    let bit_depth_luma_minus8 = read_ue(&mut br)?;
    if bit_depth_luma_minus8 > 8 {
        return Err(ChuanError::InvalidData(format!(
            "HEVC: bit_depth_luma_minus8={bit_depth_luma_minus8} 超出范围"
        )));
    }
    let bit_depth_luma = bit_depth_luma_minus8 + 8;
    read_ue(&mut br)?; // bit_depth_chroma_minus8
    let log2_max_poc_minus4 = read_ue(&mut br)?;
    if log2_max_poc_minus4 > 12 {
        return Err(ChuanError::InvalidData(format!(
            "HEVC: log2_max_pic_order_cnt_lsb_minus4={log2_max_poc_minus4} 超出范围"
        )));
    }
    let log2_max_poc = log2_max_poc_minus4 + 4;

    let sub_layer_ordering = br.read_bits(1)? != 0;
    let start = if sub_layer_ordering {
        0
    } else {
        max_sub_layers as u32 - 1
    };
    for _ in start..max_sub_layers as u32 {
        read_ue(&mut br)?; // max_dec_pic_buffering
        read_ue(&mut br)?; // max_num_reorder_pics
        read_ue(&mut br)?; // max_latency_increase
    }

    read_ue(&mut br)?; // log2_min_luma_coding_block_size_minus3
    read_ue(&mut br)?; // log2_diff_max_min_luma_coding_block_size
    read_ue(&mut br)?; // log2_min_luma_transform_block_size_minus2
    read_ue(&mut br)?; // log2_diff_max_min_luma_transform_block_size
    read_ue(&mut br)?; // max_transform_hierarchy_depth_inter
    read_ue(&mut br)?; // max_transform_hierarchy_depth_intra

    let scaling_list_enabled = br.read_bits(1)? != 0;
    if scaling_list_enabled {
        let scaling_list_data_present = br.read_bits(1)? != 0;
        if scaling_list_data_present {
            skip_scaling_list_data(&mut br)?;
        }
    }

    let _amp_enabled = br.read_bits(1)?;
    let _sao_enabled = br.read_bits(1)?;

    let pcm_enabled = br.read_bits(1)? != 0;
    if pcm_enabled {
        br.read_bits(4)?; // pcm_sample_bit_depth_luma
        br.read_bits(4)?; // pcm_sample_bit_depth_chroma
        read_ue(&mut br)?; // log2_min_pcm_luma
        read_ue(&mut br)?; // log2_diff_max_min_pcm_luma
        br.read_bits(1)?; // pcm_loop_filter_disabled
    }

    let num_short_term_rps = read_ue(&mut br)?;
    for i in 0..num_short_term_rps {
        skip_short_term_rps(&mut br, i, num_short_term_rps)?;
    }

    let long_term_ref_pics_present = br.read_bits(1)? != 0;
    if long_term_ref_pics_present {
        let num_long_term_ref_pics = read_ue(&mut br)?;
        for _ in 0..num_long_term_ref_pics {
            br.read_bits(log2_max_poc)?; // lt_ref_pic_poc_lsb
            br.read_bits(1)?; // used_by_curr_pic_lt
        }
    }

    let _temporal_mvp_enabled = br.read_bits(1)?;
    let _strong_intra_smoothing = br.read_bits(1)?;

    // VUI parameters
    let mut fps = None;
    let mut sar = Rational::new(1, 1);
    let mut colour = None;

    let vui_present = br.read_bits(1)? != 0;
    if vui_present {
        let aspect_ratio_info_present = br.read_bits(1)? != 0;
        if aspect_ratio_info_present {
            let aspect_ratio_idc = br.read_bits(8)? as usize;
            if aspect_ratio_idc == 255 {
                // Extended_SAR
                let sar_w = br.read_bits(16)?;
                let sar_h = br.read_bits(16)?;
                if sar_w > 0 && sar_h > 0 {
                    sar = Rational::new(sar_w as i32, sar_h as i32);
                }
            } else if aspect_ratio_idc < SAR_TABLE.len() {
                let (w, h) = SAR_TABLE[aspect_ratio_idc];
                if w > 0 && h > 0 {
                    sar = Rational::new(w as i32, h as i32);
                }
            }
        }

        let overscan_info_present = br.read_bits(1)? != 0;
        if overscan_info_present {
            br.read_bits(1)?; // overscan_appropriate
        }

        let video_signal_type_present = br.read_bits(1)? != 0;
        if video_signal_type_present {
            br.read_bits(3)?; // video_format
            br.read_bits(1)?; // video_full_range
            let colour_description_present = br.read_bits(1)? != 0;
            if colour_description_present {
                colour = Some(ColourDescription {
                    primaries: br.read_bits(8)? as u8,
                    transfer: br.read_bits(8)? as u8,
                    matrix: br.read_bits(8)? as u8,
                });
            }
        }

        let chroma_loc_info_present = br.read_bits(1)? != 0;
        if chroma_loc_info_present {
            read_ue(&mut br)?;
            read_ue(&mut br)?;
        }

        br.read_bits(1)?; // neutral_chroma_indication
        br.read_bits(1)?; // field_seq
        br.read_bits(1)?; // frame_field_info_present

        let default_display_window = br.read_bits(1)? != 0;
        if default_display_window {
            read_ue(&mut br)?;
            read_ue(&mut br)?;
            read_ue(&mut br)?;
            read_ue(&mut br)?;
        }

        let timing_info_present = br.read_bits(1)? != 0;
        if timing_info_present {
            let num_units_in_tick = br.read_bits(32)?;
            let time_scale = br.read_bits(32)?;
            if num_units_in_tick > 0 && time_scale > 0 {
                // HEVC: fps = time_scale / num_units_in_tick
                fps = Some(Rational::new(time_scale as i32, num_units_in_tick as i32));
            }
        }
    }

    // 计算裁剪后分辨率
    let sub_width_c: u32 = if chroma_format_idc == 1 || chroma_format_idc == 2 {
        2
    } else {
        1
    };
    let sub_height_c: u32 = if chroma_format_idc == 1 { 2 } else { 1 };

    // 窗口偏移为码流内值, 越界时拒绝而非回绕
    let width = win_left
        .checked_add(win_right)
        .and_then(|crop| crop.checked_mul(sub_width_c))
        .and_then(|crop| pic_width.checked_sub(crop))
        .ok_or_else(|| ChuanError::InvalidData("HEVC: SPS 裁剪窗口超出图像宽度".into()))?;
    let height = win_top
        .checked_add(win_bottom)
        .and_then(|crop| crop.checked_mul(sub_height_c))
        .and_then(|crop| pic_height.checked_sub(crop))
        .ok_or_else(|| ChuanError::InvalidData("HEVC: SPS 裁剪窗口超出图像高度".into()))?;

    Ok(Sps {
        vps_id,
        sps_id: sps_id as u8,
        max_sub_layers,
        general_profile_idc: profile_idc,
        general_tier_flag: tier_flag,
        general_level_idc: level_idc,
        chroma_format_idc,
        bit_depth_luma,
        width,
        height,
        fps,
        sar,
        colour,
    })
}

/// 解码 PPS 前部字段
///
/// `payload` 为去掉 2 字节 NAL 头的数据.
pub fn parse_pps(payload: &[u8]) -> ChuanResult<Pps> {
    if payload.is_empty() {
        return Err(ChuanError::InvalidData("HEVC: PPS RBSP 太短".into()));
    }

    let clean = remove_emulation_prevention(payload);
    let mut br = BitReader::new(&clean);

    let pps_id = read_ue(&mut br)?;
    if pps_id as usize >= PPS_ID_MAX {
        return Err(ChuanError::InvalidData(format!("HEVC: pps_id={pps_id} 超出范围")));
    }
    let sps_id = read_ue(&mut br)?;
    if sps_id as usize >= SPS_ID_MAX {
        return Err(ChuanError::InvalidData(format!("HEVC: pps 引用 sps_id={sps_id} 超出范围")));
    }
    let dependent_slice_segments = br.read_bits(1)? != 0;
    let output_flag_present = br.read_bits(1)? != 0;
    let extra_slice_header_bits = br.read_bits(3)? as u8;

    Ok(Pps {
        pps_id: pps_id as u8,
        sps_id: sps_id as u8,
        dependent_slice_segments,
        output_flag_present,
        extra_slice_header_bits,
    })
}

/// 跳过 scaling_list_data
fn skip_scaling_list_data(br: &mut BitReader) -> ChuanResult<()> {
    for size_id in 0..4 {
        let count = if size_id == 3 { 2 } else { 6 };
        for _ in 0..count {
            let pred_mode = br.read_bits(1)?;
            if pred_mode == 0 {
                read_ue(br)?; // scaling_list_pred_matrix_id_delta
            } else {
                let coef_num = (1 << (4 + (size_id << 1)).min(6)) as u32;
                if size_id > 1 {
                    read_se(br)?; // scaling_list_dc_coef
                }
                for _ in 0..coef_num {
                    read_se(br)?; // scaling_list_delta_coef
                }
            }
        }
    }
    Ok(())
}

/// 跳过 short_term_ref_pic_set
fn skip_short_term_rps(br: &mut BitReader, idx: u32, num_sets: u32) -> ChuanResult<()> {
    let inter_ref_pic_set_prediction = if idx > 0 {
        br.read_bits(1)? != 0
    } else {
        false
    };

    if inter_ref_pic_set_prediction {
        if idx == num_sets {
            read_ue(br)?; // delta_idx
        }
        br.read_bits(1)?; // delta_rps_sign
        read_ue(br)?; // abs_delta_rps
    // 完整解析需要维护前一 RPS 的状态, 这里按空集处理
    } else {
        let num_negative = read_ue(br)?;
        let num_positive = read_ue(br)?;
        for _ in 0..num_negative {
            read_ue(br)?; // delta_poc_s0
            br.read_bits(1)?; // used_by_curr_pic_s0
        }
        for _ in 0..num_positive {
            read_ue(br)?; // delta_poc_s1
            br.read_bits(1)?; // used_by_curr_pic_s1
        }
    }
    Ok(())
}

/// 三级参数集缓存表
///
/// 定容 `Option` 数组按 id 索引; 替换即释放旧记录.
/// 缓存的生命周期跨越不连续点 (reset 不清表), 直到会话结束.
pub struct ParamSetTables {
    vps: [Option<Vps>; VPS_ID_MAX],
    sps: [Option<Sps>; SPS_ID_MAX],
    pps: [Option<Pps>; PPS_ID_MAX],
}

impl Default for ParamSetTables {
    fn default() -> Self {
        Self {
            vps: std::array::from_fn(|_| None),
            sps: std::array::from_fn(|_| None),
            pps: std::array::from_fn(|_| None),
        }
    }
}

impl ParamSetTables {
    /// 创建空表
    pub fn new() -> Self {
        Self::default()
    }

    /// 在 id 槽位放入 VPS 记录 (None 表示清空槽位), 旧记录随即释放
    pub fn store_vps(&mut self, id: u8, vps: Option<Vps>) {
        match self.vps.get_mut(id as usize) {
            Some(slot) => *slot = vps,
            None => warn!("HEVC: vps_id={id} 超出表容量, 忽略"),
        }
    }

    /// 在 id 槽位放入 SPS 记录, 旧记录随即释放
    pub fn store_sps(&mut self, id: u8, sps: Option<Sps>) {
        match self.sps.get_mut(id as usize) {
            Some(slot) => *slot = sps,
            None => warn!("HEVC: sps_id={id} 超出表容量, 忽略"),
        }
    }

    /// 在 id 槽位放入 PPS 记录, 旧记录随即释放
    pub fn store_pps(&mut self, id: u8, pps: Option<Pps>) {
        match self.pps.get_mut(id as usize) {
            Some(slot) => *slot = pps,
            None => warn!("HEVC: pps_id={id} 超出表容量, 忽略"),
        }
    }

    /// 查询 VPS
    pub fn vps(&self, id: u8) -> Option<&Vps> {
        self.vps.get(id as usize)?.as_ref()
    }

    /// 查询 SPS
    pub fn sps(&self, id: u8) -> Option<&Sps> {
        self.sps.get(id as usize)?.as_ref()
    }

    /// 查询 PPS
    pub fn pps(&self, id: u8) -> Option<&Pps> {
        self.pps.get(id as usize)?.as_ref()
    }

    /// 就绪检查: 是否存在可解析的 PPS→SPS→VPS 引用链
    pub fn is_sequence_resolvable(&self) -> bool {
        self.pps.iter().flatten().any(|pps| {
            self.sps(pps.sps_id)
                .is_some_and(|sps| self.vps(sps.vps_id).is_some())
        })
    }

    /// 无条件清空三级表
    pub fn clear(&mut self) {
        self.vps = std::array::from_fn(|_| None);
        self.sps = std::array::from_fn(|_| None);
        self.pps = std::array::from_fn(|_| None);
    }
}
