//! HEVC 片头探测.
//!
//! 只解码片头最前部的几个语法元素: 首片标志、所引用的 PPS id 与
//! 片类型. 片类型决定重组帧上的预测标志; 探测失败时按 B 片处理
//! (最保守的标记).

use chuan_core::bitreader::BitReader;
use chuan_core::{ChuanError, ChuanResult};
use log::trace;

use crate::nal::{NalUnitType, remove_emulation_prevention};
use crate::paramset::{ParamSetTables, read_ue};

/// 片类型 (slice_type 语法元素)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    /// 双向预测片
    B,
    /// 前向预测片
    P,
    /// 帧内片
    I,
}

impl SliceType {
    fn from_syntax(value: u32) -> ChuanResult<Self> {
        match value {
            0 => Ok(SliceType::B),
            1 => Ok(SliceType::P),
            2 => Ok(SliceType::I),
            other => Err(ChuanError::InvalidData(format!(
                "HEVC: slice_type={other} 非法"
            ))),
        }
    }
}

/// 片头探测结果
#[derive(Debug, Clone, Copy)]
pub struct SliceInfo {
    /// first_slice_segment_in_pic_flag
    pub first_slice: bool,
    /// 所引用的 PPS id
    pub pps_id: u8,
    /// 片类型 (仅首个独立片段可探测; 失败回退为 B)
    pub slice_type: SliceType,
}

/// 快速读取 first_slice_segment_in_pic_flag
///
/// 负载首字节的最高位, 不受 emulation prevention 影响.
pub fn is_first_slice(payload: &[u8]) -> bool {
    payload.first().is_some_and(|b| b & 0x80 != 0)
}

/// 探测 VCL 片头前部
///
/// `payload` 为去掉 2 字节 NAL 头的数据 (含 emulation prevention).
/// 片类型的位置依赖 PPS 的 num_extra_slice_header_bits, 查不到
/// 所引用的 PPS 时探测失败.
pub fn probe_slice_header(
    nal_type: NalUnitType,
    payload: &[u8],
    tables: &ParamSetTables,
) -> ChuanResult<SliceInfo> {
    if payload.is_empty() {
        return Err(ChuanError::InvalidData("HEVC: 片头负载为空".into()));
    }

    // 片头很短, 只需前面少量字节
    let head = &payload[..payload.len().min(32)];
    let clean = remove_emulation_prevention(head);
    let mut br = BitReader::new(&clean);

    let first_slice = br.read_bits(1)? != 0;
    if nal_type.is_irap() {
        let _no_output_of_prior_pics = br.read_bits(1)?;
    }
    let pps_id = read_ue(&mut br)?;
    let pps_id = u8::try_from(pps_id)
        .map_err(|_| ChuanError::InvalidData(format!("HEVC: 片头 pps_id={pps_id} 超出范围")))?;

    if !first_slice {
        // 非首片段的 slice_type 位置依赖图像尺寸, 不在探测范围内
        return Ok(SliceInfo {
            first_slice,
            pps_id,
            slice_type: SliceType::B,
        });
    }

    let pps = tables.pps(pps_id).ok_or_else(|| {
        trace!("HEVC: 片头引用的 pps_id={pps_id} 未缓存");
        ChuanError::InvalidData(format!("HEVC: 片头引用的 pps_id={pps_id} 未缓存"))
    })?;

    br.skip_bits(pps.extra_slice_header_bits as u32)?;
    let slice_type = SliceType::from_syntax(read_ue(&mut br)?)?;

    Ok(SliceInfo {
        first_slice,
        pps_id,
        slice_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paramset::tests::{bits_to_bytes, build_pps_payload, push_bits, push_ue};
    use crate::paramset::parse_pps;

    /// 构建片头负载前部 (不含 NAL 头)
    fn build_slice_payload(
        first_slice: bool,
        irap: bool,
        pps_id: u32,
        extra_bits: u8,
        slice_type: u32,
    ) -> Vec<u8> {
        let mut bits = Vec::new();
        push_bits(&mut bits, first_slice as u32, 1);
        if irap {
            push_bits(&mut bits, 0, 1); // no_output_of_prior_pics_flag
        }
        push_ue(&mut bits, pps_id);
        push_bits(&mut bits, 0, extra_bits as u32);
        push_ue(&mut bits, slice_type);
        push_bits(&mut bits, 0xFF, 8); // 片头后续数据占位
        bits_to_bytes(&bits)
    }

    fn tables_with_pps(pps_id: u8) -> ParamSetTables {
        let mut tables = ParamSetTables::new();
        tables.store_pps(pps_id, parse_pps(&build_pps_payload(pps_id, 0)).ok());
        tables
    }

    #[test]
    fn test_探测非IRAP片头() {
        let tables = tables_with_pps(0);
        let payload = build_slice_payload(true, false, 0, 0, 1);
        let info = probe_slice_header(NalUnitType::TrailR, &payload, &tables).unwrap();
        assert!(info.first_slice);
        assert_eq!(info.pps_id, 0);
        assert_eq!(info.slice_type, SliceType::P);
    }

    #[test]
    fn test_探测IRAP片头() {
        let tables = tables_with_pps(0);
        let payload = build_slice_payload(true, true, 0, 0, 2);
        let info = probe_slice_header(NalUnitType::IdrWRadl, &payload, &tables).unwrap();
        assert_eq!(info.slice_type, SliceType::I);
    }

    #[test]
    fn test_非首片不探测类型() {
        let tables = tables_with_pps(0);
        let payload = build_slice_payload(false, false, 0, 0, 2);
        let info = probe_slice_header(NalUnitType::TrailR, &payload, &tables).unwrap();
        assert!(!info.first_slice);
        assert_eq!(info.slice_type, SliceType::B);
    }

    #[test]
    fn test_pps未缓存时失败() {
        let tables = ParamSetTables::new();
        let payload = build_slice_payload(true, false, 0, 0, 1);
        assert!(probe_slice_header(NalUnitType::TrailR, &payload, &tables).is_err());
    }

    #[test]
    fn test_is_first_slice() {
        assert!(is_first_slice(&[0x80]));
        assert!(!is_first_slice(&[0x7F]));
        assert!(!is_first_slice(&[]));
    }
}
