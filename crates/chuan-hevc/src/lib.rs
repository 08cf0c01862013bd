//! # chuan-hevc
//!
//! Chuan 码流重组引擎的 HEVC (H.265) 访问单元重组器.
//!
//! 把任意切分的 Annex-B 或长度前缀输入还原为一幅编码图像一个的
//! 访问单元: NAL 识别与三路分类、VPS/SPS/PPS 解码与缓存表、片头
//! 探测、三队列访问单元装配, 以及持有 ByteStream 与起始码扫描器的
//! 重组驱动.
//!
//! ## 使用示例
//!
//! ```rust
//! use chuan_core::Segment;
//! use chuan_hevc::{Framing, Packetizer};
//!
//! let mut pkt = Packetizer::new(Framing::AnnexB).unwrap();
//! // 未凑齐访问单元时不产出
//! let units = pkt.feed(Segment::from_data(vec![0x00, 0x00, 0x01]));
//! assert!(units.is_empty());
//! ```

pub mod builder;
pub mod driver;
pub mod nal;
pub mod paramset;
pub mod slice;

// 重导出常用类型
pub use builder::{AccessUnitBuilder, ParseOutcome, ParseResult, StreamProps};
pub use driver::{Framing, Packetizer};
pub use nal::{NalClass, NalHeader, NalUnitType};
pub use paramset::{ParamSetTables, Pps, Sps, Vps};
pub use slice::{SliceInfo, SliceType};
