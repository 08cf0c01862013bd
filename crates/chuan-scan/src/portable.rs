//! 可移植的字级起始码扫描.
//!
//! 利用 `(x - 0x01..01) & !x & 0x80..80` 可检测机器字内零字节的恒等式,
//! 一次排除 8 个不可能的起点; 含零字节的窗口退回逐字节验证.

const LO: u64 = 0x0101_0101_0101_0101;
const HI: u64 = 0x8080_8080_8080_8080;

/// 机器字内是否含零字节
#[inline]
fn has_zero_byte(w: u64) -> bool {
    w.wrapping_sub(LO) & !w & HI != 0
}

/// 查找 `00 00 01` 的首次出现, 返回首字节偏移
pub fn scan(data: &[u8]) -> Option<usize> {
    let n = data.len();
    if n < 3 {
        return None;
    }

    let mut i = 0usize;
    while i + 2 < n {
        if i + 8 <= n {
            let w = u64::from_ne_bytes(data[i..i + 8].try_into().expect("切片长度恒为 8"));
            if !has_zero_byte(w) {
                // 窗口内无零字节, 标记不可能在此 8 字节内起始
                i += 8;
                continue;
            }
        }
        let end = (i + 8).min(n - 2);
        while i < end {
            if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
                return Some(i);
            }
            i += 1;
        }
    }
    None
}
