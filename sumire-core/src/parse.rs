//! パース関連のユーティリティ関数

use anyhow::Result;
use sumire_target::{RegisterFormat, RegisterInfo, RegisterValue};

/// アドレス文字列をu64にパース
///
/// 16進数（0xプレフィックス付き）または10進数をサポート
///
/// # Examples
/// ```
/// use sumire_core::parse::parse_address;
///
/// assert_eq!(parse_address("0x1234").unwrap(), 0x1234);
/// assert_eq!(parse_address("1234").unwrap(), 1234);
/// ```
pub fn parse_address(s: &str) -> Result<u64> {
    let s = s.trim();

    if s.starts_with("0x") || s.starts_with("0X") {
        // 16進数
        u64::from_str_radix(&s[2..], 16)
            .map_err(|e| anyhow::anyhow!("Invalid hexadecimal address '{}': {}", s, e))
    } else {
        // 10進数
        s.parse::<u64>()
            .map_err(|e| anyhow::anyhow!("Invalid address '{}': {}", s, e))
    }
}

/// バイト列の文字列表現をパース
///
/// `[0xaa,0xbb]`のような角括弧付きと、カンマ区切りの裸の16進数の
/// 両方を受け付けます。
pub fn parse_bytes(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    let s = s.strip_prefix('[').unwrap_or(s);
    let s = s.strip_suffix(']').unwrap_or(s);

    let mut bytes = Vec::new();
    for item in s.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let digits = item
            .strip_prefix("0x")
            .or_else(|| item.strip_prefix("0X"))
            .unwrap_or(item);
        let byte = u8::from_str_radix(digits, 16)
            .map_err(|e| anyhow::anyhow!("Invalid byte '{}': {}", item, e))?;
        bytes.push(byte);
    }

    if bytes.is_empty() {
        anyhow::bail!("Expected at least one byte");
    }
    Ok(bytes)
}

/// 幅チェック付きで符号なし整数をパース
fn parse_uint(s: &str, size: usize) -> Result<u64> {
    let value = parse_address(s)?;
    let max = match size {
        1 => u8::MAX as u64,
        2 => u16::MAX as u64,
        4 => u32::MAX as u64,
        _ => u64::MAX,
    };
    if value > max {
        anyhow::bail!("Value {:#x} does not fit in {} bytes", value, size);
    }
    Ok(value)
}

/// レジスタのフォーマットとサイズに従って文字列値をパース
///
/// 未対応の（フォーマット, サイズ）の組み合わせはエラーになります。
/// 拡張倍精度レジスタ（st0〜st7）は16バイトのベクタ表記で受け取ります。
pub fn parse_register_value(info: &RegisterInfo, text: &str) -> Result<RegisterValue> {
    let value = match (info.format, info.size) {
        (RegisterFormat::Uint, 1) => RegisterValue::U8(parse_uint(text, 1)? as u8),
        (RegisterFormat::Uint, 2) => RegisterValue::U16(parse_uint(text, 2)? as u16),
        (RegisterFormat::Uint, 4) => RegisterValue::U32(parse_uint(text, 4)? as u32),
        (RegisterFormat::Uint, 8) => RegisterValue::U64(parse_uint(text, 8)?),
        (RegisterFormat::DoubleFloat, 8) => RegisterValue::F64(
            text.parse::<f64>()
                .map_err(|e| anyhow::anyhow!("Invalid float '{}': {}", text, e))?,
        ),
        (RegisterFormat::LongDouble, 16) => {
            let bytes = parse_bytes(text)?;
            let blob: [u8; 16] = bytes.try_into().map_err(|v: Vec<u8>| {
                anyhow::anyhow!("Register {} expects 16 bytes, got {}", info.name, v.len())
            })?;
            RegisterValue::LongDouble(blob)
        }
        (RegisterFormat::Vector, 8) => {
            let bytes = parse_bytes(text)?;
            let blob: [u8; 8] = bytes.try_into().map_err(|v: Vec<u8>| {
                anyhow::anyhow!("Register {} expects 8 bytes, got {}", info.name, v.len())
            })?;
            RegisterValue::Byte64(blob)
        }
        (RegisterFormat::Vector, 16) => {
            let bytes = parse_bytes(text)?;
            let blob: [u8; 16] = bytes.try_into().map_err(|v: Vec<u8>| {
                anyhow::anyhow!("Register {} expects 16 bytes, got {}", info.name, v.len())
            })?;
            RegisterValue::Byte128(blob)
        }
        _ => anyhow::bail!(
            "Unsupported format/size combination for register {}",
            info.name
        ),
    };
    Ok(value)
}
