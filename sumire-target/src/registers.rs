//! レジスタアクセス機能
//!
//! カーネルのレジスタダンプ（汎用・浮動小数点・デバッグ）をプロセスごとに
//! ミラーし、カタログ経由の型付き読み書きを提供します。書き込みはローカル
//! コピーの更新とカーネルへの反映を常に同時に行います。

use crate::errors::DebugError;
use crate::register_info::{
    register_info_by_id, RegisterFormat, RegisterId, RegisterInfo, RegisterType,
    DEBUG_REGISTER_IDS,
};
use crate::Result;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;
use std::ffi::c_void;
use std::mem;

/// レジスタ値
///
/// カタログの`format`と`size`が具体的なバリアントを選択します。
/// x87の拡張倍精度はユーザーエリア上の16バイトスロットをそのまま保持します。
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegisterValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    LongDouble([u8; 16]),
    Byte64([u8; 8]),
    Byte128([u8; 16]),
}

impl RegisterValue {
    /// 符号なし整数として取り出す（整数バリアント以外はNone）
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            RegisterValue::U8(v) => Some(v as u64),
            RegisterValue::U16(v) => Some(v as u64),
            RegisterValue::U32(v) => Some(v as u64),
            RegisterValue::U64(v) => Some(v),
            _ => None,
        }
    }

    /// リトルエンディアンの16バイトバッファに展開する（余りはゼロ詰め）
    fn to_le_bytes(self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        match self {
            RegisterValue::U8(v) => buf[0] = v,
            RegisterValue::U16(v) => buf[..2].copy_from_slice(&v.to_le_bytes()),
            RegisterValue::U32(v) => buf[..4].copy_from_slice(&v.to_le_bytes()),
            RegisterValue::U64(v) => buf[..8].copy_from_slice(&v.to_le_bytes()),
            RegisterValue::I8(v) => buf[0] = v as u8,
            RegisterValue::I16(v) => buf[..2].copy_from_slice(&v.to_le_bytes()),
            RegisterValue::I32(v) => buf[..4].copy_from_slice(&v.to_le_bytes()),
            RegisterValue::I64(v) => buf[..8].copy_from_slice(&v.to_le_bytes()),
            RegisterValue::F32(v) => buf[..4].copy_from_slice(&v.to_le_bytes()),
            RegisterValue::F64(v) => buf[..8].copy_from_slice(&v.to_le_bytes()),
            RegisterValue::LongDouble(v) => buf = v,
            RegisterValue::Byte64(v) => buf[..8].copy_from_slice(&v),
            RegisterValue::Byte128(v) => buf = v,
        }
        buf
    }
}

/// ローカルダンプから読み出したバイト列を、カタログに従って値へ広げる
fn widen(info: &RegisterInfo, bytes: &[u8]) -> Result<RegisterValue> {
    let value = match (info.format, info.size) {
        (RegisterFormat::Uint, 1) => RegisterValue::U8(bytes[0]),
        (RegisterFormat::Uint, 2) => {
            let mut b = [0u8; 2];
            b.copy_from_slice(&bytes[..2]);
            RegisterValue::U16(u16::from_le_bytes(b))
        }
        (RegisterFormat::Uint, 4) => {
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes[..4]);
            RegisterValue::U32(u32::from_le_bytes(b))
        }
        (RegisterFormat::Uint, 8) => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[..8]);
            RegisterValue::U64(u64::from_le_bytes(b))
        }
        (RegisterFormat::DoubleFloat, 8) => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[..8]);
            RegisterValue::F64(f64::from_le_bytes(b))
        }
        (RegisterFormat::LongDouble, 16) => {
            let mut b = [0u8; 16];
            b.copy_from_slice(&bytes[..16]);
            RegisterValue::LongDouble(b)
        }
        (RegisterFormat::Vector, 8) => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[..8]);
            RegisterValue::Byte64(b)
        }
        (RegisterFormat::Vector, 16) => {
            let mut b = [0u8; 16];
            b.copy_from_slice(&bytes[..16]);
            RegisterValue::Byte128(b)
        }
        _ => {
            return Err(DebugError::protocol(format!(
                "Unsupported format/size combination for register {}",
                info.name
            )))
        }
    };
    Ok(value)
}

/// カーネルレジスタダンプのプロセス内ミラー
///
/// ユーザーエリアと同一レイアウトの`libc::user`を保持し、カタログの
/// オフセットで直接アクセスします。停止のたびに`read_all`で更新されます。
pub struct Registers {
    pid: Pid,
    data: libc::user,
}

impl Registers {
    pub(crate) fn new(pid: Pid) -> Self {
        // 最初の停止でカーネルから読み込むまでのプレースホルダ
        let data = unsafe { mem::zeroed() };
        Self { pid, data }
    }

    /// カタログ情報を使って値を読み取る
    pub fn read(&self, info: &RegisterInfo) -> Result<RegisterValue> {
        widen(info, self.local_bytes(info.offset, info.size))
    }

    /// 識別子で値を読み取る
    pub fn read_by_id(&self, id: RegisterId) -> Result<RegisterValue> {
        self.read(register_info_by_id(id))
    }

    /// 符号なし整数レジスタをu64として読み取る
    pub fn read_by_id_as_u64(&self, id: RegisterId) -> Result<u64> {
        let info = register_info_by_id(id);
        self.read(info)?.as_u64().ok_or_else(|| {
            DebugError::protocol(format!("Register {} is not an unsigned integer", info.name))
        })
    }

    /// 値を書き込み、カーネルへ反映する
    ///
    /// 値は`info.size`バイトに狭めてローカルダンプへ書き込みます。反映は
    /// 汎用・デバッグレジスタなら8バイト境界に丸めた1ワードのPOKEUSER、
    /// 浮動小数点レジスタなら浮動小数点ダンプ全体のSETFPREGSです
    /// （カーネルは浮動小数点エリアのワード単位書き込みを受け付けません）。
    pub fn write(&mut self, info: &RegisterInfo, value: RegisterValue) -> Result<()> {
        self.write_local(info, value);
        self.flush(info)
    }

    /// 識別子で値を書き込む
    pub fn write_by_id(&mut self, id: RegisterId, value: RegisterValue) -> Result<()> {
        self.write(register_info_by_id(id), value)
    }

    /// カーネルからレジスタダンプ全体を読み直す
    ///
    /// 汎用レジスタはGETREGS、浮動小数点はGETFPREGSで一括取得します。
    /// デバッグレジスタには一括取得のptrace要求がないため、PEEKUSERで
    /// 1本ずつ読みます。途中で失敗した場合は更新全体をエラーにします。
    pub fn read_all(&mut self) -> Result<()> {
        self.data.regs = ptrace::getregs(self.pid)
            .map_err(|e| DebugError::io("Could not read GPR registers", e))?;

        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_GETFPREGS,
                self.pid.as_raw(),
                std::ptr::null_mut::<c_void>(),
                &mut self.data.i387 as *mut libc::user_fpregs_struct,
            )
        };
        if ret < 0 {
            return Err(DebugError::io("Could not read FPR registers", Errno::last()));
        }

        for (i, id) in DEBUG_REGISTER_IDS.iter().enumerate() {
            let info = register_info_by_id(*id);
            let word = ptrace::read_user(self.pid, info.offset as ptrace::AddressType)
                .map_err(|e| {
                    DebugError::io(format!("Could not read debug register {}", info.name), e)
                })?;
            self.data.u_debugreg[i] = word as libc::c_ulong;
        }

        Ok(())
    }

    /// ローカルダンプのみを更新する（カーネルへは反映しない）
    fn write_local(&mut self, info: &RegisterInfo, value: RegisterValue) {
        let bytes = value.to_le_bytes();
        self.local_bytes_mut(info.offset, info.size)
            .copy_from_slice(&bytes[..info.size]);
    }

    /// ローカルダンプの変更をカーネルへ反映する
    fn flush(&mut self, info: &RegisterInfo) -> Result<()> {
        if info.reg_type == RegisterType::Fpr {
            return self.flush_fpregs();
        }

        // 8バイト境界に揃っていない部分ビューも、ローカルダンプ上では
        // 既に合成済みなので、そのワードをそのまま書けばよい
        let aligned = info.offset & !7;
        let mut word = [0u8; 8];
        word.copy_from_slice(self.local_bytes(aligned, 8));
        let word = u64::from_le_bytes(word);

        unsafe {
            ptrace::write_user(
                self.pid,
                aligned as ptrace::AddressType,
                word as libc::c_long,
            )
        }
        .map_err(|e| DebugError::io(format!("Could not write register {}", info.name), e))
    }

    /// 浮動小数点ダンプ全体をカーネルへ書き戻す
    fn flush_fpregs(&mut self) -> Result<()> {
        let ret = unsafe {
            libc::ptrace(
                libc::PTRACE_SETFPREGS,
                self.pid.as_raw(),
                std::ptr::null_mut::<c_void>(),
                &self.data.i387 as *const libc::user_fpregs_struct,
            )
        };
        if ret < 0 {
            return Err(DebugError::io("Could not write FPR registers", Errno::last()));
        }
        Ok(())
    }

    fn local_bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= mem::size_of::<libc::user>());
        unsafe {
            std::slice::from_raw_parts(
                (&self.data as *const libc::user as *const u8).add(offset),
                len,
            )
        }
    }

    fn local_bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= mem::size_of::<libc::user>());
        unsafe {
            std::slice::from_raw_parts_mut(
                (&mut self.data as *mut libc::user as *mut u8).add(offset),
                len,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::register_info::register_info_by_name;

    fn registers() -> Registers {
        Registers::new(Pid::from_raw(0))
    }

    #[test]
    fn test_roundtrip_uint() {
        let mut regs = registers();
        for (name, value) in [
            ("rax", RegisterValue::U64(0x1122334455667788)),
            ("eax", RegisterValue::U32(0xdeadbeef)),
            ("fsw", RegisterValue::U16(0x0304)),
            ("al", RegisterValue::U8(0x7f)),
        ] {
            let info = register_info_by_name(name).unwrap();
            regs.write_local(info, value);
            assert_eq!(regs.read(info).unwrap(), value, "register {}", name);
        }
    }

    #[test]
    fn test_roundtrip_vector() {
        let mut regs = registers();
        let info = register_info_by_name("xmm0").unwrap();
        let value = RegisterValue::Byte128(*b"0123456789abcdef");
        regs.write_local(info, value);
        assert_eq!(regs.read(info).unwrap(), value);

        let info = register_info_by_name("mm3").unwrap();
        let value = RegisterValue::Byte64([1, 2, 3, 4, 5, 6, 7, 8]);
        regs.write_local(info, value);
        assert_eq!(regs.read(info).unwrap(), value);
    }

    #[test]
    fn test_narrowing_law() {
        // 書き込み値はレジスタ幅に狭められてから読み直される
        let mut regs = registers();
        let info = register_info_by_name("ax").unwrap();
        regs.write_local(info, RegisterValue::U64(0x11223344_5566cafe));
        assert_eq!(regs.read(info).unwrap(), RegisterValue::U16(0xcafe));
    }

    #[test]
    fn test_sub_register_views() {
        // 部分ビューは親レジスタと同じ格納領域を共有する
        let mut regs = registers();
        let rax = register_info_by_name("rax").unwrap();
        regs.write_local(rax, RegisterValue::U64(0x1122334455667788));

        assert_eq!(
            regs.read_by_id(RegisterId::Eax).unwrap(),
            RegisterValue::U32(0x55667788)
        );
        assert_eq!(regs.read_by_id(RegisterId::Al).unwrap(), RegisterValue::U8(0x88));
        assert_eq!(regs.read_by_id(RegisterId::Ah).unwrap(), RegisterValue::U8(0x77));
    }

    #[test]
    fn test_long_double_slot() {
        let mut regs = registers();
        let info = register_info_by_name("st0").unwrap();
        let mut blob = [0u8; 16];
        blob[..10].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        regs.write_local(info, RegisterValue::LongDouble(blob));
        assert_eq!(regs.read(info).unwrap(), RegisterValue::LongDouble(blob));
    }
}
