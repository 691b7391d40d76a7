//! レジスタカタログ
//!
//! デバッガが扱う全レジスタの静的な情報テーブルです。
//! 各レジスタの名前、識別子、DWARF番号、サイズ、`libc::user`構造体内の
//! バイトオフセット、種別、表示フォーマットを1か所で管理します。
//! レジスタI/Oはすべてこのテーブルを経由します。

use crate::errors::DebugError;
use crate::Result;
use memoffset::offset_of;
use once_cell::sync::Lazy;

/// レジスタの種別
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterType {
    /// 64ビット汎用レジスタ
    Gpr,
    /// 汎用レジスタの部分ビュー（32/16/8ビット）
    SubGpr,
    /// 浮動小数点レジスタ（x87/SSE）
    Fpr,
    /// デバッグレジスタ
    Dr,
}

/// レジスタ値の表示フォーマット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterFormat {
    /// 符号なし整数
    Uint,
    /// IEEE 754倍精度
    DoubleFloat,
    /// x87拡張倍精度（ユーザーエリア上は16バイトスロット）
    LongDouble,
    /// バイトベクタ
    Vector,
}

/// レジスタ識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::upper_case_acronyms)]
pub enum RegisterId {
    // 64ビット汎用レジスタ
    Rax, Rdx, Rcx, Rbx, Rsi, Rdi, Rbp, Rsp,
    R8, R9, R10, R11, R12, R13, R14, R15,
    Rip, Rflags, Cs, Ss, Ds, Es, Fs, Gs,
    FsBase, GsBase, OrigRax,
    // 32ビット部分ビュー
    Eax, Edx, Ecx, Ebx, Esi, Edi, Ebp, Esp,
    R8d, R9d, R10d, R11d, R12d, R13d, R14d, R15d,
    // 16ビット部分ビュー
    Ax, Dx, Cx, Bx, Si, Di, Bp, Sp,
    R8w, R9w, R10w, R11w, R12w, R13w, R14w, R15w,
    // 8ビット上位部分ビュー
    Ah, Dh, Ch, Bh,
    // 8ビット下位部分ビュー
    Al, Dl, Cl, Bl, Sil, Dil, Bpl, Spl,
    R8b, R9b, R10b, R11b, R12b, R13b, R14b, R15b,
    // 浮動小数点制御・状態レジスタ
    Fcw, Fsw, Ftw, Fop, Frip, Frdp, Mxcsr, Mxcsrmask,
    // x87スタックレジスタ
    St0, St1, St2, St3, St4, St5, St6, St7,
    // MMXエイリアス
    Mm0, Mm1, Mm2, Mm3, Mm4, Mm5, Mm6, Mm7,
    // XMMレジスタ
    Xmm0, Xmm1, Xmm2, Xmm3, Xmm4, Xmm5, Xmm6, Xmm7,
    Xmm8, Xmm9, Xmm10, Xmm11, Xmm12, Xmm13, Xmm14, Xmm15,
    // デバッグレジスタ
    Dr0, Dr1, Dr2, Dr3, Dr4, Dr5, Dr6, Dr7,
}

/// レジスタ記述子
///
/// `offset`は`PTRACE_PEEKUSER`/`PTRACE_POKEUSER`が参照する
/// `libc::user`構造体先頭からのバイトオフセットです。
#[derive(Debug, Clone)]
pub struct RegisterInfo {
    pub id: RegisterId,
    pub name: &'static str,
    /// DWARFレジスタ番号（System V x86-64 ABI）。割り当てがない場合は-1
    pub dwarf_id: i32,
    /// 値のサイズ（バイト数）
    pub size: usize,
    /// ユーザーエリア内のバイトオフセット
    pub offset: usize,
    pub reg_type: RegisterType,
    pub format: RegisterFormat,
}

/// デバッグレジスタdr0〜dr7の識別子（インデックス順）
pub const DEBUG_REGISTER_IDS: [RegisterId; 8] = [
    RegisterId::Dr0,
    RegisterId::Dr1,
    RegisterId::Dr2,
    RegisterId::Dr3,
    RegisterId::Dr4,
    RegisterId::Dr5,
    RegisterId::Dr6,
    RegisterId::Dr7,
];

macro_rules! gpr64 {
    ($id:ident, $field:ident, $dwarf:expr) => {
        gpr64!($id, $field, stringify!($field), $dwarf)
    };
    ($id:ident, $field:ident, $name:expr, $dwarf:expr) => {
        RegisterInfo {
            id: RegisterId::$id,
            name: $name,
            dwarf_id: $dwarf,
            size: 8,
            offset: offset_of!(libc::user, regs)
                + offset_of!(libc::user_regs_struct, $field),
            reg_type: RegisterType::Gpr,
            format: RegisterFormat::Uint,
        }
    };
}

macro_rules! sub_gpr {
    ($id:ident, $name:expr, $field:ident, $size:expr) => {
        sub_gpr!($id, $name, $field, $size, 0)
    };
    ($id:ident, $name:expr, $field:ident, $size:expr, $byte_offset:expr) => {
        RegisterInfo {
            id: RegisterId::$id,
            name: $name,
            dwarf_id: -1,
            size: $size,
            offset: offset_of!(libc::user, regs)
                + offset_of!(libc::user_regs_struct, $field)
                + $byte_offset,
            reg_type: RegisterType::SubGpr,
            format: RegisterFormat::Uint,
        }
    };
}

macro_rules! fpr {
    ($id:ident, $name:expr, $field:ident, $dwarf:expr, $size:expr) => {
        RegisterInfo {
            id: RegisterId::$id,
            name: $name,
            dwarf_id: $dwarf,
            size: $size,
            offset: offset_of!(libc::user, i387)
                + offset_of!(libc::user_fpregs_struct, $field),
            reg_type: RegisterType::Fpr,
            format: RegisterFormat::Uint,
        }
    };
}

// st0〜st7はst_space内の16バイトスロット、mm0〜mm7は同じスロットの下位8バイト
macro_rules! fp_st {
    ($id:ident, $n:tt) => {
        RegisterInfo {
            id: RegisterId::$id,
            name: concat!("st", stringify!($n)),
            dwarf_id: 33 + $n,
            size: 16,
            offset: offset_of!(libc::user, i387)
                + offset_of!(libc::user_fpregs_struct, st_space)
                + 16 * $n,
            reg_type: RegisterType::Fpr,
            format: RegisterFormat::LongDouble,
        }
    };
}

macro_rules! fp_mm {
    ($id:ident, $n:tt) => {
        RegisterInfo {
            id: RegisterId::$id,
            name: concat!("mm", stringify!($n)),
            dwarf_id: 41 + $n,
            size: 8,
            offset: offset_of!(libc::user, i387)
                + offset_of!(libc::user_fpregs_struct, st_space)
                + 16 * $n,
            reg_type: RegisterType::Fpr,
            format: RegisterFormat::Vector,
        }
    };
}

macro_rules! fp_xmm {
    ($id:ident, $n:tt) => {
        RegisterInfo {
            id: RegisterId::$id,
            name: concat!("xmm", stringify!($n)),
            dwarf_id: 17 + $n,
            size: 16,
            offset: offset_of!(libc::user, i387)
                + offset_of!(libc::user_fpregs_struct, xmm_space)
                + 16 * $n,
            reg_type: RegisterType::Fpr,
            format: RegisterFormat::Vector,
        }
    };
}

macro_rules! dreg {
    ($id:ident, $n:tt) => {
        RegisterInfo {
            id: RegisterId::$id,
            name: concat!("dr", stringify!($n)),
            dwarf_id: -1,
            size: 8,
            offset: offset_of!(libc::user, u_debugreg) + 8 * $n,
            reg_type: RegisterType::Dr,
            format: RegisterFormat::Uint,
        }
    };
}

/// 全レジスタの情報テーブル
///
/// `offset_of!`はstableのconst文脈で評価できないため、初回アクセス時に構築します。
pub static REGISTER_INFOS: Lazy<Vec<RegisterInfo>> = Lazy::new(|| {
    vec![
        // 64ビット汎用レジスタ
        gpr64!(Rax, rax, 0),
        gpr64!(Rdx, rdx, 1),
        gpr64!(Rcx, rcx, 2),
        gpr64!(Rbx, rbx, 3),
        gpr64!(Rsi, rsi, 4),
        gpr64!(Rdi, rdi, 5),
        gpr64!(Rbp, rbp, 6),
        gpr64!(Rsp, rsp, 7),
        gpr64!(R8, r8, 8),
        gpr64!(R9, r9, 9),
        gpr64!(R10, r10, 10),
        gpr64!(R11, r11, 11),
        gpr64!(R12, r12, 12),
        gpr64!(R13, r13, 13),
        gpr64!(R14, r14, 14),
        gpr64!(R15, r15, 15),
        gpr64!(Rip, rip, 16),
        gpr64!(Rflags, eflags, "rflags", 49),
        gpr64!(Cs, cs, 51),
        gpr64!(Ss, ss, 52),
        gpr64!(Ds, ds, 53),
        gpr64!(Es, es, 50),
        gpr64!(Fs, fs, 54),
        gpr64!(Gs, gs, 55),
        gpr64!(FsBase, fs_base, 58),
        gpr64!(GsBase, gs_base, 59),
        // ptraceがシステムコール番号の取得用に公開しているレジスタ。DWARF番号はない
        gpr64!(OrigRax, orig_rax, -1),
        // 32ビット部分ビュー
        sub_gpr!(Eax, "eax", rax, 4),
        sub_gpr!(Edx, "edx", rdx, 4),
        sub_gpr!(Ecx, "ecx", rcx, 4),
        sub_gpr!(Ebx, "ebx", rbx, 4),
        sub_gpr!(Esi, "esi", rsi, 4),
        sub_gpr!(Edi, "edi", rdi, 4),
        sub_gpr!(Ebp, "ebp", rbp, 4),
        sub_gpr!(Esp, "esp", rsp, 4),
        sub_gpr!(R8d, "r8d", r8, 4),
        sub_gpr!(R9d, "r9d", r9, 4),
        sub_gpr!(R10d, "r10d", r10, 4),
        sub_gpr!(R11d, "r11d", r11, 4),
        sub_gpr!(R12d, "r12d", r12, 4),
        sub_gpr!(R13d, "r13d", r13, 4),
        sub_gpr!(R14d, "r14d", r14, 4),
        sub_gpr!(R15d, "r15d", r15, 4),
        // 16ビット部分ビュー
        sub_gpr!(Ax, "ax", rax, 2),
        sub_gpr!(Dx, "dx", rdx, 2),
        sub_gpr!(Cx, "cx", rcx, 2),
        sub_gpr!(Bx, "bx", rbx, 2),
        sub_gpr!(Si, "si", rsi, 2),
        sub_gpr!(Di, "di", rdi, 2),
        sub_gpr!(Bp, "bp", rbp, 2),
        sub_gpr!(Sp, "sp", rsp, 2),
        sub_gpr!(R8w, "r8w", r8, 2),
        sub_gpr!(R9w, "r9w", r9, 2),
        sub_gpr!(R10w, "r10w", r10, 2),
        sub_gpr!(R11w, "r11w", r11, 2),
        sub_gpr!(R12w, "r12w", r12, 2),
        sub_gpr!(R13w, "r13w", r13, 2),
        sub_gpr!(R14w, "r14w", r14, 2),
        sub_gpr!(R15w, "r15w", r15, 2),
        // 8ビット上位部分ビュー（親レジスタのオフセット+1）
        sub_gpr!(Ah, "ah", rax, 1, 1),
        sub_gpr!(Dh, "dh", rdx, 1, 1),
        sub_gpr!(Ch, "ch", rcx, 1, 1),
        sub_gpr!(Bh, "bh", rbx, 1, 1),
        // 8ビット下位部分ビュー
        sub_gpr!(Al, "al", rax, 1),
        sub_gpr!(Dl, "dl", rdx, 1),
        sub_gpr!(Cl, "cl", rcx, 1),
        sub_gpr!(Bl, "bl", rbx, 1),
        sub_gpr!(Sil, "sil", rsi, 1),
        sub_gpr!(Dil, "dil", rdi, 1),
        sub_gpr!(Bpl, "bpl", rbp, 1),
        sub_gpr!(Spl, "spl", rsp, 1),
        sub_gpr!(R8b, "r8b", r8, 1),
        sub_gpr!(R9b, "r9b", r9, 1),
        sub_gpr!(R10b, "r10b", r10, 1),
        sub_gpr!(R11b, "r11b", r11, 1),
        sub_gpr!(R12b, "r12b", r12, 1),
        sub_gpr!(R13b, "r13b", r13, 1),
        sub_gpr!(R14b, "r14b", r14, 1),
        sub_gpr!(R15b, "r15b", r15, 1),
        // 浮動小数点制御・状態レジスタ
        fpr!(Fcw, "fcw", cwd, 65, 2),
        fpr!(Fsw, "fsw", swd, 66, 2),
        fpr!(Ftw, "ftw", ftw, -1, 2),
        fpr!(Fop, "fop", fop, -1, 2),
        fpr!(Frip, "frip", rip, -1, 8),
        fpr!(Frdp, "frdp", rdp, -1, 8),
        fpr!(Mxcsr, "mxcsr", mxcsr, 64, 4),
        fpr!(Mxcsrmask, "mxcsrmask", mxcr_mask, -1, 4),
        // x87スタックレジスタ
        fp_st!(St0, 0),
        fp_st!(St1, 1),
        fp_st!(St2, 2),
        fp_st!(St3, 3),
        fp_st!(St4, 4),
        fp_st!(St5, 5),
        fp_st!(St6, 6),
        fp_st!(St7, 7),
        // MMXエイリアス
        fp_mm!(Mm0, 0),
        fp_mm!(Mm1, 1),
        fp_mm!(Mm2, 2),
        fp_mm!(Mm3, 3),
        fp_mm!(Mm4, 4),
        fp_mm!(Mm5, 5),
        fp_mm!(Mm6, 6),
        fp_mm!(Mm7, 7),
        // XMMレジスタ
        fp_xmm!(Xmm0, 0),
        fp_xmm!(Xmm1, 1),
        fp_xmm!(Xmm2, 2),
        fp_xmm!(Xmm3, 3),
        fp_xmm!(Xmm4, 4),
        fp_xmm!(Xmm5, 5),
        fp_xmm!(Xmm6, 6),
        fp_xmm!(Xmm7, 7),
        fp_xmm!(Xmm8, 8),
        fp_xmm!(Xmm9, 9),
        fp_xmm!(Xmm10, 10),
        fp_xmm!(Xmm11, 11),
        fp_xmm!(Xmm12, 12),
        fp_xmm!(Xmm13, 13),
        fp_xmm!(Xmm14, 14),
        fp_xmm!(Xmm15, 15),
        // デバッグレジスタ
        dreg!(Dr0, 0),
        dreg!(Dr1, 1),
        dreg!(Dr2, 2),
        dreg!(Dr3, 3),
        dreg!(Dr4, 4),
        dreg!(Dr5, 5),
        dreg!(Dr6, 6),
        dreg!(Dr7, 7),
    ]
});

/// 識別子からレジスタ情報を取得する
///
/// テーブルは全識別子を網羅しているため必ず見つかります。
pub fn register_info_by_id(id: RegisterId) -> &'static RegisterInfo {
    REGISTER_INFOS
        .iter()
        .find(|info| info.id == id)
        .expect("register info table covers every RegisterId")
}

/// 名前からレジスタ情報を取得する
pub fn register_info_by_name(name: &str) -> Result<&'static RegisterInfo> {
    REGISTER_INFOS
        .iter()
        .find(|info| info.name == name)
        .ok_or_else(|| DebugError::protocol(format!("No such register: {}", name)))
}

/// DWARFレジスタ番号からレジスタ情報を取得する
pub fn register_info_by_dwarf(dwarf_id: i32) -> Result<&'static RegisterInfo> {
    REGISTER_INFOS
        .iter()
        .find(|info| info.dwarf_id == dwarf_id && dwarf_id >= 0)
        .ok_or_else(|| DebugError::protocol(format!("No register with DWARF id {}", dwarf_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name() {
        let info = register_info_by_name("rip").unwrap();
        assert_eq!(info.id, RegisterId::Rip);
        assert_eq!(info.size, 8);
        assert_eq!(info.dwarf_id, 16);

        assert!(register_info_by_name("zflags").is_err());
    }

    #[test]
    fn test_lookup_by_dwarf() {
        assert_eq!(register_info_by_dwarf(0).unwrap().id, RegisterId::Rax);
        assert_eq!(register_info_by_dwarf(17).unwrap().id, RegisterId::Xmm0);
        assert!(register_info_by_dwarf(-1).is_err());
    }

    #[test]
    fn test_sub_register_offsets() {
        // 部分ビューは親レジスタと同じ格納位置を指す
        let rax = register_info_by_id(RegisterId::Rax);
        let eax = register_info_by_id(RegisterId::Eax);
        let al = register_info_by_id(RegisterId::Al);
        let ah = register_info_by_id(RegisterId::Ah);
        assert_eq!(rax.offset, eax.offset);
        assert_eq!(rax.offset, al.offset);
        assert_eq!(rax.offset + 1, ah.offset);
        assert_eq!(eax.size, 4);
        assert_eq!(ah.size, 1);
    }

    #[test]
    fn test_debug_register_offsets() {
        let dr0 = register_info_by_id(RegisterId::Dr0);
        let dr7 = register_info_by_id(RegisterId::Dr7);
        assert_eq!(dr7.offset - dr0.offset, 56);
        assert_eq!(dr7.reg_type, RegisterType::Dr);
    }

    #[test]
    fn test_table_shape() {
        // st/mmは同じスロットを共有し、サイズだけが異なる
        let st0 = register_info_by_id(RegisterId::St0);
        let mm0 = register_info_by_id(RegisterId::Mm0);
        assert_eq!(st0.offset, mm0.offset);
        assert_eq!(st0.size, 16);
        assert_eq!(mm0.size, 8);
        assert_eq!(st0.format, RegisterFormat::LongDouble);

        let xmm_count = REGISTER_INFOS
            .iter()
            .filter(|i| i.name.starts_with("xmm"))
            .count();
        assert_eq!(xmm_count, 16);
    }
}
