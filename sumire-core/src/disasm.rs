//! 逆アセンブル機能
//!
//! Capstoneの薄いラッパーです。命令列の読み取りにはトラップ隠蔽読み取りを
//! 使い、有効なソフトウェアブレークポイントのINT3が出力に混ざらないように
//! します。

use crate::Result;
use capstone::prelude::*;
use sumire_target::process::Process;
use sumire_target::VirtAddr;

/// x86命令の最大長（バイト）
const MAX_INSTRUCTION_BYTES: usize = 15;

/// 逆アセンブル済みの1命令
#[derive(Debug, Clone)]
pub struct Instruction {
    pub address: VirtAddr,
    pub text: String,
}

/// バイト列を逆アセンブルする
///
/// # Arguments
/// * `code` - 命令のバイト列
/// * `base_addr` - 先頭バイトのアドレス
/// * `count` - デコードする最大命令数
pub fn disassemble_bytes(code: &[u8], base_addr: u64, count: usize) -> Result<Vec<Instruction>> {
    let cs = Capstone::new()
        .x86()
        .mode(arch::x86::ArchMode::Mode64)
        .syntax(arch::x86::ArchSyntax::Intel)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to create Capstone: {}", e))?;

    let insns = cs
        .disasm_count(code, base_addr, count)
        .map_err(|e| anyhow::anyhow!("Failed to disassemble: {}", e))?;

    let instructions = insns
        .iter()
        .map(|insn| Instruction {
            address: VirtAddr(insn.address()),
            text: match insn.op_str() {
                Some(ops) if !ops.is_empty() => {
                    format!("{} {}", insn.mnemonic().unwrap_or(""), ops)
                }
                _ => insn.mnemonic().unwrap_or("").to_string(),
            },
        })
        .collect();

    Ok(instructions)
}

/// デバッグ対象のメモリから命令を逆アセンブルする
///
/// アドレス省略時は現在のPCから読み取ります。
pub fn disassemble(
    process: &Process,
    count: usize,
    address: Option<VirtAddr>,
) -> Result<Vec<Instruction>> {
    let address = match address {
        Some(addr) => addr,
        None => process.pc()?,
    };

    let code = process.read_memory_without_traps(address, count * MAX_INSTRUCTION_BYTES)?;
    disassemble_bytes(&code, address.addr(), count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disassemble_simple_sequence() {
        // mov rax, 1; ret
        let code = vec![
            0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00, // mov rax, 1
            0xc3, // ret
        ];
        let instructions = disassemble_bytes(&code, 0x1000, 10).unwrap();
        assert_eq!(instructions.len(), 2);
        assert_eq!(instructions[0].address, VirtAddr(0x1000));
        assert!(instructions[0].text.starts_with("mov"));
        assert_eq!(instructions[1].address, VirtAddr(0x1007));
        assert_eq!(instructions[1].text, "ret");
    }

    #[test]
    fn test_disassemble_respects_count() {
        // nopの連続
        let code = vec![0x90; 16];
        let instructions = disassemble_bytes(&code, 0x2000, 4).unwrap();
        assert_eq!(instructions.len(), 4);
        assert_eq!(instructions[3].address, VirtAddr(0x2003));
    }
}
