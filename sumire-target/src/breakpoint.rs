//! ブレークポイントサイト
//!
//! ソフトウェア方式（INT3命令の差し替え）とハードウェア方式
//! （デバッグレジスタの実行スロット）の両方を1つの型で扱います。

use crate::address::VirtAddr;
use crate::errors::DebugError;
use crate::registers::Registers;
use crate::stoppoint::{self, Stoppoint, StoppointId, StoppointMode};
use crate::Result;
use nix::sys::ptrace;
use nix::unistd::Pid;
use std::sync::atomic::{AtomicI32, Ordering};

/// INT3命令のオペコード
const INT3_OPCODE: u64 = 0xcc;

// プロセス全体で単調増加するID。内部サイトには割り当てない
static NEXT_SITE_ID: AtomicI32 = AtomicI32::new(1);

fn next_site_id() -> StoppointId {
    NEXT_SITE_ID.fetch_add(1, Ordering::Relaxed)
}

/// ブレークポイントサイト
///
/// 方式（ソフトウェア/ハードウェア）と内部フラグは構築時に決まり、
/// 以後変わりません。内部サイトはIDとして-1を受け取り、一覧表示から
/// 除外されます。
pub struct BreakpointSite {
    id: StoppointId,
    pid: Pid,
    address: VirtAddr,
    is_enabled: bool,
    is_hardware: bool,
    is_internal: bool,
    saved_byte: u8,
    hardware_slot: i32,
}

impl BreakpointSite {
    pub(crate) fn new(pid: Pid, address: VirtAddr, is_hardware: bool, is_internal: bool) -> Self {
        Self {
            id: if is_internal { -1 } else { next_site_id() },
            pid,
            address,
            is_enabled: false,
            is_hardware,
            is_internal,
            saved_byte: 0,
            hardware_slot: -1,
        }
    }

    pub fn is_hardware(&self) -> bool {
        self.is_hardware
    }

    pub fn is_internal(&self) -> bool {
        self.is_internal
    }

    /// INT3で上書きする前の元のバイト（ソフトウェア方式のみ意味を持つ）
    pub fn saved_byte(&self) -> u8 {
        self.saved_byte
    }

    /// 占有中のデバッグレジスタスロット。未使用時は-1
    pub fn hardware_slot(&self) -> i32 {
        self.hardware_slot
    }

    /// 命令列の先頭バイトを保存してINT3に差し替える
    fn enable_software(&mut self) -> Result<()> {
        let data = ptrace::read(self.pid, self.address.as_ptr())
            .map_err(|e| DebugError::io("Enabling breakpoint site failed", e))?
            as u64;
        self.saved_byte = (data & 0xff) as u8;

        let patched = (data & !0xff) | INT3_OPCODE;
        unsafe { ptrace::write(self.pid, self.address.as_ptr(), patched as libc::c_long) }
            .map_err(|e| DebugError::io("Enabling breakpoint site failed", e))?;
        Ok(())
    }

    /// 保存していた元のバイトを書き戻す
    fn disable_software(&mut self) -> Result<()> {
        let data = ptrace::read(self.pid, self.address.as_ptr())
            .map_err(|e| DebugError::io("Disabling breakpoint site failed", e))?
            as u64;

        let restored = (data & !0xff) | self.saved_byte as u64;
        unsafe { ptrace::write(self.pid, self.address.as_ptr(), restored as libc::c_long) }
            .map_err(|e| DebugError::io("Disabling breakpoint site failed", e))?;
        Ok(())
    }
}

impl Stoppoint for BreakpointSite {
    fn id(&self) -> StoppointId {
        self.id
    }

    fn address(&self) -> VirtAddr {
        self.address
    }

    fn byte_size(&self) -> usize {
        1
    }

    fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    fn enable(&mut self, registers: &mut Registers) -> Result<()> {
        if self.is_enabled {
            return Ok(());
        }

        if self.is_hardware {
            let slot = stoppoint::set_hardware_stoppoint(
                registers,
                self.address,
                StoppointMode::Execute,
                1,
            )?;
            self.hardware_slot = slot as i32;
        } else {
            self.enable_software()?;
        }

        self.is_enabled = true;
        Ok(())
    }

    fn disable(&mut self, registers: &mut Registers) -> Result<()> {
        if !self.is_enabled {
            return Ok(());
        }

        if self.is_hardware {
            stoppoint::clear_hardware_stoppoint(registers, self.hardware_slot as usize)?;
            self.hardware_slot = -1;
        } else {
            self.disable_software()?;
        }

        self.is_enabled = false;
        Ok(())
    }
}
