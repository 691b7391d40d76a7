//! ウォッチポイント
//!
//! デバッグレジスタによるデータ監視点です。命令列は変更しません。

use crate::address::VirtAddr;
use crate::errors::DebugError;
use crate::registers::Registers;
use crate::stoppoint::{self, Stoppoint, StoppointId, StoppointMode};
use crate::Result;
use std::sync::atomic::{AtomicI32, Ordering};

static NEXT_WATCHPOINT_ID: AtomicI32 = AtomicI32::new(1);

fn next_watchpoint_id() -> StoppointId {
    NEXT_WATCHPOINT_ID.fetch_add(1, Ordering::Relaxed)
}

/// ウォッチポイント
///
/// アドレスはサイズ境界に揃っていること、サイズは8以下の2のべき乗で
/// あることをハードウェアが要求します。構築時に検査されます。
pub struct Watchpoint {
    id: StoppointId,
    address: VirtAddr,
    mode: StoppointMode,
    size: usize,
    is_enabled: bool,
    hardware_slot: i32,
    data: u64,
    previous_data: u64,
}

impl Watchpoint {
    pub(crate) fn new(address: VirtAddr, mode: StoppointMode, size: usize) -> Result<Self> {
        if !size.is_power_of_two() || size > 8 {
            return Err(DebugError::protocol(format!(
                "Invalid watchpoint size: {}",
                size
            )));
        }
        if address.addr() & (size as u64 - 1) != 0 {
            return Err(DebugError::protocol(format!(
                "Watchpoint address {} must be aligned to its size {}",
                address, size
            )));
        }

        Ok(Self {
            id: next_watchpoint_id(),
            address,
            mode,
            size,
            is_enabled: false,
            hardware_slot: -1,
            data: 0,
            previous_data: 0,
        })
    }

    pub fn mode(&self) -> StoppointMode {
        self.mode
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// 最後に観測した監視領域の値
    pub fn data(&self) -> u64 {
        self.data
    }

    /// 1つ前に観測した値。読み書き検出の表示に使う
    pub fn previous_data(&self) -> u64 {
        self.previous_data
    }

    pub fn hardware_slot(&self) -> i32 {
        self.hardware_slot
    }

    /// 停止時に監視領域を読み直して観測値を繰り上げる
    pub(crate) fn update_data(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(8);
        let mut buf = [0u8; 8];
        buf[..len].copy_from_slice(&bytes[..len]);
        self.previous_data = self.data;
        self.data = u64::from_le_bytes(buf);
    }
}

impl Stoppoint for Watchpoint {
    fn id(&self) -> StoppointId {
        self.id
    }

    fn address(&self) -> VirtAddr {
        self.address
    }

    fn byte_size(&self) -> usize {
        self.size
    }

    fn is_enabled(&self) -> bool {
        self.is_enabled
    }

    fn enable(&mut self, registers: &mut Registers) -> Result<()> {
        if self.is_enabled {
            return Ok(());
        }

        let slot =
            stoppoint::set_hardware_stoppoint(registers, self.address, self.mode, self.size)?;
        self.hardware_slot = slot as i32;
        self.is_enabled = true;
        Ok(())
    }

    fn disable(&mut self, registers: &mut Registers) -> Result<()> {
        if !self.is_enabled {
            return Ok(());
        }

        stoppoint::clear_hardware_stoppoint(registers, self.hardware_slot as usize)?;
        self.hardware_slot = -1;
        self.is_enabled = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_size() {
        assert!(Watchpoint::new(VirtAddr(0x1000), StoppointMode::Write, 3).is_err());
        assert!(Watchpoint::new(VirtAddr(0x1000), StoppointMode::Write, 16).is_err());
        assert!(Watchpoint::new(VirtAddr(0x1000), StoppointMode::Write, 0).is_err());
    }

    #[test]
    fn test_rejects_unaligned_address() {
        assert!(Watchpoint::new(VirtAddr(0x1001), StoppointMode::Write, 8).is_err());
        assert!(Watchpoint::new(VirtAddr(0x1004), StoppointMode::Write, 8).is_err());
        // サイズ1はどのアドレスでもよい
        assert!(Watchpoint::new(VirtAddr(0x1003), StoppointMode::ReadWrite, 1).is_ok());
    }

    #[test]
    fn test_data_window() {
        let mut point = Watchpoint::new(VirtAddr(0x1000), StoppointMode::Write, 8).unwrap();
        point.update_data(&0x11u64.to_le_bytes());
        point.update_data(&0x22u64.to_le_bytes());
        assert_eq!(point.previous_data(), 0x11);
        assert_eq!(point.data(), 0x22);
    }
}
