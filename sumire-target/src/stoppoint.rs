//! ストップポイント共通機構
//!
//! ブレークポイントとウォッチポイントに共通するコレクションと、
//! ハードウェアデバッグレジスタ（dr0〜dr3、制御レジスタdr7）の
//! スロット割り当てを提供します。

use crate::address::VirtAddr;
use crate::errors::DebugError;
use crate::register_info::{RegisterId, DEBUG_REGISTER_IDS};
use crate::registers::{RegisterValue, Registers};
use crate::Result;

/// ストップポイントID
pub type StoppointId = i32;

/// ハードウェアストップポイントの停止モード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoppointMode {
    /// 命令実行で停止
    Execute,
    /// 書き込みで停止
    Write,
    /// 読み書きで停止
    ReadWrite,
}

/// ブレークポイント・ウォッチポイント共通のインターフェース
pub trait Stoppoint {
    fn id(&self) -> StoppointId;
    fn address(&self) -> VirtAddr;
    /// 監視対象のバイト数（ソフトウェアブレークポイントは1）
    fn byte_size(&self) -> usize;
    fn is_enabled(&self) -> bool;
    fn enable(&mut self, registers: &mut Registers) -> Result<()>;
    fn disable(&mut self, registers: &mut Registers) -> Result<()>;

    /// アドレスが`[low, high)`に含まれるか
    fn in_range(&self, low: VirtAddr, high: VirtAddr) -> bool {
        low <= self.address() && self.address() < high
    }
}

fn ranges_overlap<T: Stoppoint>(a: &T, b: &T) -> bool {
    let a_end = a.address() + a.byte_size() as u64;
    let b_end = b.address() + b.byte_size() as u64;
    a.address() < b_end && b.address() < a_end
}

/// 挿入順を保持するストップポイントのコレクション
///
/// IDとアドレスの両方で検索できます。同じアドレス範囲を持つ要素は
/// 追加時に拒否されます。
pub struct StoppointCollection<T> {
    stoppoints: Vec<T>,
}

impl<T: Stoppoint> StoppointCollection<T> {
    pub fn new() -> Self {
        Self {
            stoppoints: Vec::new(),
        }
    }

    /// ストップポイントを追加して格納先への参照を返す
    ///
    /// 既存要素とアドレス範囲が重なる場合は追加せずエラーを返します。
    pub fn push(&mut self, stoppoint: T) -> Result<&mut T> {
        if self.stoppoints.iter().any(|s| ranges_overlap(s, &stoppoint)) {
            return Err(DebugError::protocol(format!(
                "Stoppoint already created at address {}",
                stoppoint.address()
            )));
        }
        let index = self.stoppoints.len();
        self.stoppoints.push(stoppoint);
        Ok(&mut self.stoppoints[index])
    }

    pub fn contains_id(&self, id: StoppointId) -> bool {
        self.stoppoints.iter().any(|s| s.id() == id)
    }

    pub fn contains_address(&self, address: VirtAddr) -> bool {
        self.stoppoints.iter().any(|s| s.address() == address)
    }

    pub fn get_by_id(&self, id: StoppointId) -> Option<&T> {
        self.stoppoints.iter().find(|s| s.id() == id)
    }

    pub fn get_by_id_mut(&mut self, id: StoppointId) -> Option<&mut T> {
        self.stoppoints.iter_mut().find(|s| s.id() == id)
    }

    pub fn get_by_address(&self, address: VirtAddr) -> Option<&T> {
        self.stoppoints.iter().find(|s| s.address() == address)
    }

    pub fn get_by_address_mut(&mut self, address: VirtAddr) -> Option<&mut T> {
        self.stoppoints.iter_mut().find(|s| s.address() == address)
    }

    /// アドレスが`[low, high)`に入る要素を挿入順に返す
    pub fn get_in_region(&self, low: VirtAddr, high: VirtAddr) -> impl Iterator<Item = &T> {
        self.stoppoints.iter().filter(move |s| s.in_range(low, high))
    }

    /// ストップポイントを無効化してから取り除く
    pub fn remove_by_id(&mut self, id: StoppointId, registers: &mut Registers) -> Result<()> {
        let index = self
            .stoppoints
            .iter()
            .position(|s| s.id() == id)
            .ok_or_else(|| DebugError::protocol(format!("No stoppoint with id {}", id)))?;
        self.stoppoints[index].disable(registers)?;
        self.stoppoints.remove(index);
        Ok(())
    }

    /// 挿入順に全要素を返す
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.stoppoints.iter()
    }

    pub fn len(&self) -> usize {
        self.stoppoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stoppoints.is_empty()
    }
}

impl<T: Stoppoint> Default for StoppointCollection<T> {
    fn default() -> Self {
        Self::new()
    }
}

// dr7のレイアウト: ビット0〜7がスロットごとの有効ビット（偶数ビットがローカル）、
// ビット16以降がスロットごとの条件2ビットとサイズ2ビット

fn encode_stoppoint_mode(mode: StoppointMode) -> u64 {
    match mode {
        StoppointMode::Execute => 0b00,
        StoppointMode::Write => 0b01,
        StoppointMode::ReadWrite => 0b11,
    }
}

/// サイズビットのエンコード
///
/// x86のエンコードは単調ではないため表引きで書く（00=1、01=2、11=4、10=8）。
fn encode_stoppoint_size(size: usize) -> Result<u64> {
    match size {
        1 => Ok(0b00),
        2 => Ok(0b01),
        4 => Ok(0b11),
        8 => Ok(0b10),
        _ => Err(DebugError::protocol(format!(
            "Invalid hardware stoppoint size: {}",
            size
        ))),
    }
}

/// dr7の有効ビットを見て最も小さい空きスロットを返す
fn find_free_stoppoint_register(control: u64) -> Result<usize> {
    for slot in 0..4 {
        if control & (0b11 << (slot * 2)) == 0 {
            return Ok(slot);
        }
    }
    Err(DebugError::ResourceExhausted)
}

/// dr0〜dr3の空きスロットを確保してハードウェアストップポイントを設定する
///
/// 確保したスロット番号（0〜3）を返します。デバッグレジスタへの書き込みは
/// すべて`Registers`の書き込み経路を通り、ローカルミラーとカーネルの同期を
/// 保ちます。
pub(crate) fn set_hardware_stoppoint(
    registers: &mut Registers,
    address: VirtAddr,
    mode: StoppointMode,
    size: usize,
) -> Result<usize> {
    let control = registers.read_by_id_as_u64(RegisterId::Dr7)?;
    let slot = find_free_stoppoint_register(control)?;

    let mode_flag = encode_stoppoint_mode(mode);
    let size_flag = encode_stoppoint_size(size)?;

    registers.write_by_id(
        DEBUG_REGISTER_IDS[slot],
        RegisterValue::U64(address.addr()),
    )?;

    let enable_bit = 1u64 << (slot * 2);
    let mode_bits = mode_flag << (slot * 4 + 16);
    let size_bits = size_flag << (slot * 4 + 18);
    let clear_mask = (0b11u64 << (slot * 2)) | (0b1111u64 << (slot * 4 + 16));

    let control = (control & !clear_mask) | enable_bit | mode_bits | size_bits;
    registers.write_by_id(RegisterId::Dr7, RegisterValue::U64(control))?;

    Ok(slot)
}

/// スロットのアドレスレジスタと制御ビットをゼロに戻す
pub(crate) fn clear_hardware_stoppoint(registers: &mut Registers, slot: usize) -> Result<()> {
    if slot >= 4 {
        return Err(DebugError::protocol(format!(
            "Invalid hardware stoppoint slot: {}",
            slot
        )));
    }

    registers.write_by_id(DEBUG_REGISTER_IDS[slot], RegisterValue::U64(0))?;

    let control = registers.read_by_id_as_u64(RegisterId::Dr7)?;
    let clear_mask = (0b11u64 << (slot * 2)) | (0b1111u64 << (slot * 4 + 16));
    registers.write_by_id(RegisterId::Dr7, RegisterValue::U64(control & !clear_mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    struct FakePoint {
        id: StoppointId,
        address: VirtAddr,
        size: usize,
        enabled: bool,
    }

    impl FakePoint {
        fn new(id: StoppointId, address: u64, size: usize) -> Self {
            Self {
                id,
                address: VirtAddr(address),
                size,
                enabled: false,
            }
        }
    }

    impl Stoppoint for FakePoint {
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
            self.enabled
        }
        fn enable(&mut self, _registers: &mut Registers) -> Result<()> {
            self.enabled = true;
            Ok(())
        }
        fn disable(&mut self, _registers: &mut Registers) -> Result<()> {
            self.enabled = false;
            Ok(())
        }
    }

    #[test]
    fn test_push_and_lookup() {
        let mut collection = StoppointCollection::new();
        collection.push(FakePoint::new(1, 0x1000, 1)).unwrap();
        collection.push(FakePoint::new(2, 0x2000, 8)).unwrap();

        assert!(collection.contains_id(1));
        assert!(collection.contains_address(VirtAddr(0x2000)));
        assert_eq!(collection.get_by_id(2).unwrap().address(), VirtAddr(0x2000));
        assert_eq!(collection.get_by_address(VirtAddr(0x1000)).unwrap().id(), 1);
        assert_eq!(collection.len(), 2);
    }

    #[test]
    fn test_push_rejects_overlap() {
        let mut collection = StoppointCollection::new();
        collection.push(FakePoint::new(1, 0x2000, 8)).unwrap();

        // 完全一致も部分重複も拒否される
        assert!(collection.push(FakePoint::new(2, 0x2000, 8)).is_err());
        assert!(collection.push(FakePoint::new(3, 0x2004, 8)).is_err());
        assert_eq!(collection.len(), 1);

        // 隣接は許容される
        collection.push(FakePoint::new(4, 0x2008, 8)).unwrap();
    }

    #[test]
    fn test_remove_disables_first() {
        let mut registers = Registers::new(Pid::from_raw(0));
        let mut collection = StoppointCollection::new();
        collection.push(FakePoint::new(1, 0x1000, 1)).unwrap();

        collection.remove_by_id(1, &mut registers).unwrap();
        assert!(collection.is_empty());
        assert!(collection.remove_by_id(1, &mut registers).is_err());
    }

    #[test]
    fn test_region_query() {
        let mut collection = StoppointCollection::new();
        collection.push(FakePoint::new(1, 0x1000, 1)).unwrap();
        collection.push(FakePoint::new(2, 0x1004, 1)).unwrap();
        collection.push(FakePoint::new(3, 0x2000, 1)).unwrap();

        let hits: Vec<_> = collection
            .get_in_region(VirtAddr(0x1000), VirtAddr(0x1008))
            .map(|s| s.id())
            .collect();
        assert_eq!(hits, vec![1, 2]);
    }

    #[test]
    fn test_size_encoding_table() {
        assert_eq!(encode_stoppoint_size(1).unwrap(), 0b00);
        assert_eq!(encode_stoppoint_size(2).unwrap(), 0b01);
        assert_eq!(encode_stoppoint_size(4).unwrap(), 0b11);
        assert_eq!(encode_stoppoint_size(8).unwrap(), 0b10);
        assert!(encode_stoppoint_size(3).is_err());
    }

    #[test]
    fn test_free_slot_search() {
        assert_eq!(find_free_stoppoint_register(0).unwrap(), 0);
        assert_eq!(find_free_stoppoint_register(0b01).unwrap(), 1);
        assert_eq!(find_free_stoppoint_register(0b0101).unwrap(), 2);
        assert_eq!(find_free_stoppoint_register(0b010101).unwrap(), 3);
        assert!(matches!(
            find_free_stoppoint_register(0b01010101),
            Err(DebugError::ResourceExhausted)
        ));
    }
}
