//! 仮想アドレス型

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

/// デバッグ対象プロセスの仮想アドレス空間上のアドレス
///
/// 生のu64と区別するためのnewtypeです。符号付きオフセットの加算と
/// 順序比較をサポートします。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub u64);

impl VirtAddr {
    /// アドレス値を取得する
    pub fn addr(&self) -> u64 {
        self.0
    }

    /// ptrace呼び出しに渡すポインタ表現
    pub(crate) fn as_ptr(&self) -> *mut std::ffi::c_void {
        self.0 as usize as *mut std::ffi::c_void
    }
}

impl From<u64> for VirtAddr {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}

impl Add<u64> for VirtAddr {
    type Output = VirtAddr;

    fn add(self, rhs: u64) -> VirtAddr {
        VirtAddr(self.0.wrapping_add(rhs))
    }
}

impl Add<i64> for VirtAddr {
    type Output = VirtAddr;

    fn add(self, rhs: i64) -> VirtAddr {
        VirtAddr(self.0.wrapping_add_signed(rhs))
    }
}

impl AddAssign<u64> for VirtAddr {
    fn add_assign(&mut self, rhs: u64) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u64> for VirtAddr {
    type Output = VirtAddr;

    fn sub(self, rhs: u64) -> VirtAddr {
        VirtAddr(self.0.wrapping_sub(rhs))
    }
}

impl Sub<VirtAddr> for VirtAddr {
    type Output = u64;

    fn sub(self, rhs: VirtAddr) -> u64 {
        self.0.wrapping_sub(rhs.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_offset() {
        let addr = VirtAddr(0x1000);
        assert_eq!(addr + 8i64, VirtAddr(0x1008));
        assert_eq!(addr + (-1i64), VirtAddr(0xfff));
    }

    #[test]
    fn test_ordering() {
        assert!(VirtAddr(0x1000) < VirtAddr(0x1001));
        assert_eq!(VirtAddr(0x2000) - VirtAddr(0x1000), 0x1000);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", VirtAddr(0xdeadbeef)), "0xdeadbeef");
    }
}
