//! メモリアクセス機能

use crate::address::VirtAddr;
use crate::errors::DebugError;
use crate::Result;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;

/// メモリから読み取り可能な型
pub trait MemoryReadable: Sized {
    /// リトルエンディアンのバイト列から値を構築する
    fn from_le_bytes(bytes: &[u8]) -> Result<Self>;

    /// リトルエンディアンのバイト列に変換する
    fn to_le_bytes(&self) -> Vec<u8>;

    /// 型のサイズ（バイト数）
    fn size() -> usize;
}

macro_rules! memory_readable_uint {
    ($ty:ty, $bytes:expr) => {
        impl MemoryReadable for $ty {
            fn from_le_bytes(bytes: &[u8]) -> Result<Self> {
                let array: [u8; $bytes] = bytes.try_into().map_err(|_| {
                    DebugError::protocol(format!(
                        "Expected {} bytes for {}, got {}",
                        $bytes,
                        stringify!($ty),
                        bytes.len()
                    ))
                })?;
                Ok(<$ty>::from_le_bytes(array))
            }

            fn to_le_bytes(&self) -> Vec<u8> {
                <$ty>::to_le_bytes(*self).to_vec()
            }

            fn size() -> usize {
                $bytes
            }
        }
    };
}

memory_readable_uint!(u8, 1);
memory_readable_uint!(u16, 2);
memory_readable_uint!(u32, 4);
memory_readable_uint!(u64, 8);

/// デバッグ対象プロセスのメモリアクセス
pub struct Memory {
    pid: Pid,
}

impl Memory {
    pub(crate) fn new(pid: Pid) -> Self {
        Self { pid }
    }

    /// メモリからデータを読み取る
    ///
    /// `process_vm_readv`でページ境界ごとに分割して読み取ります。途中で
    /// 未マッピング領域に達した場合は、読めた分だけの短い結果を返します。
    pub fn read(&self, address: VirtAddr, amount: usize) -> Result<Vec<u8>> {
        if amount == 0 {
            return Ok(Vec::new());
        }

        let mut buffer = vec![0u8; amount];
        let local_iov = libc::iovec {
            iov_base: buffer.as_mut_ptr() as *mut libc::c_void,
            iov_len: buffer.len(),
        };

        // リモート側はページをまたがないように分割する
        let mut remote_iovs = Vec::new();
        let mut current = address;
        let mut remaining = amount;
        while remaining > 0 {
            let page_offset = (current.addr() & 0xfff) as usize;
            let chunk = remaining.min(0x1000 - page_offset);
            remote_iovs.push(libc::iovec {
                iov_base: current.as_ptr(),
                iov_len: chunk,
            });
            remaining -= chunk;
            current += chunk as u64;
        }

        let transferred = unsafe {
            libc::process_vm_readv(
                self.pid.as_raw(),
                &local_iov,
                1,
                remote_iovs.as_ptr(),
                remote_iovs.len() as libc::c_ulong,
                0,
            )
        };

        if transferred < 0 {
            return Err(DebugError::io(
                format!("Could not read process memory at {}", address),
                Errno::last(),
            ));
        }

        buffer.truncate(transferred as usize);
        Ok(buffer)
    }

    /// メモリにデータを書き込む
    ///
    /// 8バイトの窓ごとにPOKEDATAで書き込みます。端数はまず既存の
    /// ワードをPEEKDATAで読み、該当バイトだけ差し替えて書き戻します。
    pub fn write(&self, address: VirtAddr, data: &[u8]) -> Result<()> {
        let mut written = 0usize;

        while written < data.len() {
            let remaining = data.len() - written;
            let target = address + written as u64;

            let word = if remaining >= 8 {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&data[written..written + 8]);
                u64::from_le_bytes(buf)
            } else {
                let existing = ptrace::read(self.pid, target.as_ptr()).map_err(|e| {
                    DebugError::io(format!("Could not read memory at {}", target), e)
                })? as u64;
                let mut buf = existing.to_le_bytes();
                buf[..remaining].copy_from_slice(&data[written..]);
                u64::from_le_bytes(buf)
            };

            unsafe { ptrace::write(self.pid, target.as_ptr(), word as libc::c_long) }
                .map_err(|e| DebugError::io(format!("Could not write memory at {}", target), e))?;

            written += remaining.min(8);
        }

        Ok(())
    }

    /// 型付き値を読み取る
    pub fn read_typed<T: MemoryReadable>(&self, address: VirtAddr) -> Result<T> {
        let bytes = self.read(address, T::size())?;
        T::from_le_bytes(&bytes)
    }
}
