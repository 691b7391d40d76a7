//! プロセス制御機能
//!
//! デバッグ対象プロセスの起動・アタッチ、停止・実行の状態遷移、
//! レジスタとメモリへの入出力、ストップポイントの管理を担います。

use crate::address::VirtAddr;
use crate::breakpoint::BreakpointSite;
use crate::errors::DebugError;
use crate::memory::{Memory, MemoryReadable};
use crate::register_info::{RegisterId, DEBUG_REGISTER_IDS};
use crate::registers::{RegisterValue, Registers};
use crate::stoppoint::{
    self, Stoppoint, StoppointCollection, StoppointId, StoppointMode,
};
use crate::watchpoint::Watchpoint;
use crate::Result;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{dup2, execv, fork, pipe2, ForkResult, Pid};
use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::io::Read as _;
use std::os::fd::OwnedFd;
use std::os::unix::io::RawFd;
use std::path::Path;
use tracing::debug;

/// プロセスの実行状態
///
/// `Exited`と`Terminated`は終端状態で、以後デバッグ対象への操作は
/// できません。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Stopped,
    Running,
    Exited,
    Terminated,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Running => "running",
            ProcessState::Exited => "exited",
            ProcessState::Terminated => "terminated",
        };
        write!(f, "{}", text)
    }
}

/// wait-statusから導出した停止理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopReason {
    /// 遷移後のプロセス状態
    pub reason: ProcessState,
    /// シグナル番号（stopped/terminated）または終了コード（exited）
    pub info: u8,
}

impl StopReason {
    fn from_wait_status(status: WaitStatus) -> Result<Self> {
        match status {
            WaitStatus::Exited(_, code) => Ok(Self {
                reason: ProcessState::Exited,
                info: code as u8,
            }),
            WaitStatus::Signaled(_, signal, _) => Ok(Self {
                reason: ProcessState::Terminated,
                info: signal as i32 as u8,
            }),
            WaitStatus::Stopped(_, signal) => Ok(Self {
                reason: ProcessState::Stopped,
                info: signal as i32 as u8,
            }),
            // このデバッガはptraceイベントを要求しない
            other => Err(DebugError::io(
                format!("Unexpected wait status: {:?}", other),
                Errno::UnknownErrno,
            )),
        }
    }
}

/// デバッグ対象のプロセス
///
/// レジスタミラーと両ストップポイントコレクションを所有します。
/// ドロップ時、デバッグ対象が生きていれば停止・デタッチし、自前で
/// 起動したものであれば終了させて回収します。
pub struct Process {
    pid: Pid,
    state: ProcessState,
    terminate_on_end: bool,
    is_attached: bool,
    registers: Registers,
    memory: Memory,
    breakpoint_sites: StoppointCollection<BreakpointSite>,
    watchpoints: StoppointCollection<Watchpoint>,
}

impl Process {
    /// 実行可能ファイルを起動してデバッグ対象プロセスを開始する
    ///
    /// forkした子プロセスでPTRACE_TRACEMEを設定し、execvで指定の
    /// バイナリを実行します。`debug`が真なら最初の停止を待ってから
    /// 返るため、呼び出し側はすぐにブレークポイントを設定できます。
    /// `stdout_replacement`を渡すと子プロセスの標準出力をその
    /// ディスクリプタへ差し替えます。
    ///
    /// 子プロセス側のセットアップ失敗はCLOEXECパイプで親へ転送され、
    /// `launch`自体のエラーとして返ります。
    pub fn launch<P: AsRef<Path>>(
        program: P,
        args: &[String],
        debug: bool,
        stdout_replacement: Option<RawFd>,
    ) -> Result<Self> {
        let program_path = program
            .as_ref()
            .to_str()
            .ok_or_else(|| DebugError::protocol("Invalid program path"))?;
        let program_cstring = CString::new(program_path)
            .map_err(|_| DebugError::protocol("Program path contains a NUL byte"))?;

        let mut cstring_args = vec![program_cstring.clone()];
        for arg in args {
            cstring_args.push(
                CString::new(arg.as_str())
                    .map_err(|_| DebugError::protocol("Argument contains a NUL byte"))?,
            );
        }

        // execvが成功すればパイプはCLOEXECで自動的に閉じ、親のreadは空で返る
        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| DebugError::io("Could not create launch pipe", e))?;

        match unsafe { fork() }.map_err(|e| DebugError::io("Fork failed", e))? {
            ForkResult::Parent { child } => {
                drop(write_fd);

                let mut message = String::new();
                File::from(read_fd)
                    .read_to_string(&mut message)
                    .map_err(|e| {
                        DebugError::io(
                            "Could not read launch pipe",
                            Errno::from_raw(e.raw_os_error().unwrap_or(0)),
                        )
                    })?;
                if !message.is_empty() {
                    let _ = waitpid(child, None);
                    return Err(parse_child_error(&message));
                }

                let attach_debug = debug;
                debug!(pid = child.as_raw(), attach_debug = %attach_debug, "launched inferior");

                let mut process = Self {
                    pid: child,
                    state: ProcessState::Running,
                    terminate_on_end: true,
                    is_attached: debug,
                    registers: Registers::new(child),
                    memory: Memory::new(child),
                    breakpoint_sites: StoppointCollection::new(),
                    watchpoints: StoppointCollection::new(),
                };

                if debug {
                    process.wait_on_signal()?;
                }

                Ok(process)
            }
            ForkResult::Child => {
                drop(read_fd);

                if let Some(fd) = stdout_replacement {
                    if dup2(fd, libc::STDOUT_FILENO).is_err() {
                        exit_with_error(&write_fd, "Could not replace stdout");
                    }
                }

                if debug && ptrace::traceme().is_err() {
                    exit_with_error(&write_fd, "Tracing failed");
                }

                // 成功すれば戻らない
                let _ = execv(&program_cstring, &cstring_args);
                exit_with_error(&write_fd, "Exec failed");
            }
        }
    }

    /// 既存のプロセスにアタッチする
    pub fn attach(pid: i32) -> Result<Self> {
        if pid <= 0 {
            return Err(DebugError::protocol("Invalid PID"));
        }

        let pid = Pid::from_raw(pid);
        ptrace::attach(pid)
            .map_err(|e| DebugError::io(format!("Could not attach to pid {}", pid), e))?;

        let mut process = Self {
            pid,
            state: ProcessState::Running,
            terminate_on_end: false,
            is_attached: true,
            registers: Registers::new(pid),
            memory: Memory::new(pid),
            breakpoint_sites: StoppointCollection::new(),
            watchpoints: StoppointCollection::new(),
        };
        process.wait_on_signal()?;

        debug!(pid = pid.as_raw(), "attached to inferior");
        Ok(process)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    pub fn breakpoint_sites(&self) -> &StoppointCollection<BreakpointSite> {
        &self.breakpoint_sites
    }

    pub fn watchpoints(&self) -> &StoppointCollection<Watchpoint> {
        &self.watchpoints
    }

    /// プログラムカウンタを読み取る
    pub fn pc(&self) -> Result<VirtAddr> {
        Ok(VirtAddr(self.registers.read_by_id_as_u64(RegisterId::Rip)?))
    }

    /// プログラムカウンタを書き換える
    pub fn set_pc(&mut self, address: VirtAddr) -> Result<()> {
        self.registers
            .write_by_id(RegisterId::Rip, RegisterValue::U64(address.addr()))
    }

    /// 実行を再開する
    ///
    /// 現在のPCに有効なソフトウェアブレークポイントがある場合は、一時的に
    /// 無効化して1命令だけ実行し、再度有効化してから継続します。
    pub fn resume(&mut self) -> Result<()> {
        self.expect_stopped("resume")?;

        let pc = self.pc()?;
        if let Some(site) = self.breakpoint_sites.get_by_address_mut(pc) {
            if site.is_enabled() && !site.is_hardware() {
                site.disable(&mut self.registers)?;
                ptrace::step(self.pid, None)
                    .map_err(|e| DebugError::io("Could not single step", e))?;
                waitpid(self.pid, None).map_err(|e| DebugError::io("waitpid failed", e))?;
                site.enable(&mut self.registers)?;
            }
        }

        ptrace::cont(self.pid, None).map_err(|e| DebugError::io("Could not resume", e))?;
        self.state = ProcessState::Running;
        debug!(pid = self.pid.as_raw(), "resumed inferior");
        Ok(())
    }

    /// 子プロセスの状態変化を待って停止理由を返す
    ///
    /// 停止時には全レジスタを読み直します。INT3による停止ではPCを
    /// ブレークポイントの位置まで戻し、ウォッチポイント起因の停止では
    /// 監視領域の観測値を更新します。
    pub fn wait_on_signal(&mut self) -> Result<StopReason> {
        let status =
            waitpid(self.pid, None).map_err(|e| DebugError::io("waitpid failed", e))?;
        let reason = StopReason::from_wait_status(status)?;
        self.state = reason.reason;
        debug!(
            pid = self.pid.as_raw(),
            state = %self.state,
            info = reason.info,
            "wait status decoded"
        );

        if self.is_attached && self.state == ProcessState::Stopped {
            self.registers.read_all()?;

            if reason.info == Signal::SIGTRAP as i32 as u8 {
                // INT3実行後はPCがブレークポイントの次を指すため1バイト戻す
                let instr_begin = self.pc()? + (-1i64);
                let hit_software_site = self
                    .breakpoint_sites
                    .get_by_address(instr_begin)
                    .map(|s| s.is_enabled() && !s.is_hardware())
                    .unwrap_or(false);
                if hit_software_site {
                    self.set_pc(instr_begin)?;
                }

                self.refresh_triggered_watchpoint()?;
            }
        }

        Ok(reason)
    }

    /// 1命令だけ実行する
    ///
    /// PC上の有効なソフトウェアブレークポイントはステップの間だけ
    /// 無効化されます。
    pub fn step_instruction(&mut self) -> Result<StopReason> {
        self.expect_stopped("step")?;

        let pc = self.pc()?;
        let mut reenable_id = None;
        if let Some(site) = self.breakpoint_sites.get_by_address_mut(pc) {
            if site.is_enabled() && !site.is_hardware() {
                site.disable(&mut self.registers)?;
                reenable_id = Some(site.id());
            }
        }

        ptrace::step(self.pid, None).map_err(|e| DebugError::io("Could not single step", e))?;
        self.state = ProcessState::Running;
        let reason = self.wait_on_signal()?;

        if let Some(id) = reenable_id {
            if self.state == ProcessState::Stopped {
                if let Some(site) = self.breakpoint_sites.get_by_id_mut(id) {
                    site.enable(&mut self.registers)?;
                }
            }
        }

        Ok(reason)
    }

    /// メモリを読み取る
    pub fn read_memory(&self, address: VirtAddr, amount: usize) -> Result<Vec<u8>> {
        self.expect_alive("read memory")?;
        self.memory.read(address, amount)
    }

    /// 有効なソフトウェアブレークポイントを隠してメモリを読み取る
    ///
    /// 範囲内のINT3を保存済みの元バイトへ置き換えて返します。
    /// 逆アセンブルは必ずこちらを使います。
    pub fn read_memory_without_traps(&self, address: VirtAddr, amount: usize) -> Result<Vec<u8>> {
        let mut data = self.read_memory(address, amount)?;
        let end = address + data.len() as u64;

        for site in self.breakpoint_sites.get_in_region(address, end) {
            if !site.is_enabled() || site.is_hardware() {
                continue;
            }
            let offset = (site.address() - address) as usize;
            data[offset] = site.saved_byte();
        }

        Ok(data)
    }

    /// 型付きの値としてメモリを読み取る
    pub fn read_memory_as<T: MemoryReadable>(&self, address: VirtAddr) -> Result<T> {
        self.expect_alive("read memory")?;
        self.memory.read_typed(address)
    }

    /// メモリにデータを書き込む
    pub fn write_memory(&mut self, address: VirtAddr, data: &[u8]) -> Result<()> {
        self.expect_alive("write memory")?;
        self.memory.write(address, data)
    }

    /// ブレークポイントサイトを作成する（有効化はしない）
    ///
    /// 同じアドレスに既存のサイトがある場合はエラーになります。
    pub fn create_breakpoint_site(
        &mut self,
        address: VirtAddr,
        hardware: bool,
        internal: bool,
    ) -> Result<&mut BreakpointSite> {
        self.expect_alive("create a breakpoint site")?;
        self.breakpoint_sites
            .push(BreakpointSite::new(self.pid, address, hardware, internal))
    }

    /// ウォッチポイントを作成する（有効化はしない）
    pub fn create_watchpoint(
        &mut self,
        address: VirtAddr,
        mode: StoppointMode,
        size: usize,
    ) -> Result<&mut Watchpoint> {
        self.expect_alive("create a watchpoint")?;
        self.watchpoints.push(Watchpoint::new(address, mode, size)?)
    }

    pub fn enable_breakpoint_site(&mut self, id: StoppointId) -> Result<()> {
        self.expect_alive("enable a breakpoint site")?;
        let site = self
            .breakpoint_sites
            .get_by_id_mut(id)
            .ok_or_else(|| DebugError::protocol(format!("No breakpoint site with id {}", id)))?;
        site.enable(&mut self.registers)
    }

    pub fn disable_breakpoint_site(&mut self, id: StoppointId) -> Result<()> {
        self.expect_alive("disable a breakpoint site")?;
        let site = self
            .breakpoint_sites
            .get_by_id_mut(id)
            .ok_or_else(|| DebugError::protocol(format!("No breakpoint site with id {}", id)))?;
        site.disable(&mut self.registers)
    }

    /// ブレークポイントサイトを無効化してから削除する
    pub fn remove_breakpoint_site(&mut self, id: StoppointId) -> Result<()> {
        self.expect_alive("delete a breakpoint site")?;
        self.breakpoint_sites.remove_by_id(id, &mut self.registers)
    }

    pub fn enable_watchpoint(&mut self, id: StoppointId) -> Result<()> {
        self.expect_alive("enable a watchpoint")?;
        let point = self
            .watchpoints
            .get_by_id_mut(id)
            .ok_or_else(|| DebugError::protocol(format!("No watchpoint with id {}", id)))?;
        point.enable(&mut self.registers)
    }

    pub fn disable_watchpoint(&mut self, id: StoppointId) -> Result<()> {
        self.expect_alive("disable a watchpoint")?;
        let point = self
            .watchpoints
            .get_by_id_mut(id)
            .ok_or_else(|| DebugError::protocol(format!("No watchpoint with id {}", id)))?;
        point.disable(&mut self.registers)
    }

    /// ウォッチポイントを無効化してから削除する
    pub fn remove_watchpoint(&mut self, id: StoppointId) -> Result<()> {
        self.expect_alive("delete a watchpoint")?;
        self.watchpoints.remove_by_id(id, &mut self.registers)
    }

    /// 実行・サイズ1のハードウェアブレークポイント用スロットを確保する
    ///
    /// 確保したスロット番号（0〜3）を返します。
    pub fn set_hardware_breakpoint(&mut self, address: VirtAddr) -> Result<usize> {
        self.expect_alive("set a hardware breakpoint")?;
        stoppoint::set_hardware_stoppoint(
            &mut self.registers,
            address,
            StoppointMode::Execute,
            1,
        )
    }

    /// 指定モード・サイズのウォッチポイント用スロットを確保する
    pub fn set_watchpoint(
        &mut self,
        address: VirtAddr,
        mode: StoppointMode,
        size: usize,
    ) -> Result<usize> {
        self.expect_alive("set a watchpoint")?;
        stoppoint::set_hardware_stoppoint(&mut self.registers, address, mode, size)
    }

    /// ハードウェアストップポイントのスロットを解放する
    pub fn clear_hardware_stoppoint(&mut self, index: usize) -> Result<()> {
        self.expect_alive("clear a hardware stoppoint")?;
        stoppoint::clear_hardware_stoppoint(&mut self.registers, index)
    }

    /// dr6が示す発火済みウォッチポイントの観測値を読み直す
    fn refresh_triggered_watchpoint(&mut self) -> Result<()> {
        if self.watchpoints.is_empty() {
            return Ok(());
        }

        let status = self.registers.read_by_id_as_u64(RegisterId::Dr6)?;
        let slot = (status & 0b1111).trailing_zeros() as usize;
        if slot >= 4 {
            return Ok(());
        }

        let address =
            VirtAddr(self.registers.read_by_id_as_u64(DEBUG_REGISTER_IDS[slot])?);
        if let Some(point) = self.watchpoints.get_by_address_mut(address) {
            let data = self.memory.read(address, point.byte_size())?;
            point.update_data(&data);
        }
        Ok(())
    }

    fn expect_stopped(&self, operation: &str) -> Result<()> {
        if self.state != ProcessState::Stopped {
            return Err(DebugError::state(format!(
                "Cannot {} while process is {}",
                operation, self.state
            )));
        }
        Ok(())
    }

    fn expect_alive(&self, operation: &str) -> Result<()> {
        if matches!(self.state, ProcessState::Exited | ProcessState::Terminated) {
            return Err(DebugError::state(format!(
                "Cannot {} after process has {}",
                operation, self.state
            )));
        }
        Ok(())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.pid.as_raw() == 0 {
            return;
        }

        // 生きていれば止めてから切り離す。自前で起動した場合は終了させて回収する
        if self.is_attached
            && !matches!(self.state, ProcessState::Exited | ProcessState::Terminated)
        {
            if self.state == ProcessState::Running {
                let _ = kill(self.pid, Signal::SIGSTOP);
                let _ = waitpid(self.pid, None);
            }
            let _ = ptrace::detach(self.pid, None);
            let _ = kill(self.pid, Signal::SIGCONT);
        }

        if self.terminate_on_end {
            let _ = kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

/// 子プロセス側でセットアップ失敗をパイプへ書いて終了する
fn exit_with_error(pipe: &OwnedFd, msg: &str) -> ! {
    let errno = Errno::last();
    let message = format!("{}:{}", errno as i32, msg);
    let _ = nix::unistd::write(pipe, message.as_bytes());
    std::process::exit(1);
}

/// パイプ経由で届いた"errno:message"を復元する
fn parse_child_error(message: &str) -> DebugError {
    match message.split_once(':') {
        Some((code, text)) => {
            let errno = code
                .parse::<i32>()
                .map(Errno::from_raw)
                .unwrap_or(Errno::UnknownErrno);
            DebugError::io(text.to_string(), errno)
        }
        None => DebugError::io(message.to_string(), Errno::UnknownErrno),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_reason_decoding() {
        let pid = Pid::from_raw(1);

        let exited = StopReason::from_wait_status(WaitStatus::Exited(pid, 3)).unwrap();
        assert_eq!(exited.reason, ProcessState::Exited);
        assert_eq!(exited.info, 3);

        let terminated =
            StopReason::from_wait_status(WaitStatus::Signaled(pid, Signal::SIGKILL, false))
                .unwrap();
        assert_eq!(terminated.reason, ProcessState::Terminated);
        assert_eq!(terminated.info, Signal::SIGKILL as i32 as u8);

        let stopped =
            StopReason::from_wait_status(WaitStatus::Stopped(pid, Signal::SIGTRAP)).unwrap();
        assert_eq!(stopped.reason, ProcessState::Stopped);
        assert_eq!(stopped.info, Signal::SIGTRAP as i32 as u8);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ProcessState::Stopped.to_string(), "stopped");
        assert_eq!(ProcessState::Exited.to_string(), "exited");
    }

    #[test]
    fn test_child_error_roundtrip() {
        let err = parse_child_error("2:Exec failed");
        match err {
            DebugError::Io { msg, errno } => {
                assert_eq!(msg, "Exec failed");
                assert_eq!(errno, Errno::ENOENT);
            }
            other => panic!("expected io error, got {:?}", other),
        }
    }
}
