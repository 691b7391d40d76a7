//! デバッガのメインロジック
//!
//! フロントエンドが駆動するファサードです。ターゲットプロセスを所有し、
//! コマンド1つ分の操作をメソッド1つに対応させます。

use crate::disasm::{self, Instruction};
use crate::parse::parse_register_value;
use crate::Result;
use nix::sys::signal::Signal;
use sumire_target::process::{Process, ProcessState, StopReason};
use sumire_target::register_info::register_info_by_name;
use sumire_target::registers::RegisterValue;
use sumire_target::{Stoppoint, StoppointMode, VirtAddr};
use std::path::Path;

/// デバッガ
pub struct Debugger {
    /// デバッグ対象プロセス
    process: Process,
}

impl Debugger {
    /// 実行可能ファイルを起動してデバッグを開始する
    ///
    /// プロセスは最初の命令で停止した状態で返るため、実行前に
    /// ブレークポイントを設定できます。
    pub fn launch<P: AsRef<Path>>(program: P, args: &[String]) -> Result<Self> {
        let process = Process::launch(program, args, true, None)?;
        Ok(Self { process })
    }

    /// 既存のプロセスにアタッチする
    pub fn attach(pid: i32) -> Result<Self> {
        let process = Process::attach(pid)?;
        Ok(Self { process })
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    /// プロセスを実行継続して次の停止イベントまで待機する
    pub fn continue_and_wait(&mut self) -> Result<StopReason> {
        self.process.resume()?;
        Ok(self.process.wait_on_signal()?)
    }

    /// 1命令だけステップ実行する
    pub fn step(&mut self) -> Result<StopReason> {
        Ok(self.process.step_instruction()?)
    }

    /// ブレークポイントを作成して有効化し、IDを返す
    pub fn set_breakpoint(&mut self, address: u64, hardware: bool) -> Result<i32> {
        let id = self
            .process
            .create_breakpoint_site(VirtAddr(address), hardware, false)?
            .id();
        self.process.enable_breakpoint_site(id)?;
        Ok(id)
    }

    pub fn enable_breakpoint(&mut self, id: i32) -> Result<()> {
        Ok(self.process.enable_breakpoint_site(id)?)
    }

    pub fn disable_breakpoint(&mut self, id: i32) -> Result<()> {
        Ok(self.process.disable_breakpoint_site(id)?)
    }

    pub fn delete_breakpoint(&mut self, id: i32) -> Result<()> {
        Ok(self.process.remove_breakpoint_site(id)?)
    }

    /// ウォッチポイントを作成して有効化し、IDを返す
    pub fn set_watchpoint(&mut self, address: u64, mode: StoppointMode, size: usize) -> Result<i32> {
        let id = self
            .process
            .create_watchpoint(VirtAddr(address), mode, size)?
            .id();
        self.process.enable_watchpoint(id)?;
        Ok(id)
    }

    pub fn enable_watchpoint(&mut self, id: i32) -> Result<()> {
        Ok(self.process.enable_watchpoint(id)?)
    }

    pub fn disable_watchpoint(&mut self, id: i32) -> Result<()> {
        Ok(self.process.disable_watchpoint(id)?)
    }

    pub fn delete_watchpoint(&mut self, id: i32) -> Result<()> {
        Ok(self.process.remove_watchpoint(id)?)
    }

    /// 名前を指定してレジスタを読み取る
    pub fn read_register(&self, name: &str) -> Result<RegisterValue> {
        let info = register_info_by_name(name)?;
        Ok(self.process.registers().read(info)?)
    }

    /// 文字列値をレジスタのフォーマットに従ってパースして書き込む
    pub fn write_register(&mut self, name: &str, value: &str) -> Result<()> {
        let info = register_info_by_name(name)?;
        let value = parse_register_value(info, value)?;
        Ok(self.process.registers_mut().write(info, value)?)
    }

    /// トラップを隠したメモリ読み取り
    pub fn read_memory(&self, address: u64, bytes: usize) -> Result<Vec<u8>> {
        Ok(self
            .process
            .read_memory_without_traps(VirtAddr(address), bytes)?)
    }

    /// メモリへの書き込み
    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        Ok(self.process.write_memory(VirtAddr(address), data)?)
    }

    /// 命令を逆アセンブルする（アドレス省略時は現在のPCから）
    pub fn disassemble(&self, count: usize, address: Option<u64>) -> Result<Vec<Instruction>> {
        disasm::disassemble(&self.process, count, address.map(VirtAddr))
    }

    /// 停止理由を人間が読める形に整形する
    pub fn stop_description(&self, reason: StopReason) -> Result<String> {
        let message = match reason.reason {
            ProcessState::Exited => format!("exited with status {}", reason.info),
            ProcessState::Terminated => {
                format!("terminated with signal {}", signal_name(reason.info))
            }
            ProcessState::Stopped => format!(
                "stopped with signal {} at {}",
                signal_name(reason.info),
                self.process.pc()?
            ),
            ProcessState::Running => "running".to_string(),
        };
        Ok(message)
    }
}

/// シグナル番号を名前に変換する
fn signal_name(signo: u8) -> String {
    Signal::try_from(signo as i32)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {}", signo))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_name() {
        assert_eq!(signal_name(5), "SIGTRAP");
        assert_eq!(signal_name(9), "SIGKILL");
        assert_eq!(signal_name(200), "signal 200");
    }
}
