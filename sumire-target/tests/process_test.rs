//! プロセス制御の統合テスト
//!
//! 実際の子プロセスを起動・アタッチして、状態遷移・レジスタI/O・
//! ストップポイント・メモリI/Oを検証します。

use std::fs::File;
use std::io::Read as _;
use std::os::fd::AsRawFd;
use std::process::{Command, Stdio};

use nix::sys::signal::Signal;
use sumire_target::process::{Process, ProcessState};
use sumire_target::register_info::{register_info_by_name, RegisterId};
use sumire_target::registers::RegisterValue;
use sumire_target::{DebugError, Stoppoint, StoppointMode, VirtAddr};

/// 長めに眠る子プロセスを停止状態で用意する
fn launch_sleep() -> Process {
    Process::launch("/bin/sleep", &["60".to_string()], true, None)
        .expect("failed to launch /bin/sleep")
}

#[test]
fn launch_stops_at_entry() {
    let process = launch_sleep();
    assert_eq!(process.state(), ProcessState::Stopped);
    assert!(process.pid().as_raw() > 0);
    assert_ne!(process.pc().unwrap(), VirtAddr(0));
}

#[test]
fn launch_reports_exec_failure() {
    let result = Process::launch("/no/such/binary", &[], true, None);
    match result {
        Err(DebugError::Io { msg, .. }) => assert_eq!(msg, "Exec failed"),
        other => panic!("expected io error from exec, got {:?}", other.map(|p| p.pid())),
    }
}

#[test]
fn resume_runs_to_exit() {
    let devnull = File::create("/dev/null").unwrap();
    let mut process = Process::launch(
        "/bin/echo",
        &["hello".to_string()],
        true,
        Some(devnull.as_raw_fd()),
    )
    .unwrap();

    process.resume().unwrap();
    let mut reason = process.wait_on_signal().unwrap();
    // 終了まで追加の停止は来ない想定だが、来ても流す
    while reason.reason == ProcessState::Stopped {
        process.resume().unwrap();
        reason = process.wait_on_signal().unwrap();
    }

    assert_eq!(reason.reason, ProcessState::Exited);
    assert_eq!(reason.info, 0);
    assert_eq!(process.state(), ProcessState::Exited);
}

#[test]
fn stdout_replacement_redirects_output() {
    let (read_fd, write_fd) = nix::unistd::pipe().unwrap();

    let mut process = Process::launch(
        "/bin/echo",
        &["sumire".to_string()],
        true,
        Some(write_fd.as_raw_fd()),
    )
    .unwrap();
    drop(write_fd);

    process.resume().unwrap();
    let mut reason = process.wait_on_signal().unwrap();
    while reason.reason == ProcessState::Stopped {
        process.resume().unwrap();
        reason = process.wait_on_signal().unwrap();
    }
    assert_eq!(reason.reason, ProcessState::Exited);

    let mut output = String::new();
    File::from(read_fd).read_to_string(&mut output).unwrap();
    assert_eq!(output, "sumire\n");
}

#[test]
fn attach_to_existing_process() {
    let mut child = Command::new("sleep")
        .arg("60")
        .stdout(Stdio::null())
        .spawn()
        .unwrap();

    {
        let process = Process::attach(child.id() as i32).unwrap();
        assert_eq!(process.state(), ProcessState::Stopped);
        assert_ne!(process.pc().unwrap(), VirtAddr(0));
        // ドロップでデタッチされ、子プロセスは走り続ける
    }

    child.kill().unwrap();
    child.wait().unwrap();
}

#[test]
fn attach_rejects_bad_pid() {
    assert!(matches!(Process::attach(0), Err(DebugError::Protocol(_))));
}

#[test]
fn register_write_reaches_kernel() {
    let mut process = launch_sleep();

    // 汎用レジスタ: POKEUSER経由
    let rsi = register_info_by_name("rsi").unwrap();
    process
        .registers_mut()
        .write(rsi, RegisterValue::U64(0xcafe_babe_dead_beef))
        .unwrap();

    // 浮動小数点レジスタ: SETFPREGS経由
    let xmm0 = register_info_by_name("xmm0").unwrap();
    let vector = RegisterValue::Byte128(3.14f64.to_le_bytes().repeat(2).try_into().unwrap());
    process.registers_mut().write(xmm0, vector).unwrap();

    let fsw = register_info_by_name("fsw").unwrap();
    process
        .registers_mut()
        .write(fsw, RegisterValue::U16(0x0304))
        .unwrap();

    // ローカルミラーを破棄してカーネルから読み直す
    process.registers_mut().read_all().unwrap();
    assert_eq!(
        process.registers().read(rsi).unwrap(),
        RegisterValue::U64(0xcafe_babe_dead_beef)
    );
    assert_eq!(process.registers().read(xmm0).unwrap(), vector);
    assert_eq!(
        process.registers().read(fsw).unwrap(),
        RegisterValue::U16(0x0304)
    );
}

#[test]
fn set_pc_round_trips() {
    let mut process = launch_sleep();
    process.set_pc(VirtAddr(0x1234)).unwrap();
    assert_eq!(process.pc().unwrap(), VirtAddr(0x1234));
    assert_eq!(
        process
            .registers()
            .read_by_id_as_u64(RegisterId::Rip)
            .unwrap(),
        0x1234
    );
}

#[test]
fn software_breakpoint_patches_and_restores_memory() {
    let mut process = launch_sleep();
    let pc = process.pc().unwrap();
    let before = process.read_memory(pc, 8).unwrap();

    let id = process.create_breakpoint_site(pc, false, false).unwrap().id();
    process.enable_breakpoint_site(id).unwrap();

    let patched = process.read_memory(pc, 8).unwrap();
    assert_eq!(patched[0], 0xcc);
    assert_eq!(patched[1..], before[1..]);

    // トラップ隠蔽読み取りは元の命令列を返す
    assert_eq!(process.read_memory_without_traps(pc, 8).unwrap(), before);

    // 無効化で元どおりのビット列に戻る
    process.disable_breakpoint_site(id).unwrap();
    assert_eq!(process.read_memory(pc, 8).unwrap(), before);
}

#[test]
fn trap_hiding_covers_multiple_sites() {
    let mut process = launch_sleep();
    let pc = process.pc().unwrap();
    let before = process.read_memory(pc, 16).unwrap();

    for offset in [0u64, 3, 7] {
        let id = process
            .create_breakpoint_site(pc + offset, false, false)
            .unwrap()
            .id();
        process.enable_breakpoint_site(id).unwrap();
    }

    let raw = process.read_memory(pc, 16).unwrap();
    assert_eq!(raw[0], 0xcc);
    assert_eq!(raw[3], 0xcc);
    assert_eq!(raw[7], 0xcc);
    assert_eq!(process.read_memory_without_traps(pc, 16).unwrap(), before);
}

#[test]
fn duplicate_breakpoint_site_is_rejected() {
    let mut process = launch_sleep();
    let pc = process.pc().unwrap();

    process.create_breakpoint_site(pc, false, false).unwrap();
    assert!(matches!(
        process.create_breakpoint_site(pc, false, false),
        Err(DebugError::Protocol(_))
    ));
    assert_eq!(process.breakpoint_sites().len(), 1);
}

#[test]
fn internal_sites_are_reserved() {
    let mut process = launch_sleep();
    let pc = process.pc().unwrap();
    let site = process.create_breakpoint_site(pc, false, true).unwrap();
    assert_eq!(site.id(), -1);
    assert!(site.is_internal());
}

#[test]
fn hardware_slots_are_allocated_lowest_first() {
    let mut process = launch_sleep();
    let pc = process.pc().unwrap();

    for expected_slot in 0..4 {
        let slot = process
            .set_hardware_breakpoint(pc + (expected_slot as u64) * 0x10)
            .unwrap();
        assert_eq!(slot, expected_slot);
    }

    // 5本目は空きがない
    assert!(matches!(
        process.set_hardware_breakpoint(pc + 0x100u64),
        Err(DebugError::ResourceExhausted)
    ));

    // dr7の有効ビットとdrNのアドレスがカーネルに届いている
    process.registers_mut().read_all().unwrap();
    let control = process
        .registers()
        .read_by_id_as_u64(RegisterId::Dr7)
        .unwrap();
    for slot in 0..4u64 {
        assert_ne!(control & (0b11 << (slot * 2)), 0, "slot {} enabled", slot);
    }
    assert_eq!(
        process
            .registers()
            .read_by_id_as_u64(RegisterId::Dr0)
            .unwrap(),
        pc.addr()
    );

    // 解放したスロットが再利用される
    process.clear_hardware_stoppoint(2).unwrap();
    process.registers_mut().read_all().unwrap();
    assert_eq!(
        process
            .registers()
            .read_by_id_as_u64(RegisterId::Dr2)
            .unwrap(),
        0
    );
    let aligned = VirtAddr(pc.addr() & !7);
    assert_eq!(
        process
            .set_watchpoint(aligned, StoppointMode::Write, 8)
            .unwrap(),
        2
    );
}

#[test]
fn watchpoint_arguments_are_validated() {
    let mut process = launch_sleep();
    assert!(matches!(
        process.create_watchpoint(VirtAddr(0x1001), StoppointMode::Write, 8),
        Err(DebugError::Protocol(_))
    ));
    assert!(matches!(
        process.create_watchpoint(VirtAddr(0x1000), StoppointMode::Write, 3),
        Err(DebugError::Protocol(_))
    ));
    assert!(process.watchpoints().is_empty());
}

#[test]
fn write_watchpoint_stops_on_stack_write() {
    let mut process = launch_sleep();

    // エントリ直後のcallが積む戻りアドレスを監視する
    let rsp = process
        .registers()
        .read_by_id_as_u64(RegisterId::Rsp)
        .unwrap();
    let target = VirtAddr(rsp - 8);

    let id = process
        .create_watchpoint(target, StoppointMode::Write, 8)
        .unwrap()
        .id();
    process.enable_watchpoint(id).unwrap();

    process.resume().unwrap();
    let reason = process.wait_on_signal().unwrap();

    assert_eq!(reason.reason, ProcessState::Stopped);
    assert_eq!(reason.info, Signal::SIGTRAP as i32 as u8);
}

#[test]
fn step_instruction_advances_pc() {
    let mut process = launch_sleep();
    let before = process.pc().unwrap();

    let reason = process.step_instruction().unwrap();
    assert_eq!(reason.reason, ProcessState::Stopped);
    assert_eq!(process.state(), ProcessState::Stopped);
    assert_ne!(process.pc().unwrap(), before);
}

#[test]
fn memory_write_round_trips() {
    let mut process = launch_sleep();
    let rsp = process
        .registers()
        .read_by_id_as_u64(RegisterId::Rsp)
        .unwrap();
    let target = VirtAddr(rsp);

    let data = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
    process.write_memory(target, &data).unwrap();
    assert_eq!(process.read_memory(target, data.len()).unwrap(), data);

    // 境界に揃わない1バイト書き込みも同じ経路を通る
    process.write_memory(target + 3u64, &[0xff]).unwrap();
    let readback = process.read_memory(target, data.len()).unwrap();
    assert_eq!(readback[3], 0xff);
    assert_eq!(readback[4], 5);

    // 型付き読み取り
    process.write_memory(target, &0xdeadbeefu32.to_le_bytes()).unwrap();
    let value: u32 = process.read_memory_as(target).unwrap();
    assert_eq!(value, 0xdeadbeef);
}

#[test]
fn terminal_state_rejects_operations() {
    let devnull = File::create("/dev/null").unwrap();
    let mut process =
        Process::launch("/bin/echo", &[], true, Some(devnull.as_raw_fd())).unwrap();

    process.resume().unwrap();
    let mut reason = process.wait_on_signal().unwrap();
    while reason.reason == ProcessState::Stopped {
        process.resume().unwrap();
        reason = process.wait_on_signal().unwrap();
    }
    assert_eq!(process.state(), ProcessState::Exited);

    assert!(matches!(process.resume(), Err(DebugError::State(_))));
    assert!(matches!(process.step_instruction(), Err(DebugError::State(_))));
    assert!(matches!(
        process.read_memory(VirtAddr(0x1000), 8),
        Err(DebugError::State(_))
    ));
    assert!(matches!(
        process.create_breakpoint_site(VirtAddr(0x1000), false, false),
        Err(DebugError::State(_))
    ));
}

#[test]
fn resume_requires_stopped_state() {
    let mut process = launch_sleep();
    process.resume().unwrap();
    // runningからのresumeは状態エラー
    assert!(matches!(process.resume(), Err(DebugError::State(_))));
}
