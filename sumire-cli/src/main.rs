//! Sumire CLI - コマンドラインインターフェース
//!
//! 命令レベルデバッガ sumire のREPLインターフェース

use anyhow::Result;
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use sumire_core::{
    Command, Debugger, Instruction, ProcessState, RegisterType, RegisterValue, StopReason,
    Stoppoint, StoppointMode, REGISTER_INFOS,
};
use tracing_subscriber::EnvFilter;

/// Sumire - Instruction-level Debugger
#[derive(Parser)]
#[command(name = "sumire")]
#[command(version = "0.1.0")]
#[command(about = "Source-less instruction-level debugger for x86-64 Linux", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: DebugCommand,
}

#[derive(Subcommand)]
enum DebugCommand {
    /// Launch and debug an executable
    Run {
        /// Path to the executable binary
        binary: String,

        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Attach to an existing process
    Attach {
        /// Process ID to attach to
        #[arg(short, long)]
        pid: i32,
    },
}

fn main() -> Result<()> {
    // tracing subscriberを初期化
    // 環境変数 RUST_LOG でログレベルを制御可能 (例: RUST_LOG=debug sumire run ./binary)
    // デフォルトでは info レベル以上のみ表示
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_line_number(true)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    let mut debugger = init_debugger(cli.command)?;
    run_repl(&mut debugger)?;

    Ok(())
}

/// デバッガを初期化してプロセスにアタッチまたは起動する
fn init_debugger(command: DebugCommand) -> Result<Debugger> {
    match command {
        DebugCommand::Run { binary, args } => {
            let debugger = Debugger::launch(&binary, &args)?;
            println!("Launched process with PID {}", debugger.process().pid());
            Ok(debugger)
        }
        DebugCommand::Attach { pid } => {
            let debugger = Debugger::attach(pid)?;
            println!("Attached to process {}", pid);
            Ok(debugger)
        }
    }
}

/// REPLループを実行する
fn run_repl(debugger: &mut Debugger) -> Result<()> {
    println!("Type 'help' for available commands, 'quit' to exit.");
    println!();

    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline("(sumire) ");
        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                rl.add_history_entry(line)?;

                match handle_command(debugger, line) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

/// 1行分のコマンドを実行する。falseを返すとREPLを終了する
fn handle_command(debugger: &mut Debugger, line: &str) -> Result<bool> {
    match Command::parse(line)? {
        Command::Continue => {
            let reason = debugger.continue_and_wait()?;
            handle_stop(debugger, reason)?;
        }
        Command::Step => {
            let reason = debugger.step()?;
            handle_stop(debugger, reason)?;
        }
        Command::BreakpointSet { address, hardware } => {
            let id = debugger.set_breakpoint(address, hardware)?;
            println!("Set breakpoint {} at {:#x}", id, address);
        }
        Command::BreakpointList => print_breakpoints(debugger),
        Command::BreakpointEnable(id) => debugger.enable_breakpoint(id)?,
        Command::BreakpointDisable(id) => debugger.disable_breakpoint(id)?,
        Command::BreakpointDelete(id) => debugger.delete_breakpoint(id)?,
        Command::WatchpointSet {
            address,
            mode,
            size,
        } => {
            let id = debugger.set_watchpoint(address, mode, size)?;
            println!("Set watchpoint {} at {:#x}", id, address);
        }
        Command::WatchpointList => print_watchpoints(debugger),
        Command::WatchpointEnable(id) => debugger.enable_watchpoint(id)?,
        Command::WatchpointDisable(id) => debugger.disable_watchpoint(id)?,
        Command::WatchpointDelete(id) => debugger.delete_watchpoint(id)?,
        Command::RegisterRead => print_registers(debugger, false)?,
        Command::RegisterReadAll => print_registers(debugger, true)?,
        Command::RegisterReadNamed(name) => {
            let value = debugger.read_register(&name)?;
            println!("{}:\t{}", name, format_register_value(&value));
        }
        Command::RegisterWrite { name, value } => debugger.write_register(&name, &value)?,
        Command::MemoryRead { address, bytes } => print_memory(debugger, address, bytes)?,
        Command::MemoryWrite { address, data } => debugger.write_memory(address, &data)?,
        Command::Disassemble { address, count } => print_disassembly(debugger, address, count)?,
        Command::Help(topic) => print_help(topic.as_deref()),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

/// 停止理由を表示し、停止中なら続く命令を逆アセンブルする
fn handle_stop(debugger: &Debugger, reason: StopReason) -> Result<()> {
    println!(
        "Process {} {}",
        debugger.process().pid(),
        debugger.stop_description(reason)?
    );

    if reason.reason == ProcessState::Stopped {
        if let Err(e) = print_disassembly(debugger, None, 5) {
            eprintln!("Could not disassemble: {}", e);
        }
    }

    Ok(())
}

fn print_breakpoints(debugger: &Debugger) {
    let sites = debugger.process().breakpoint_sites();
    if sites.is_empty() {
        println!("No breakpoints set");
        return;
    }

    println!("Current breakpoints:");
    for site in sites.iter() {
        // 内部サイトは一覧に出さない
        if site.is_internal() {
            continue;
        }
        println!(
            "{}: address = {:#x}, {}",
            site.id(),
            site.address().addr(),
            if site.is_enabled() { "enabled" } else { "disabled" }
        );
    }
}

fn print_watchpoints(debugger: &Debugger) {
    let points = debugger.process().watchpoints();
    if points.is_empty() {
        println!("No watchpoints set");
        return;
    }

    println!("Current watchpoints:");
    for point in points.iter() {
        println!(
            "{}: address = {:#x}, mode = {}, size = {}, {}",
            point.id(),
            point.address().addr(),
            stoppoint_mode_name(point.mode()),
            point.size(),
            if point.is_enabled() { "enabled" } else { "disabled" }
        );
    }
}

fn stoppoint_mode_name(mode: StoppointMode) -> &'static str {
    match mode {
        StoppointMode::Execute => "execute",
        StoppointMode::Write => "write",
        StoppointMode::ReadWrite => "read_write",
    }
}

fn print_registers(debugger: &Debugger, all: bool) -> Result<()> {
    for info in REGISTER_INFOS.iter() {
        let should_print = (all || info.reg_type == RegisterType::Gpr) && info.name != "orig_rax";
        if !should_print {
            continue;
        }
        let value = debugger.process().registers().read(info)?;
        println!("{}:\t{}", info.name, format_register_value(&value));
    }
    Ok(())
}

fn format_register_value(value: &RegisterValue) -> String {
    match value {
        RegisterValue::U8(v) => format!("{:#04x}", v),
        RegisterValue::U16(v) => format!("{:#06x}", v),
        RegisterValue::U32(v) => format!("{:#010x}", v),
        RegisterValue::U64(v) => format!("{:#018x}", v),
        RegisterValue::I8(v) => format!("{}", v),
        RegisterValue::I16(v) => format!("{}", v),
        RegisterValue::I32(v) => format!("{}", v),
        RegisterValue::I64(v) => format!("{}", v),
        RegisterValue::F32(v) => format!("{}", v),
        RegisterValue::F64(v) => format!("{}", v),
        RegisterValue::LongDouble(bytes) => format_byte_vector(bytes),
        RegisterValue::Byte64(bytes) => format_byte_vector(bytes),
        RegisterValue::Byte128(bytes) => format_byte_vector(bytes),
    }
}

fn format_byte_vector(bytes: &[u8]) -> String {
    let items: Vec<String> = bytes.iter().map(|b| format!("{:#04x}", b)).collect();
    format!("[{}]", items.join(","))
}

fn print_memory(debugger: &Debugger, address: u64, bytes: usize) -> Result<()> {
    let data = debugger.read_memory(address, bytes)?;
    for (i, chunk) in data.chunks(16).enumerate() {
        let line: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        println!("{:#016x}: {}", address + (i * 16) as u64, line.join(" "));
    }
    Ok(())
}

fn print_disassembly(debugger: &Debugger, address: Option<u64>, count: usize) -> Result<()> {
    let instructions: Vec<Instruction> = debugger.disassemble(count, address)?;
    for instruction in instructions {
        println!("{:#018x}: {}", instruction.address.addr(), instruction.text);
    }
    Ok(())
}

fn print_help(topic: Option<&str>) {
    match topic {
        None => eprintln!(
            r#"Available commands:
    breakpoint  - Commands for operating on breakpoints
    continue    - Resume the process
    disassemble - Disassemble machine code to assembly
    memory      - Commands for operating on memory
    register    - Commands for operating on registers
    step        - Step over a single instruction
    watchpoint  - Commands for operating on watchpoints
    quit        - Exit the debugger"#
        ),
        Some(t) if "breakpoint".starts_with(t) => eprintln!(
            r#"Available commands:
    list
    delete <id>
    disable <id>
    enable <id>
    set <address>
    set <address> -h"#
        ),
        Some(t) if "disassemble".starts_with(t) => eprintln!(
            r#"Available options:
    -c <number of instructions>
    -a <start address>"#
        ),
        Some(t) if "memory".starts_with(t) => eprintln!(
            r#"Available commands:
    read <address>
    read <address> <number_of_bytes>
    write <address> <bytes>"#
        ),
        Some(t) if "register".starts_with(t) => eprintln!(
            r#"Available commands:
    read
    read <register>
    read all
    write <register> <value>"#
        ),
        Some(t) if "watchpoint".starts_with(t) => eprintln!(
            r#"Available commands:
    list
    delete <id>
    disable <id>
    enable <id>
    set <address> <write|rw|execute> <size>"#
        ),
        Some(_) => eprintln!("No help available on that"),
    }
}
