//! デバッガコマンド

use crate::parse::{parse_address, parse_bytes};
use crate::Result;
use sumire_target::StoppointMode;

/// `memory read`の既定バイト数
const DEFAULT_MEMORY_READ_BYTES: usize = 32;

/// `disassemble`の既定命令数
const DEFAULT_DISASSEMBLE_COUNT: usize = 5;

/// デバッガコマンド
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// 実行継続
    Continue,
    /// 1命令ステップ実行
    Step,
    /// ブレークポイント設定（有効化込み）
    BreakpointSet { address: u64, hardware: bool },
    /// ブレークポイント一覧表示
    BreakpointList,
    BreakpointEnable(i32),
    BreakpointDisable(i32),
    BreakpointDelete(i32),
    /// ウォッチポイント設定（有効化込み）
    WatchpointSet {
        address: u64,
        mode: StoppointMode,
        size: usize,
    },
    /// ウォッチポイント一覧表示
    WatchpointList,
    WatchpointEnable(i32),
    WatchpointDisable(i32),
    WatchpointDelete(i32),
    /// 汎用レジスタの表示
    RegisterRead,
    /// 全レジスタの表示
    RegisterReadAll,
    /// 名前指定のレジスタ表示
    RegisterReadNamed(String),
    /// レジスタへの書き込み（値はフォーマットに応じて後段でパース）
    RegisterWrite { name: String, value: String },
    MemoryRead { address: u64, bytes: usize },
    MemoryWrite { address: u64, data: Vec<u8> },
    Disassemble { address: Option<u64>, count: usize },
    /// ヘルプ表示
    Help(Option<String>),
    /// 終了
    Quit,
}

/// 入力がコマンド名の前方一致かどうか
fn is_prefix(prefix: &str, of: &str) -> bool {
    !prefix.is_empty() && of.starts_with(prefix)
}

impl Command {
    /// コマンド文字列をパースする
    pub fn parse(line: &str) -> Result<Self> {
        let args: Vec<&str> = line.split_whitespace().collect();
        let command = match args.first() {
            Some(c) => *c,
            None => anyhow::bail!("Empty command"),
        };

        if is_prefix(command, "continue") {
            Ok(Command::Continue)
        } else if is_prefix(command, "step") {
            Ok(Command::Step)
        } else if is_prefix(command, "breakpoint") {
            Self::parse_breakpoint(&args)
        } else if is_prefix(command, "watchpoint") {
            Self::parse_watchpoint(&args)
        } else if is_prefix(command, "register") {
            Self::parse_register(&args)
        } else if is_prefix(command, "memory") {
            Self::parse_memory(&args)
        } else if is_prefix(command, "disassemble") {
            Self::parse_disassemble(&args)
        } else if is_prefix(command, "help") {
            Ok(Command::Help(args.get(1).map(|s| s.to_string())))
        } else if is_prefix(command, "quit") {
            Ok(Command::Quit)
        } else {
            anyhow::bail!("Unknown command: {}", command)
        }
    }

    fn parse_breakpoint(args: &[&str]) -> Result<Self> {
        let sub = args
            .get(1)
            .ok_or_else(|| anyhow::anyhow!("breakpoint command expects a subcommand"))?;

        if is_prefix(sub, "list") {
            return Ok(Command::BreakpointList);
        }

        if is_prefix(sub, "set") {
            let address = parse_address(
                args.get(2)
                    .ok_or_else(|| anyhow::anyhow!("breakpoint set expects an address"))?,
            )?;
            let hardware = match args.get(3) {
                Some(&"-h") => true,
                Some(other) => {
                    anyhow::bail!("Invalid breakpoint command argument: {}", other)
                }
                None => false,
            };
            return Ok(Command::BreakpointSet { address, hardware });
        }

        let id = parse_stoppoint_id(args.get(2), "breakpoint")?;
        if is_prefix(sub, "enable") {
            Ok(Command::BreakpointEnable(id))
        } else if is_prefix(sub, "disable") {
            Ok(Command::BreakpointDisable(id))
        } else if is_prefix(sub, "delete") {
            Ok(Command::BreakpointDelete(id))
        } else {
            anyhow::bail!("Unknown breakpoint command: {}", sub)
        }
    }

    fn parse_watchpoint(args: &[&str]) -> Result<Self> {
        let sub = args
            .get(1)
            .ok_or_else(|| anyhow::anyhow!("watchpoint command expects a subcommand"))?;

        if is_prefix(sub, "list") {
            return Ok(Command::WatchpointList);
        }

        if is_prefix(sub, "set") {
            let address = parse_address(
                args.get(2)
                    .ok_or_else(|| anyhow::anyhow!("watchpoint set expects an address"))?,
            )?;
            let mode = match args.get(3) {
                Some(&"write") => StoppointMode::Write,
                Some(&"rw") => StoppointMode::ReadWrite,
                Some(&"execute") => StoppointMode::Execute,
                other => anyhow::bail!(
                    "watchpoint set expects a mode of write, rw or execute, got {:?}",
                    other
                ),
            };
            let size = args
                .get(4)
                .ok_or_else(|| anyhow::anyhow!("watchpoint set expects a size"))?
                .parse::<usize>()
                .map_err(|e| anyhow::anyhow!("Invalid watchpoint size: {}", e))?;
            return Ok(Command::WatchpointSet {
                address,
                mode,
                size,
            });
        }

        let id = parse_stoppoint_id(args.get(2), "watchpoint")?;
        if is_prefix(sub, "enable") {
            Ok(Command::WatchpointEnable(id))
        } else if is_prefix(sub, "disable") {
            Ok(Command::WatchpointDisable(id))
        } else if is_prefix(sub, "delete") {
            Ok(Command::WatchpointDelete(id))
        } else {
            anyhow::bail!("Unknown watchpoint command: {}", sub)
        }
    }

    fn parse_register(args: &[&str]) -> Result<Self> {
        let sub = args
            .get(1)
            .ok_or_else(|| anyhow::anyhow!("register command expects read or write"))?;

        if is_prefix(sub, "read") {
            return Ok(match args.get(2) {
                None => Command::RegisterRead,
                Some(&"all") => Command::RegisterReadAll,
                Some(name) => Command::RegisterReadNamed(name.to_string()),
            });
        }

        if is_prefix(sub, "write") {
            let name = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("register write expects a register name"))?;
            let value = args
                .get(3)
                .ok_or_else(|| anyhow::anyhow!("register write expects a value"))?;
            return Ok(Command::RegisterWrite {
                name: name.to_string(),
                value: value.to_string(),
            });
        }

        anyhow::bail!("Unknown register command: {}", sub)
    }

    fn parse_memory(args: &[&str]) -> Result<Self> {
        let sub = args
            .get(1)
            .ok_or_else(|| anyhow::anyhow!("memory command expects read or write"))?;
        let address = parse_address(
            args.get(2)
                .ok_or_else(|| anyhow::anyhow!("memory command expects an address"))?,
        )?;

        if is_prefix(sub, "read") {
            let bytes = match args.get(3) {
                Some(n) => n
                    .parse::<usize>()
                    .map_err(|e| anyhow::anyhow!("Invalid number of bytes: {}", e))?,
                None => DEFAULT_MEMORY_READ_BYTES,
            };
            return Ok(Command::MemoryRead { address, bytes });
        }

        if is_prefix(sub, "write") {
            let data = parse_bytes(
                args.get(3)
                    .ok_or_else(|| anyhow::anyhow!("memory write expects data bytes"))?,
            )?;
            return Ok(Command::MemoryWrite { address, data });
        }

        anyhow::bail!("Unknown memory command: {}", sub)
    }

    fn parse_disassemble(args: &[&str]) -> Result<Self> {
        let mut address = None;
        let mut count = DEFAULT_DISASSEMBLE_COUNT;

        let mut it = args[1..].iter();
        while let Some(flag) = it.next() {
            match *flag {
                "-a" => {
                    let value = it
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("-a expects an address"))?;
                    address = Some(parse_address(value)?);
                }
                "-c" => {
                    let value = it
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("-c expects an instruction count"))?;
                    count = value
                        .parse::<usize>()
                        .map_err(|e| anyhow::anyhow!("Invalid instruction count: {}", e))?;
                }
                other => anyhow::bail!("Unknown disassemble option: {}", other),
            }
        }

        Ok(Command::Disassemble { address, count })
    }
}

fn parse_stoppoint_id(arg: Option<&&str>, kind: &str) -> Result<i32> {
    arg.ok_or_else(|| anyhow::anyhow!("Command expects a {} id", kind))?
        .parse::<i32>()
        .map_err(|e| anyhow::anyhow!("Invalid {} id: {}", kind, e))
}
