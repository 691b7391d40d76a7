//! Sumire デバッガのコア機能
//!
//! このクレートは、フロントエンドが利用するデバッガのロジックを提供します。
//! コマンドのパース、レジスタ値のパース、逆アセンブル、そして
//! ターゲットプロセス操作をまとめた`Debugger`ファサードを含みます。

pub mod command;
pub mod debugger;
pub mod disasm;
pub mod parse;

pub use command::Command;
pub use debugger::Debugger;
pub use disasm::Instruction;

// フロントエンドから使うために再エクスポート
pub use sumire_target::register_info::{RegisterInfo, REGISTER_INFOS};
pub use sumire_target::{
    DebugError, ProcessState, RegisterFormat, RegisterType, RegisterValue, StopReason, Stoppoint,
    StoppointMode, VirtAddr,
};

/// デバッガの結果型
pub type Result<T> = anyhow::Result<T>;
