//! Sumire ターゲットプロセス制御
//!
//! このクレートは、デバッグ対象のプロセスを制御するための低レベル機能を提供します。
//! ptrace、レジスタアクセス、メモリアクセス、ブレークポイント・ウォッチポイントの
//! 設定などを行います。

pub mod address;
pub mod breakpoint;
pub mod errors;
pub mod memory;
pub mod process;
pub mod register_info;
pub mod registers;
pub mod stoppoint;
pub mod watchpoint;

pub use address::VirtAddr;
pub use breakpoint::BreakpointSite;
pub use errors::DebugError;
pub use memory::Memory;
pub use process::{Process, ProcessState, StopReason};
pub use register_info::{RegisterFormat, RegisterId, RegisterInfo, RegisterType};
pub use registers::{RegisterValue, Registers};
pub use stoppoint::{Stoppoint, StoppointCollection, StoppointMode};
pub use watchpoint::Watchpoint;

/// ターゲット制御の結果型
pub type Result<T> = std::result::Result<T, DebugError>;
