//! エラー型定義

use nix::errno::Errno;
use thiserror::Error;

/// コア操作で発生するエラー
///
/// すべての失敗しうる操作はこの4種類のいずれかを返します。
/// リトライは行いません（ptraceは同期的に成功するか失敗するかのどちらかです）。
#[derive(Debug, Error)]
pub enum DebugError {
    /// カーネルのトレース呼び出しが失敗した
    #[error("{msg}: {errno}")]
    Io { msg: String, errno: Errno },

    /// 呼び出し側の引数が不正（アドレス形式、重複ストップポイント、未知のレジスタ名など）
    #[error("{0}")]
    Protocol(String),

    /// 現在のプロセス状態では実行できない操作
    #[error("{0}")]
    State(String),

    /// ハードウェアデバッグレジスタに空きがない
    #[error("no free hardware debug register")]
    ResourceExhausted,
}

impl DebugError {
    /// errno付きのI/Oエラーを作成する
    pub fn io(msg: impl Into<String>, errno: Errno) -> Self {
        Self::Io {
            msg: msg.into(),
            errno,
        }
    }

    /// 引数不正エラーを作成する
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// 状態不正エラーを作成する
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }
}
