// AetherOS PDキャッシュ エラー定義

use core::fmt;

/// PDキャッシュ操作エラー
///
/// 回復可能なエラーのみを表します。内部不変条件の破壊は
/// エラーとして返さず、パニックとして扱います。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdCacheError {
    /// サイズが最小ブロックサイズ未満、または2の累乗ではない
    InvalidArgument,

    /// ブロックプロバイダがメモリを確保できなかった
    OutOfMemory,

    /// 設定値が不正
    InvalidConfig,

    /// ブロックがCPUアドレス空間にマップされていない
    NotCpuMapped,
}

/// PDキャッシュ操作の結果
pub type PdCacheResult<T> = Result<T, PdCacheError>;

impl fmt::Display for PdCacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "PDサイズが不正です"),
            Self::OutOfMemory => write!(f, "PDメモリ不足"),
            Self::InvalidConfig => write!(f, "PDキャッシュ設定が不正です"),
            Self::NotCpuMapped => write!(f, "PDメモリがCPUにマップされていません"),
        }
    }
}
