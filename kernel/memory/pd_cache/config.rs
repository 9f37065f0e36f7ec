// AetherOS PDキャッシュ 設定モジュール
//
// ブロック粒度や最小PDサイズなど、プラットフォーム依存の値を定義します。

use super::error::{PdCacheError, PdCacheResult};

/// 32ビットワードのサイズ（バイト）
pub const WORD_SIZE: usize = core::mem::size_of::<u32>();

/// PDキャッシュ設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdCacheConfig {
    /// プロバイダから取得するブロックのサイズ（バイト）
    /// スラブは常にこのサイズになる
    pub block_granule: usize,

    /// 割り当て可能な最小PDサイズ（バイト）
    pub min_block_size: usize,

    /// CPUのネイティブページサイズ（バイト）
    /// これを超えるブロックはIOMMUなしでは物理連続が必要
    pub cpu_page_size: usize,

    /// スラブ用ブロックの確保に失敗した時に直接割り当てを試すか
    pub direct_fallback: bool,
}

impl Default for PdCacheConfig {
    fn default() -> Self {
        Self {
            block_granule: 4096,
            min_block_size: 256,
            cpu_page_size: 4096,
            direct_fallback: true,
        }
    }
}

impl PdCacheConfig {
    /// 64KiBページのプラットフォーム向け設定
    pub fn large_page() -> Self {
        Self {
            block_granule: 64 * 1024,
            cpu_page_size: 64 * 1024,
            ..Default::default()
        }
    }

    /// 設定値を検証する
    pub fn validate(&self) -> PdCacheResult<()> {
        let pow2 = self.block_granule.is_power_of_two()
            && self.min_block_size.is_power_of_two()
            && self.cpu_page_size.is_power_of_two();

        if !pow2 || self.min_block_size < WORD_SIZE || self.min_block_size >= self.block_granule {
            return Err(PdCacheError::InvalidConfig);
        }

        Ok(())
    }

    /// サイズクラスの数
    pub fn size_class_count(&self) -> usize {
        (self.block_granule / self.min_block_size).trailing_zeros() as usize
    }

    /// 指定サイズのサイズクラス番号
    ///
    /// `size` は検証済み（2の累乗かつ範囲内）であること。
    pub fn size_class(&self, size: usize) -> usize {
        (size / self.min_block_size).trailing_zeros() as usize
    }

    /// サイズクラス番号からスロットサイズを求める
    pub fn slot_size(&self, size_class: usize) -> usize {
        self.min_block_size << size_class
    }

    /// ビットマップのビット数（最小スロットサイズ時のスロット数）
    pub fn bitmap_bits(&self) -> usize {
        self.block_granule / self.min_block_size
    }

    /// 要求サイズがPDとして有効か
    pub fn is_valid_pd_size(&self, size: usize) -> bool {
        size >= self.min_block_size && size.is_power_of_two()
    }
}
