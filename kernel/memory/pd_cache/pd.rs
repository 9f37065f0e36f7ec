// AetherOS ページディレクトリハンドル
//
// このファイルはPDキャッシュが返すPDハンドルと、
// PDに対するワード単位のアクセスを実装します。

use super::block::{BlockId, BlockRef, DmaBlock};
use super::config::WORD_SIZE;
use super::error::{PdCacheError, PdCacheResult};

/// PDの背後にあるメモリ
pub(super) enum PdMem {
    /// スラブ上のスロット（ブロックはスラブが所有）
    Cached(BlockRef),

    /// 専用ブロック（PDが所有）
    Direct(DmaBlock),
}

/// ページディレクトリ
///
/// `PdCache::free` に渡すことで解放されます。ハンドルは解放時に
/// 消費されるため、二重解放は型レベルで起こりません。
pub struct Pd {
    pub(super) mem: PdMem,

    /// ブロック内のバイトオフセット
    pub(super) mem_offs: usize,

    /// PDサイズ（バイト）
    pub(super) pd_size: usize,
}

impl Pd {
    /// PDキャッシュ上のスロットか
    pub fn is_cached(&self) -> bool {
        matches!(self.mem, PdMem::Cached(_))
    }

    /// ブロック内のバイトオフセット
    pub fn offset(&self) -> usize {
        self.mem_offs
    }

    /// PDサイズ（バイト）
    pub fn size(&self) -> usize {
        self.pd_size
    }

    /// 背後のブロックの識別子
    pub fn block_id(&self) -> BlockId {
        self.block_ref().id()
    }

    /// 背後のブロックへの参照
    pub fn block_ref(&self) -> BlockRef {
        match &self.mem {
            PdMem::Cached(block) => *block,
            PdMem::Direct(block) => block.as_block_ref(),
        }
    }

    /// GPUから見たPDのアドレス
    ///
    /// PDはパッキングによりブロック先頭以外に置かれる場合があるため、
    /// ブロックアドレスにオフセットを加える。
    pub fn gpu_addr(&self) -> u64 {
        self.block_ref().gpu_addr() + self.mem_offs as u64
    }

    /// PD先頭からのワード位置に書き込む
    ///
    /// 書き込みはPDを所有する側だけが行えるよう `&mut self` を要求する。
    ///
    /// ```compile_fail
    /// use pdcache::{PdCache, PdCacheConfig, SysmemProvider};
    ///
    /// let cache = PdCache::new(PdCacheConfig::default(), SysmemProvider::new()).unwrap();
    /// cache.init().unwrap();
    /// let pd = cache.alloc(256).unwrap();
    /// let shared = &pd;
    /// shared.write(0, 1).unwrap();
    /// ```
    pub fn write(&mut self, word: usize, data: u32) -> PdCacheResult<()> {
        let byte_offset = self.word_to_byte(word);
        if self.block_ref().write_u32(byte_offset, data) {
            Ok(())
        } else {
            Err(PdCacheError::NotCpuMapped)
        }
    }

    /// PD先頭からのワード位置を読み出す
    pub fn read(&self, word: usize) -> PdCacheResult<u32> {
        let byte_offset = self.word_to_byte(word);
        self.block_ref()
            .read_u32(byte_offset)
            .ok_or(PdCacheError::NotCpuMapped)
    }

    fn word_to_byte(&self, word: usize) -> usize {
        assert!(
            word < self.pd_size / WORD_SIZE,
            "PD範囲外のワード {} (PDサイズ={})",
            word,
            self.pd_size
        );
        self.mem_offs + word * WORD_SIZE
    }
}

impl core::fmt::Debug for Pd {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pd")
            .field("block", &self.block_id())
            .field("cached", &self.is_cached())
            .field("offs", &self.mem_offs)
            .field("size", &self.pd_size)
            .finish()
    }
}

/// PDエントリ番号からPD内のワードオフセットを求める
///
/// # 引数
/// * `entry_size` - 1エントリのサイズ（バイト）
/// * `index` - エントリ番号
pub fn offset_from_index(entry_size: usize, index: usize) -> usize {
    (index * entry_size) / WORD_SIZE
}
