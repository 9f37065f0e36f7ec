// AetherOS PDキャッシュ ブロックプロバイダ
//
// このファイルはPDキャッシュが下位のDMAアロケータから取得する
// 物理ブロックと、そのプロバイダのインターフェースを定義します。

use core::ptr::{self, NonNull};

use bitflags::bitflags;

use super::config::WORD_SIZE;

bitflags! {
    /// ブロック確保フラグ
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaFlags: u32 {
        /// 物理的に連続したメモリが必要
        const PHYSICALLY_ADDRESSED = 1 << 0;
        /// CPUアドレス空間へのマップは不要
        const NO_KERNEL_MAPPING = 1 << 1;
    }
}

/// ブロック識別子
///
/// 生存中のブロック間で一意であること。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u64);

/// ブロック確保エラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAllocError {
    /// メモリ不足
    OutOfMemory,

    /// プロバイダが利用できない
    Unavailable,
}

/// プロバイダから取得したブロック
///
/// ブロックを排他的に所有します。`BlockProvider::free_block` に
/// 渡すことでのみ解放されます。
pub struct DmaBlock {
    id: BlockId,
    size: usize,
    gpu_addr: u64,
    cpu_va: Option<NonNull<u8>>,
    flags: DmaFlags,
}

// cpu_vaはブロック所有者以外からはBlockRef経由でのみアクセスされる
unsafe impl Send for DmaBlock {}
unsafe impl Sync for DmaBlock {}

impl DmaBlock {
    /// 新しいブロック記述子を作成する
    ///
    /// # 安全性
    /// * `cpu_va` が `Some` の場合、`size` バイトの読み書き可能な領域を指し、
    ///   `free_block` で解放されるまで有効であること
    /// * `id` は生存中の他のブロックと重複しないこと
    pub unsafe fn new(
        id: BlockId,
        size: usize,
        gpu_addr: u64,
        cpu_va: Option<NonNull<u8>>,
        flags: DmaFlags,
    ) -> Self {
        Self { id, size, gpu_addr, cpu_va, flags }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn gpu_addr(&self) -> u64 {
        self.gpu_addr
    }

    pub fn cpu_va(&self) -> Option<NonNull<u8>> {
        self.cpu_va
    }

    pub fn flags(&self) -> DmaFlags {
        self.flags
    }

    /// 所有権を持たない参照を作成する
    pub fn as_block_ref(&self) -> BlockRef {
        BlockRef {
            id: self.id,
            size: self.size,
            gpu_addr: self.gpu_addr,
            cpu_va: self.cpu_va,
        }
    }
}

/// ブロックへの所有権を持たない参照
///
/// スラブ上のPDが共有ブロックを指すために使用します。
/// 参照元のブロックが解放された後に使用してはいけません。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    id: BlockId,
    size: usize,
    gpu_addr: u64,
    cpu_va: Option<NonNull<u8>>,
}

unsafe impl Send for BlockRef {}
unsafe impl Sync for BlockRef {}

impl BlockRef {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn gpu_addr(&self) -> u64 {
        self.gpu_addr
    }

    /// CPUからアクセス可能か
    pub fn is_cpu_mapped(&self) -> bool {
        self.cpu_va.is_some()
    }

    /// 指定範囲をゼロクリアする
    ///
    /// CPUにマップされていない場合は何もせず `false` を返す。
    pub(crate) fn zero(&self, offset: usize, len: usize) -> bool {
        assert!(offset + len <= self.size, "ブロック範囲外のゼロクリア");
        match self.cpu_va {
            Some(va) => {
                // 範囲はブロック内であることを確認済み
                unsafe { ptr::write_bytes(va.as_ptr().add(offset), 0, len) };
                true
            }
            None => false,
        }
    }

    /// バイトオフセットの位置に32ビットワードを書き込む
    pub(crate) fn write_u32(&self, byte_offset: usize, value: u32) -> bool {
        assert!(byte_offset + WORD_SIZE <= self.size, "ブロック範囲外への書き込み");
        match self.cpu_va {
            Some(va) => {
                unsafe {
                    let p = va.as_ptr().add(byte_offset) as *mut u32;
                    ptr::write_volatile(p, value);
                }
                true
            }
            None => false,
        }
    }

    /// バイトオフセットの位置から32ビットワードを読み出す
    pub(crate) fn read_u32(&self, byte_offset: usize) -> Option<u32> {
        assert!(byte_offset + WORD_SIZE <= self.size, "ブロック範囲外からの読み出し");
        self.cpu_va.map(|va| unsafe {
            let p = va.as_ptr().add(byte_offset) as *const u32;
            ptr::read_volatile(p)
        })
    }
}

/// 物理ブロックプロバイダ
///
/// PDキャッシュは物理メモリを自ら管理せず、このトレイトを通じて
/// ブロック単位でメモリを取得・返却します。
pub trait BlockProvider: Send + Sync {
    /// 少なくとも `size` バイトのブロックを確保する
    fn alloc_block(&self, size: usize, flags: DmaFlags) -> Result<DmaBlock, BlockAllocError>;

    /// ブロックを返却する
    fn free_block(&self, block: DmaBlock);

    /// このデバイスでIOMMUが有効か
    fn is_iommu_active(&self) -> bool;
}

impl<T: BlockProvider + ?Sized> BlockProvider for alloc::sync::Arc<T> {
    fn alloc_block(&self, size: usize, flags: DmaFlags) -> Result<DmaBlock, BlockAllocError> {
        (**self).alloc_block(size, flags)
    }

    fn free_block(&self, block: DmaBlock) {
        (**self).free_block(block)
    }

    fn is_iommu_active(&self) -> bool {
        (**self).is_iommu_active()
    }
}
