// AetherOS GMMU ページディレクトリキャッシュ
// GPUページテーブル用のサブページ・スラブアロケータ
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod memory;


pub use memory::pd_cache::{
    offset_from_index, BlockAllocError, BlockId, BlockProvider, BlockRef, DmaBlock, DmaFlags,
    FaultInjection, Pd, PdCache, PdCacheConfig, PdCacheError, PdCacheInfo, PdCacheResult,
    SysmemProvider,
};
