// AetherOS システムメモリ・ブロックプロバイダ
//
// グローバルアロケータからブロックを確保するプロバイダです。
// 専用のDMAアロケータを持たない環境やテストで使用します。

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use log::debug;

use super::block::{BlockAllocError, BlockId, BlockProvider, DmaBlock, DmaFlags};

/// IOMMU有効時に割り当てるIOVA空間の先頭
const IOVA_BASE: u64 = 0x1_0000_0000;

/// フォールトインジェクション
///
/// 有効化後、指定回数だけ成功させ、それ以降の呼び出しを全て失敗させます。
#[derive(Debug, Default)]
pub struct FaultInjection {
    enabled: AtomicBool,
    remaining: AtomicUsize,
}

impl FaultInjection {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            remaining: AtomicUsize::new(0),
        }
    }

    /// `succeed_count` 回成功した後に失敗させる
    pub fn enable(&self, succeed_count: usize) {
        self.remaining.store(succeed_count, Ordering::SeqCst);
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// 今回の呼び出しを失敗させるべきか
    pub fn should_fail(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }

        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
    }
}

/// システムメモリ・ブロックプロバイダ
#[derive(Debug)]
pub struct SysmemProvider {
    /// IOMMU経由でアクセスされるか
    iommu: bool,

    /// 全ブロックをCPUにマップしない（VIDMEM相当）
    unmapped: bool,

    /// CPUページサイズ
    page_size: usize,

    /// 次に割り当てるIOVA
    iova_next: AtomicU64,

    /// 生存中のブロック数
    live_blocks: AtomicUsize,

    /// フォールトインジェクション
    fault: FaultInjection,
}

impl Default for SysmemProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SysmemProvider {
    /// IOMMUなし、4KiBページのプロバイダを作成する
    pub fn new() -> Self {
        Self {
            iommu: false,
            unmapped: false,
            page_size: 4096,
            iova_next: AtomicU64::new(IOVA_BASE),
            live_blocks: AtomicUsize::new(0),
            fault: FaultInjection::new(),
        }
    }

    pub fn with_iommu(mut self, iommu: bool) -> Self {
        self.iommu = iommu;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// CPUマッピングを持たないブロックを返すようにする
    pub fn without_cpu_mapping(mut self) -> Self {
        self.unmapped = true;
        self
    }

    pub fn fault_injection(&self) -> &FaultInjection {
        &self.fault
    }

    /// 生存中のブロック数
    pub fn live_blocks(&self) -> usize {
        self.live_blocks.load(Ordering::SeqCst)
    }

    fn layout(&self, size: usize) -> Option<Layout> {
        let align = size.checked_next_power_of_two()?.min(self.page_size);
        Layout::from_size_align(size, align).ok()
    }

    fn alloc_iova(&self, size: usize) -> u64 {
        let page = self.page_size as u64;
        let len = (size as u64 + page - 1) & !(page - 1);
        self.iova_next.fetch_add(len, Ordering::SeqCst)
    }
}

impl BlockProvider for SysmemProvider {
    fn alloc_block(&self, size: usize, flags: DmaFlags) -> Result<DmaBlock, BlockAllocError> {
        if size == 0 {
            return Err(BlockAllocError::Unavailable);
        }

        if self.fault.should_fail() {
            debug!("sysmem: フォールトインジェクションによる確保失敗 size={}", size);
            return Err(BlockAllocError::OutOfMemory);
        }

        let layout = self.layout(size).ok_or(BlockAllocError::OutOfMemory)?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(BlockAllocError::OutOfMemory)?;

        let addr = ptr.as_ptr() as u64;
        let gpu_addr = if self.iommu { self.alloc_iova(size) } else { addr };
        let cpu_va = if self.unmapped || flags.contains(DmaFlags::NO_KERNEL_MAPPING) {
            None
        } else {
            Some(ptr)
        };

        self.live_blocks.fetch_add(1, Ordering::SeqCst);
        debug!(
            "sysmem: ブロック確保 addr={:#x} gpu={:#x} size={} flags={:?}",
            addr, gpu_addr, size, flags
        );

        // ptrはlayoutで確保した領域で、free_blockまで有効
        Ok(unsafe { DmaBlock::new(BlockId(addr), size, gpu_addr, cpu_va, flags) })
    }

    fn free_block(&self, block: DmaBlock) {
        let layout = match self.layout(block.size()) {
            Some(layout) => layout,
            None => panic!("sysmem: 不正なブロックサイズ {}", block.size()),
        };

        debug!("sysmem: ブロック解放 addr={:#x} size={}", block.id().0, block.size());

        // ブロックIDは確保時のホストアドレス
        unsafe { dealloc(block.id().0 as *mut u8, layout) };
        self.live_blocks.fetch_sub(1, Ordering::SeqCst);
    }

    fn is_iommu_active(&self) -> bool {
        self.iommu
    }
}
