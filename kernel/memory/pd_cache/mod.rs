// AetherOS GMMU ページディレクトリ(PD)キャッシュ
//
// このモジュールはGPUページテーブル用のスラブキャッシュを実装します。
// ブロック粒度未満のPDは1つのブロックに複数詰め込まれ、ブロック粒度以上の
// PDはプロバイダから直接確保されます。
//
// スラブはサイズクラスごとの partial/full リストで管理され、
// 解放時のブロック→スラブ逆引きには順序付きマップを使用します。

mod bitmap;
mod block;
mod config;
mod entry;
mod error;
mod list;
mod pd;
mod sysmem;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use log::{debug, error, info, warn};
use spin::Mutex;

use entry::PdMemEntry;
use list::{ListKind, SlabList};
use pd::PdMem;

pub use block::{BlockAllocError, BlockId, BlockProvider, BlockRef, DmaBlock, DmaFlags};
pub use config::PdCacheConfig;
pub use error::{PdCacheError, PdCacheResult};
pub use pd::{offset_from_index, Pd};
pub use sysmem::{FaultInjection, SysmemProvider};

/// PDキャッシュの使用状況
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdCacheInfo {
    /// 空きスロットのあるスラブ数
    pub partial_slabs: usize,

    /// 満杯のスラブ数
    pub full_slabs: usize,

    /// 割り当て済みPD数（キャッシュ経由のもののみ）
    pub allocated_pds: usize,
}

/// ロックで保護されるキャッシュ本体
struct PdCacheInner {
    /// サイズクラスごとの空きのあるスラブ
    partial: Vec<SlabList>,

    /// サイズクラスごとの満杯のスラブ
    full: Vec<SlabList>,

    /// ブロックID → スラブ
    mem_tree: BTreeMap<BlockId, PdMemEntry>,
}

impl PdCacheInner {
    fn new(nr_classes: usize) -> PdCacheResult<Self> {
        let mut partial = Vec::new();
        let mut full = Vec::new();
        partial
            .try_reserve_exact(nr_classes)
            .map_err(|_| PdCacheError::OutOfMemory)?;
        full.try_reserve_exact(nr_classes)
            .map_err(|_| PdCacheError::OutOfMemory)?;

        for _ in 0..nr_classes {
            partial.push(SlabList::new());
            full.push(SlabList::new());
        }

        Ok(Self {
            partial,
            full,
            mem_tree: BTreeMap::new(),
        })
    }

    fn is_empty(&self) -> bool {
        self.partial.iter().all(SlabList::is_empty)
            && self.full.iter().all(SlabList::is_empty)
    }

    fn entry_mut(&mut self, id: BlockId) -> &mut PdMemEntry {
        match self.mem_tree.get_mut(&id) {
            Some(entry) => entry,
            None => panic!("PDスラブ {:?} がキャッシュに存在しません", id),
        }
    }

    /// スラブを指定リストの末尾に繋ぐ
    fn link(&mut self, id: BlockId, kind: ListKind) {
        let entry = match self.mem_tree.get_mut(&id) {
            Some(entry) => entry,
            None => panic!("PDスラブ {:?} がキャッシュに存在しません", id),
        };
        let list = match kind {
            ListKind::Partial => &mut self.partial[entry.size_class],
            ListKind::Full => &mut self.full[entry.size_class],
        };

        entry.list = kind;
        entry.list_pos = list.push(id);
    }

    /// スラブを現在のリストから外す
    fn unlink(&mut self, id: BlockId) {
        let (size_class, kind, pos) = match self.mem_tree.get(&id) {
            Some(entry) => (entry.size_class, entry.list, entry.list_pos),
            None => panic!("PDスラブ {:?} がキャッシュに存在しません", id),
        };
        let list = match kind {
            ListKind::Partial => &mut self.partial[size_class],
            ListKind::Full => &mut self.full[size_class],
        };

        assert_eq!(list.get(pos), Some(id), "PDスラブリストが破損しています");

        if let Some(moved) = list.remove(pos) {
            if let Some(entry) = self.mem_tree.get_mut(&moved) {
                entry.list_pos = pos;
            }
        }
    }

    /// 内部構造の整合性を検証する
    fn verify(&self) {
        let mut linked = 0;

        for (kind, lists) in [(ListKind::Partial, &self.partial), (ListKind::Full, &self.full)] {
            for (size_class, list) in lists.iter().enumerate() {
                for (pos, id) in list.iter().enumerate() {
                    let entry = match self.mem_tree.get(id) {
                        Some(entry) => entry,
                        None => panic!("リスト上のPDスラブ {:?} が索引にありません", id),
                    };

                    assert_eq!(entry.list, kind);
                    assert_eq!(entry.list_pos, pos);
                    assert_eq!(entry.size_class, size_class);
                    assert!(entry.alloc_count() > 0, "空のPDスラブが残っています");
                    assert_eq!(entry.is_full(), kind == ListKind::Full);
                    assert_eq!(entry.bitmap().count_ones(), entry.alloc_count());
                    linked += 1;
                }
            }
        }

        assert_eq!(linked, self.mem_tree.len(), "どのリストにも属さないPDスラブがあります");
    }
}

/// PDキャッシュ
///
/// GPUインスタンスごとに1つ作成します。`init` で使用可能になり、
/// `fini` で破棄されます。全てのキャッシュ操作は単一のロックで直列化されますが、
/// 直接割り当てはキャッシュの状態に触れないためロックを取りません。
///
/// 使用中のPDが残ったまま破棄（`Drop`）された場合はエラーを記録し、
/// 残りのブロックを意図的にリークさせます。PDが解放済みメモリを
/// 指さないようにするためで、パニックはしません。使用中のPDを
/// 致命的エラーとして検出したい場合は `fini` を呼んでください。
pub struct PdCache<P: BlockProvider> {
    config: PdCacheConfig,
    provider: P,
    inner: Mutex<Option<PdCacheInner>>,
}

impl<P: BlockProvider> PdCache<P> {
    /// 未初期化のPDキャッシュを作成する
    pub fn new(config: PdCacheConfig, provider: P) -> PdCacheResult<Self> {
        config.validate()?;

        Ok(Self {
            config,
            provider,
            inner: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PdCacheConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// キャッシュを初期化する
    ///
    /// 既に初期化済みの場合は何もしない。
    pub fn init(&self) -> PdCacheResult<()> {
        let mut guard = self.inner.lock();
        if guard.is_some() {
            debug!("PDキャッシュは既に初期化されています");
            return Ok(());
        }

        *guard = Some(PdCacheInner::new(self.config.size_class_count())?);

        info!(
            "PDキャッシュ初期化: 粒度={} 最小PD={} サイズクラス={}",
            self.config.block_granule,
            self.config.min_block_size,
            self.config.size_class_count()
        );
        Ok(())
    }

    /// キャッシュを破棄する
    ///
    /// 未初期化なら何もしない。スラブが残っている場合はパニックする。
    pub fn fini(&self) {
        let mut guard = self.inner.lock();
        match guard.as_ref() {
            None => {
                debug!("PDキャッシュは初期化されていません");
                return;
            }
            Some(inner) => {
                assert!(inner.is_empty(), "使用中のPDが残ったままPDキャッシュを破棄しようとしました");
                assert!(inner.mem_tree.is_empty());
            }
        }

        *guard = None;
        info!("PDキャッシュ破棄");
    }

    /// 使用状況を取得する
    pub fn info(&self) -> Option<PdCacheInfo> {
        let guard = self.inner.lock();
        guard.as_ref().map(|inner| PdCacheInfo {
            partial_slabs: inner.partial.iter().map(SlabList::len).sum(),
            full_slabs: inner.full.iter().map(SlabList::len).sum(),
            allocated_pds: inner.mem_tree.values().map(PdMemEntry::alloc_count).sum(),
        })
    }

    /// PDを割り当てる
    ///
    /// # 引数
    /// * `size` - PDサイズ（最小PDサイズ以上の2の累乗）
    ///
    /// # 戻り値
    /// * サイズが不正な場合は `InvalidArgument`
    /// * メモリが確保できない場合は `OutOfMemory`
    pub fn alloc(&self, size: usize) -> PdCacheResult<Pd> {
        if !self.config.is_valid_pd_size(size) {
            debug!("不正なPDサイズ: {}", size);
            return Err(PdCacheError::InvalidArgument);
        }

        if size >= self.config.block_granule {
            return self.alloc_direct(size);
        }

        let mut guard = self.inner.lock();
        let inner = match guard.as_mut() {
            Some(inner) => inner,
            None => panic!("初期化されていないPDキャッシュからの割り当て"),
        };

        let size_class = self.config.size_class(size);
        let id = match inner.partial[size_class].first() {
            Some(id) => id,
            None => match self.alloc_new_slab(inner, size_class) {
                Ok(id) => id,
                Err(BlockAllocError::OutOfMemory) if self.config.direct_fallback => {
                    drop(guard);
                    warn!("PDスラブ用ブロックの確保に失敗、直接割り当てを試みます: size={}", size);
                    return self.alloc_direct(size);
                }
                Err(err) => {
                    error!("PDスラブ用ブロックの確保に失敗: {:?}", err);
                    return Err(PdCacheError::OutOfMemory);
                }
            },
        };

        let entry = inner.entry_mut(id);
        let offset = entry.alloc_slot();
        let block = entry.block_ref();
        if entry.is_full() {
            inner.unlink(id);
            inner.link(id, ListKind::Full);
        }

        self.check_consistency(inner);

        Ok(Pd {
            mem: PdMem::Cached(block),
            mem_offs: offset,
            pd_size: size,
        })
    }

    /// キャッシュを経由せずにPDを割り当てる
    ///
    /// PDはブロックの先頭（オフセット0）に配置される。
    /// キャッシュが未初期化でも使用できる。
    pub fn alloc_direct(&self, size: usize) -> PdCacheResult<Pd> {
        if size == 0 {
            return Err(PdCacheError::InvalidArgument);
        }

        let flags = self.dma_flags(size);
        match self.provider.alloc_block(size, flags) {
            Ok(mem) => {
                debug!("PD割り当て [D] ブロック={:?} size={} flags={:?}", mem.id(), size, flags);
                Ok(Pd {
                    mem: PdMem::Direct(mem),
                    mem_offs: 0,
                    pd_size: size,
                })
            }
            Err(err) => {
                error!("PDのDMA確保に失敗: size={} {:?}", size, err);
                Err(PdCacheError::OutOfMemory)
            }
        }
    }

    /// PDを解放する
    pub fn free(&self, pd: Pd) {
        let Pd { mem, mem_offs, pd_size } = pd;

        match mem {
            PdMem::Direct(block) => {
                debug!("PD解放 [D] ブロック={:?} size={}", block.id(), pd_size);
                self.provider.free_block(block);
            }
            PdMem::Cached(block) => self.free_cached(block.id(), mem_offs),
        }
    }

    fn free_cached(&self, id: BlockId, offset: usize) {
        let mut guard = self.inner.lock();
        let inner = match guard.as_mut() {
            Some(inner) => inner,
            None => panic!("初期化されていないPDキャッシュへの解放"),
        };

        let entry = inner.entry_mut(id);
        entry.free_slot(offset);
        let (count, kind) = (entry.alloc_count(), entry.list);

        if count > 0 {
            if kind == ListKind::Full {
                inner.unlink(id);
                inner.link(id, ListKind::Partial);
            }
        } else {
            inner.unlink(id);
            if let Some(entry) = inner.mem_tree.remove(&id) {
                debug!("PDスラブ破棄: ブロック={:?} スロット={}", id, entry.slot_size());
                self.provider.free_block(entry.into_block());
            }
        }

        self.check_consistency(inner);
    }

    /// 新しいスラブを作成し、partialリストに繋ぐ
    fn alloc_new_slab(
        &self,
        inner: &mut PdCacheInner,
        size_class: usize,
    ) -> Result<BlockId, BlockAllocError> {
        let granule = self.config.block_granule;
        let slot_size = self.config.slot_size(size_class);

        let mem = self.provider.alloc_block(granule, self.dma_flags(granule))?;
        let entry = PdMemEntry::new(mem, size_class, slot_size, granule, self.config.bitmap_bits());
        let id = entry.id();

        if inner.mem_tree.insert(id, entry).is_some() {
            panic!("プロバイダが使用中のブロックID {:?} を返しました", id);
        }
        inner.link(id, ListKind::Partial);

        debug!("新しいPDスラブ: ブロック={:?} スロット={} 数={}", id, slot_size, granule / slot_size);
        Ok(id)
    }

    /// IOMMUなしでCPUページを超えるブロックには物理連続性が必要
    fn dma_flags(&self, size: usize) -> DmaFlags {
        if !self.provider.is_iommu_active() && size > self.config.cpu_page_size {
            DmaFlags::PHYSICALLY_ADDRESSED
        } else {
            DmaFlags::empty()
        }
    }

    fn check_consistency(&self, inner: &PdCacheInner) {
        if cfg!(any(test, feature = "debug-memory")) {
            inner.verify();
        }
    }
}

impl<P: BlockProvider> Drop for PdCache<P> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.get_mut().take() {
            if !inner.mem_tree.is_empty() {
                error!(
                    "{} 個のPDスラブが残ったままPDキャッシュが破棄されました",
                    inner.mem_tree.len()
                );
                // 使用中のPDが参照しているためブロックはリークさせる
                for (_, entry) in inner.mem_tree {
                    core::mem::forget(entry.into_block());
                }
            }
        }
    }
}
