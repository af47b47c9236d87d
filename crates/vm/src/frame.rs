//! 帧表：记录每个分配给用户页的物理帧，在物理内存耗尽时挑选牺牲帧

use alloc::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};
use core::{
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use common::config::HAND_SPREAD;
use defines::error::{errno, KResult};
use klocks::{SpinMutex, SpinMutexGuard};

use crate::{
    frame_allocator::Frame,
    page::PageDesc,
    PhysPageNum, Vm,
};

/// 帧表项，一个物理帧被分配给某个用户页期间存在
pub struct FrameEntry {
    ppn: PhysPageNum,
    /// 不持有所有权。帧表项的生命周期不会超过其对应的页
    page: Weak<PageDesc>,
    /// 刚分配、尚未载入完成的帧不能被换出
    pinned: AtomicBool,
    /// 帧锁。帧被释放后为 `None`
    frame: SpinMutex<Option<Frame>>,
}

impl FrameEntry {
    pub fn ppn(&self) -> PhysPageNum {
        self.ppn
    }

    pub fn page(&self) -> Option<Arc<PageDesc>> {
        self.page.upgrade()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    pub(crate) fn unpin(&self) {
        self.pinned.store(false, Ordering::Release);
    }

    /// 获取帧锁，对帧内容的读写、换出都需要在持有锁时进行
    ///
    /// 若在等待期间帧已经被别的核释放，返回 `None`
    pub fn lock(&self) -> Option<FrameGuard<'_>> {
        let inner = self.frame.lock();
        inner.is_some().then_some(FrameGuard { entry: self, inner })
    }
}

impl core::fmt::Debug for FrameEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameEntry")
            .field("ppn", &self.ppn)
            .field("pinned", &self.is_pinned())
            .finish_non_exhaustive()
    }
}

/// 持有帧锁期间可以访问帧的内容。drop 即解锁
pub struct FrameGuard<'a> {
    entry: &'a FrameEntry,
    inner: SpinMutexGuard<'a, Option<Frame>>,
}

impl FrameGuard<'_> {
    pub fn entry(&self) -> &FrameEntry {
        self.entry
    }
}

impl Deref for FrameGuard<'_> {
    type Target = Frame;

    fn deref(&self) -> &Frame {
        // 构造 guard 时已检查过，释放帧会消耗 guard
        self.inner.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for FrameGuard<'_> {
    fn deref_mut(&mut self) -> &mut Frame {
        self.inner.as_mut().unwrap_or_else(|| unreachable!())
    }
}

struct FrameSet {
    /// 按物理页号排序，时钟指针按这个顺序转动
    frames: BTreeMap<PhysPageNum, Arc<FrameEntry>>,
    /// 后指针下次开始的位置
    hand: Option<PhysPageNum>,
}

pub struct FrameTable {
    inner: SpinMutex<FrameSet>,
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTable {
    pub const fn new() -> Self {
        Self {
            inner: SpinMutex::new(FrameSet {
                frames: BTreeMap::new(),
                hand: None,
            }),
        }
    }

    /// 当前分配给用户页的帧数
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 为 `page` 分配一个清零的帧并登记到帧表中
    ///
    /// 物理内存不足时先换出一个页再重试一次，仍然失败则 panic。
    /// 返回的帧处于 pinned 状态，调用者载入完成后需要 [`FrameEntry::unpin`]
    pub fn allocate(&self, vm: &Vm, page: &Arc<PageDesc>) -> KResult<Arc<FrameEntry>> {
        let frame = match Frame::alloc(vm.allocator) {
            Some(frame) => frame,
            None => {
                // 只重试一次。换出的帧可能被别的核抢走，此时同样 panic
                vm.evict(None);
                Frame::alloc(vm.allocator).unwrap_or_else(|| panic!("page eviction failed"))
            }
        };
        let entry = Arc::new(FrameEntry {
            ppn: frame.ppn(),
            page: Arc::downgrade(page),
            pinned: AtomicBool::new(true),
            frame: SpinMutex::new(Some(frame)),
        });

        let mut set = self.inner.lock();
        if set.frames.contains_key(&entry.ppn) {
            // 返回后 `entry` 被 drop，物理帧随之归还
            error!("frame {:?} is registered twice", entry.ppn);
            return Err(errno::EEXIST);
        }
        set.frames.insert(entry.ppn, Arc::clone(&entry));
        Ok(entry)
    }

    /// 将帧从帧表移除并归还物理帧。需要持有帧锁，之后不应再使用该帧表项
    pub fn free(&self, mut guard: FrameGuard<'_>) {
        let ppn = guard.entry.ppn;
        let removed = self.inner.lock().frames.remove(&ppn);
        debug_assert!(
            removed.is_some_and(|e| core::ptr::eq(&*e, guard.entry)),
            "frame {ppn:?} is not in frame table"
        );
        guard.inner.take();
    }

    /// 双指针时钟算法挑选牺牲页
    ///
    /// 前指针清除所指页的访问位，后指针在所指页访问位为空时选中它。
    /// 两根指针间隔 `帧数 / HAND_SPREAD`，于是一个页被清除访问位后还有一段时间可以“自证清白”
    pub fn select_victim(&self) -> Arc<PageDesc> {
        loop {
            let mut set = self.inner.lock();
            let FrameSet { frames, hand } = &mut *set;
            let total = frames.len();
            if total == 0 {
                panic!("frame eviction failure: no frame to evict");
            }
            // 帧数可能变化，每次都重新计算间距
            let gap = if total > 1 {
                (total / HAND_SPREAD).max(1)
            } else {
                0
            };
            // 从 `hand` 开始绕帧表转圈，不需要额外分配
            let start = hand.unwrap_or(PhysPageNum(0));
            let ring = frames
                .range(start..)
                .chain(frames.range(..start))
                .map(|(_, entry)| entry)
                .cycle();
            let mut leading = ring.clone().skip(gap);
            let mut trailing = ring;
            let mut next_hand = start;

            // 没有 pin 住的帧时，两圈之内必然能找到
            for _ in 0..2 * total + gap {
                let lead = leading.next().unwrap_or_else(|| unreachable!());
                if !lead.is_pinned() {
                    if let Some(page) = lead.page() {
                        page.clear_accessed();
                    }
                }

                let candidate = trailing.next().unwrap_or_else(|| unreachable!());
                next_hand = candidate.ppn + 1;
                if candidate.is_pinned() {
                    continue;
                }
                if let Some(page) = candidate.page() {
                    if !page.is_accessed() {
                        *hand = Some(next_hand);
                        return page;
                    }
                }
            }

            // 所有帧都在载入中。放开帧表锁，让它们有机会完成
            *hand = Some(next_hand);
            drop(set);
            core::hint::spin_loop();
        }
    }
}
