//! 物理页帧的分配。虚存模块通过 [`FrameAllocator`] 申请和归还物理页，
//! [`BuddyFramePool`] 是基于伙伴系统的实现

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use common::config::PAGE_SIZE;
use klocks::SpinMutex;

use crate::PhysPageNum;

pub trait FrameAllocator: Send + Sync {
    fn alloc(&self) -> Option<PhysPageNum>;

    /// # Safety
    ///
    /// 需要保证 `ppn` 之前确实由该分配器分配，且不再被使用
    unsafe fn dealloc(&self, ppn: PhysPageNum);

    /// 物理页在内核地址空间中的位置
    fn frame_ptr(&self, ppn: PhysPageNum) -> NonNull<[u8; PAGE_SIZE]>;
}

/// 独占的一个物理页帧，drop 时归还给分配器
pub struct Frame {
    ppn: PhysPageNum,
    allocator: &'static dyn FrameAllocator,
}

impl Frame {
    /// 分配并清空一个物理页帧
    pub fn alloc(allocator: &'static dyn FrameAllocator) -> Option<Self> {
        let ppn = allocator.alloc()?;
        let mut frame = Self { ppn, allocator };
        frame.clear();
        Some(frame)
    }

    pub fn ppn(&self) -> PhysPageNum {
        self.ppn
    }

    pub fn clear(&mut self) {
        self.as_page_bytes_mut().fill(0);
    }

    pub fn as_page_bytes(&self) -> &[u8; PAGE_SIZE] {
        // SAFETY: 该帧由 `self` 独占，共享借用期间没有其他写者
        unsafe { self.allocator.frame_ptr(self.ppn).as_ref() }
    }

    pub fn as_page_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        // SAFETY: 该帧由 `self` 独占，可变借用期间没有其他访问者
        unsafe { self.allocator.frame_ptr(self.ppn).as_mut() }
    }
}

impl core::fmt::Debug for Frame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Frame").field("ppn", &self.ppn).finish()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        unsafe {
            self.allocator.dealloc(self.ppn);
        }
    }
}

/// 基于伙伴系统管理一段连续物理内存的分配器
pub struct BuddyFramePool {
    base: NonNull<u8>,
    first_ppn: PhysPageNum,
    total: usize,
    free: AtomicUsize,
    allocator: SpinMutex<buddy_system_allocator::FrameAllocator>,
}

// SAFETY: `base` 指向的内存只通过分配出去的 `Frame` 独占访问
unsafe impl Send for BuddyFramePool {}
unsafe impl Sync for BuddyFramePool {}

impl BuddyFramePool {
    /// 管理从 `base` 开始的 `total` 个物理页，第一个页的页号为 `first_ppn`
    ///
    /// # Safety
    ///
    /// `base` 需要页对齐，且 `base..base + total * PAGE_SIZE` 在整个生命周期内可读写、不被别处使用
    pub unsafe fn new(base: NonNull<u8>, total: usize, first_ppn: PhysPageNum) -> Self {
        debug_assert!(base.as_ptr() as usize % PAGE_SIZE == 0);
        let mut allocator: buddy_system_allocator::FrameAllocator =
            buddy_system_allocator::FrameAllocator::new();
        allocator.add_frame(0, total);
        Self {
            base,
            first_ppn,
            total,
            free: AtomicUsize::new(total),
            allocator: SpinMutex::new(allocator),
        }
    }

    pub fn total_frames(&self) -> usize {
        self.total
    }

    pub fn free_frames(&self) -> usize {
        self.free.load(Ordering::Relaxed)
    }

    fn index_of(&self, ppn: PhysPageNum) -> usize {
        debug_assert!(ppn >= self.first_ppn && ppn.0 - self.first_ppn.0 < self.total);
        ppn.0 - self.first_ppn.0
    }
}

impl FrameAllocator for BuddyFramePool {
    fn alloc(&self) -> Option<PhysPageNum> {
        let index = self.allocator.lock().alloc(1)?;
        self.free.fetch_sub(1, Ordering::Relaxed);
        Some(self.first_ppn + index)
    }

    unsafe fn dealloc(&self, ppn: PhysPageNum) {
        let index = self.index_of(ppn);
        self.allocator.lock().dealloc(index, 1);
        self.free.fetch_add(1, Ordering::Relaxed);
    }

    fn frame_ptr(&self, ppn: PhysPageNum) -> NonNull<[u8; PAGE_SIZE]> {
        let index = self.index_of(ppn);
        // SAFETY: `index < total`，不会越过所管理的区域
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index * PAGE_SIZE).cast()) }
    }
}
