//! 用户态虚存管理：物理帧表、交换区与按需分页
//!
//! 所有地址空间共享同一个 [`Vm`]，其中的帧表记录了所有分配给用户页的物理帧，
//! 物理内存不足时用双指针时钟算法挑选牺牲页换出到交换区或写回文件。
//! 每个地址空间各自持有一张 [`PageTable`]，缺页时由它负责载入

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

mod address;
mod frame;
mod frame_allocator;
mod hal;
mod page;
mod page_table;
mod swap;

#[cfg(test)]
mod test_utils;

use alloc::boxed::Box;

use klocks::Once;

pub use self::address::{PhysPageNum, VirtAddr, VirtPageNum};
pub use self::frame::{FrameEntry, FrameGuard, FrameTable};
pub use self::frame_allocator::{BuddyFramePool, Frame, FrameAllocator};
pub use self::hal::{AddressSpace, BackingFile, BlockDevice, MapPermission};
pub use self::page::{FileBacking, PageDesc};
pub use self::page_table::PageTable;
pub use self::swap::{SwapSlot, SwapStore};

pub struct Vm {
    pub(crate) allocator: &'static dyn FrameAllocator,
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapStore,
}

impl Vm {
    pub fn new(allocator: &'static dyn FrameAllocator, swap_device: Box<dyn BlockDevice>) -> Self {
        Self {
            allocator,
            frames: FrameTable::new(),
            swap: SwapStore::new(swap_device),
        }
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }
}

static VM: Once<Vm> = Once::new();

/// 初始化虚存模块，重复调用时只有第一次生效
pub fn init(allocator: &'static dyn FrameAllocator, swap_device: Box<dyn BlockDevice>) -> &'static Vm {
    VM.call_once(|| {
        info!("init virtual memory");
        Vm::new(allocator, swap_device)
    })
}

/// # Panics
///
/// 在 [`init`] 之前调用
pub fn vm() -> &'static Vm {
    match VM.get() {
        Some(vm) => vm,
        None => panic!("virtual memory is not initialized"),
    }
}
