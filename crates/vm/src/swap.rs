//! 交换区：以页为单位的槽位，每个槽位占据块设备上连续的 `SECTORS_PER_PAGE` 个扇区

use alloc::boxed::Box;

use common::config::{SECTORS_PER_PAGE, SECTOR_SIZE};
use idallocator::BitmapAllocator;
use klocks::SpinMutex;

use crate::{frame_allocator::Frame, hal::BlockDevice};

/// 交换区中的一个槽位。只在页被换出期间存在
#[derive(Debug, PartialEq, Eq)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(&self) -> usize {
        self.0
    }

    fn first_sector(&self) -> usize {
        self.0 * SECTORS_PER_PAGE
    }
}

pub struct SwapStore {
    device: SpinMutex<Box<dyn BlockDevice>>,
    slots: BitmapAllocator,
}

#[extend::ext(name = AsSectors)]
impl Frame {
    fn sector(&self, index: usize) -> &[u8; SECTOR_SIZE] {
        let start = index * SECTOR_SIZE;
        self.as_page_bytes()[start..start + SECTOR_SIZE].try_into().unwrap_or_else(|_| unreachable!())
    }

    fn sector_mut(&mut self, index: usize) -> &mut [u8; SECTOR_SIZE] {
        let start = index * SECTOR_SIZE;
        (&mut self.as_page_bytes_mut()[start..start + SECTOR_SIZE]).try_into().unwrap_or_else(|_| unreachable!())
    }
}

impl SwapStore {
    /// 设备末尾不足一页的扇区不会被使用
    pub fn new(device: Box<dyn BlockDevice>) -> Self {
        let slots = device.num_blocks() / SECTORS_PER_PAGE;
        info!("swap area: {slots} slots");
        Self {
            device: SpinMutex::new(device),
            slots: BitmapAllocator::new(slots),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn used_slots(&self) -> usize {
        self.slots.allocated()
    }

    /// 占用编号最小的空闲槽位。交换区耗尽时没有办法恢复，直接 panic
    pub fn allocate_slot(&self) -> SwapSlot {
        match self.slots.alloc() {
            Some(index) => SwapSlot(index),
            None => panic!("no swap slot available"),
        }
    }

    /// 归还一个不会再被读回的槽位
    pub fn free_slot(&self, slot: SwapSlot) {
        self.slots.dealloc(slot.0);
    }

    /// 将整页写入槽位。`frame` 只能通过帧锁拿到，因此调用者必然持有帧锁
    pub fn write(&self, slot: &SwapSlot, frame: &Frame) {
        debug_assert!(self.slots.is_allocated(slot.0));
        let mut device = self.device.lock();
        for i in 0..SECTORS_PER_PAGE {
            device.write_block(slot.first_sector() + i, frame.sector(i));
        }
    }

    /// 将槽位中的页读入 `frame`，随后释放该槽位
    pub fn read(&self, slot: SwapSlot, frame: &mut Frame) {
        debug_assert!(self.slots.is_allocated(slot.0));
        {
            let mut device = self.device.lock();
            for i in 0..SECTORS_PER_PAGE {
                device.read_block(slot.first_sector() + i, frame.sector_mut(i));
            }
        }
        self.free_slot(slot);
    }

    /// 分配一个槽位并写入
    pub(crate) fn swap_out(&self, frame: &Frame) -> SwapSlot {
        let slot = self.allocate_slot();
        self.write(&slot, frame);
        slot
    }
}
