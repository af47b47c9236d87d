//! 虚存模块依赖的外部组件：地址空间（页表与 MMU）、文件、块设备
//!
//! 这些都由内核的其他部分实现，这里只约定接口

use bitflags::bitflags;
use common::config::SECTOR_SIZE;
use defines::error::KResult;

use crate::{PhysPageNum, VirtAddr, VirtPageNum};

bitflags! {
    /// 对应于 PTE 中权限位的映射权限：`R W X U`
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapPermission: u8 {
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
    }
}

impl MapPermission {
    /// 用户页的映射权限
    pub fn user(writable: bool) -> Self {
        if writable {
            Self::R | Self::W | Self::U
        } else {
            Self::R | Self::U
        }
    }
}

/// 某个执行上下文的地址空间
///
/// 脏位由硬件在写入时置位，虚存模块只负责读取，不关心它如何被记录
pub trait AddressSpace: Send + Sync {
    /// 建立 `vpn -> ppn` 的映射。页表帧不足等情况下会失败
    fn install(&self, vpn: VirtPageNum, ppn: PhysPageNum, perm: MapPermission) -> KResult<()>;

    /// 移除映射（若存在），之后的访问会再次缺页。需要负责刷新 TLB
    fn invalidate(&self, vpn: VirtPageNum);

    /// 映射建立以来该页是否被写过
    fn is_dirty(&self, vpn: VirtPageNum) -> bool;

    /// 陷入内核时记录的用户栈指针
    fn stack_pointer(&self) -> VirtAddr;
}

/// 可以按偏移读写的文件
pub trait BackingFile: Send + Sync {
    /// 返回实际读到的字节数，到达文件末尾时可能少于 `buf.len()`
    fn read_at(&self, buf: &mut [u8], offset: usize) -> KResult<usize>;

    fn write_at(&self, buf: &[u8], offset: usize) -> KResult<usize>;
}

/// 块设备的抽象，读写都以扇区为单位进行
pub trait BlockDevice: Send {
    /// 设备的扇区总数
    fn num_blocks(&self) -> usize;
    fn read_block(&mut self, block_id: usize, buf: &mut [u8; SECTOR_SIZE]);
    fn write_block(&mut self, block_id: usize, buf: &[u8; SECTOR_SIZE]);
}
