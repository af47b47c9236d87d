//! 测试用的外部组件：内存中的块设备与文件，以及模拟 MMU 的地址空间

use alloc::{boxed::Box, vec, vec::Vec};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::collections::HashMap;

use common::config::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE, USER_SPACE_END};
use defines::error::{errno, KResult};
use klocks::SpinMutex;

use crate::{
    AddressSpace, BackingFile, BlockDevice, BuddyFramePool, MapPermission, PageTable, PhysPageNum, VirtAddr,
    VirtPageNum, Vm,
};

struct StdoutConsole;

impl simple_logger::Console for StdoutConsole {
    fn write_str(&self, s: &str) {
        print!("{s}");
    }
}

/// 日志级别同样由 `KERNEL_CLOG` 决定，默认不输出
pub fn init_logger() {
    simple_logger::init(&StdoutConsole);
}

#[repr(C, align(4096))]
struct PageBuf([u8; PAGE_SIZE]);

/// 泄漏一块页对齐的内存，交给伙伴系统管理
pub fn leak_pool(frames: usize) -> &'static BuddyFramePool {
    let pages: &'static mut [PageBuf] = (0..frames).map(|_| PageBuf([0; PAGE_SIZE])).collect::<Vec<_>>().leak();
    let base = NonNull::new(pages.as_mut_ptr().cast::<u8>()).unwrap();
    // SAFETY: 内存已泄漏，永远不会被别处使用
    let pool = unsafe { BuddyFramePool::new(base, frames, PhysPageNum(0x8_0000)) };
    Box::leak(Box::new(pool))
}

/// `frames` 个物理帧、`swap_pages` 个交换槽位的虚存实例
pub fn leak_vm(frames: usize, swap_pages: usize) -> (&'static Vm, &'static BuddyFramePool) {
    let pool = leak_pool(frames);
    let disk = RamDisk::new(swap_pages * SECTORS_PER_PAGE);
    let vm = Box::leak(Box::new(Vm::new(pool, Box::new(disk))));
    (vm, pool)
}

pub struct RamDisk {
    sectors: Vec<[u8; SECTOR_SIZE]>,
}

impl RamDisk {
    pub fn new(sectors: usize) -> Self {
        Self {
            sectors: vec![[0; SECTOR_SIZE]; sectors],
        }
    }
}

impl BlockDevice for RamDisk {
    fn num_blocks(&self) -> usize {
        self.sectors.len()
    }

    fn read_block(&mut self, block_id: usize, buf: &mut [u8; SECTOR_SIZE]) {
        buf.copy_from_slice(&self.sectors[block_id]);
    }

    fn write_block(&mut self, block_id: usize, buf: &[u8; SECTOR_SIZE]) {
        self.sectors[block_id].copy_from_slice(buf);
    }
}

pub struct MemFile {
    data: SpinMutex<Vec<u8>>,
    read_only: AtomicBool,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: SpinMutex::new(data),
            read_only: AtomicBool::new(false),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// 只读时所有写入都失败
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::Relaxed);
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> KResult<usize> {
        let data = self.data.lock();
        if offset >= data.len() {
            return Ok(0);
        }
        let len = buf.len().min(data.len() - offset);
        buf[..len].copy_from_slice(&data[offset..offset + len]);
        Ok(len)
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> KResult<usize> {
        if self.read_only.load(Ordering::Relaxed) {
            return Err(errno::EPERM);
        }
        let mut data = self.data.lock();
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}

struct Pte {
    ppn: PhysPageNum,
    perm: MapPermission,
    dirty: bool,
}

/// 模拟一个地址空间的页表与 MMU
///
/// 访问未映射的地址时和硬件一样陷入缺页处理，写入时设置脏位。
/// 访问在帧锁下进行，其他线程无法在访问途中换出该页
pub struct MockSpace {
    ptes: SpinMutex<HashMap<VirtPageNum, Pte>>,
    sp: AtomicUsize,
    fail_install: AtomicBool,
}

impl MockSpace {
    pub fn new() -> Self {
        Self {
            ptes: SpinMutex::new(HashMap::new()),
            sp: AtomicUsize::new(USER_SPACE_END),
            fail_install: AtomicBool::new(false),
        }
    }

    pub fn set_sp(&self, sp: VirtAddr) {
        self.sp.store(sp.0, Ordering::Relaxed);
    }

    /// 之后的 `install` 都返回 `ENOMEM`
    pub fn set_fail_install(&self, fail: bool) {
        self.fail_install.store(fail, Ordering::Relaxed);
    }

    pub fn is_mapped(&self, vpn: VirtPageNum) -> bool {
        self.ptes.lock().contains_key(&vpn)
    }

    /// 锁住 `addr` 所在页的帧后访问其内容，未映射时先缺页
    fn access<R>(&self, table: &PageTable, addr: VirtAddr, write: bool, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        let vpn = addr.vpn_floor();
        loop {
            if !self.is_mapped(vpn) {
                assert!(table.handle_memory_exception(addr.0), "segmentation fault at {addr:?}");
            }
            // 缺页处理返回后页仍可能被别的线程换出，拿到帧锁之后才算数
            let Some(entry) = table.get(addr).and_then(|page| page.frame()) else {
                continue;
            };
            let Some(mut frame) = entry.lock() else {
                continue;
            };
            // 驻留的页一定已经映射，且持有帧锁时映射不会被撤销
            let mut ptes = self.ptes.lock();
            let pte = ptes.get_mut(&vpn).unwrap();
            assert_eq!(pte.ppn, frame.ppn());
            if write {
                assert!(pte.perm.contains(MapPermission::W), "write to read-only {addr:?}");
                pte.dirty = true;
            }
            drop(ptes);
            return f(frame.as_page_bytes_mut());
        }
    }

    /// 用户程序写入 `addr`，不能跨页
    pub fn store(&self, table: &PageTable, addr: VirtAddr, bytes: &[u8]) {
        let offset = addr.page_offset();
        assert!(offset + bytes.len() <= PAGE_SIZE);
        self.access(table, addr, true, |page| {
            page[offset..offset + bytes.len()].copy_from_slice(bytes);
        });
    }

    /// 用户程序读取 `addr` 开始的 `len` 个字节，不能跨页
    pub fn load(&self, table: &PageTable, addr: VirtAddr, len: usize) -> Vec<u8> {
        let offset = addr.page_offset();
        assert!(offset + len <= PAGE_SIZE);
        self.access(table, addr, false, |page| page[offset..offset + len].to_vec())
    }
}

impl AddressSpace for MockSpace {
    fn install(&self, vpn: VirtPageNum, ppn: PhysPageNum, perm: MapPermission) -> KResult<()> {
        if self.fail_install.load(Ordering::Relaxed) {
            return Err(errno::ENOMEM);
        }
        let old = self.ptes.lock().insert(
            vpn,
            Pte {
                ppn,
                perm,
                dirty: false,
            },
        );
        assert!(old.is_none(), "{vpn:?} is mapped twice");
        Ok(())
    }

    fn invalidate(&self, vpn: VirtPageNum) {
        self.ptes.lock().remove(&vpn);
    }

    fn is_dirty(&self, vpn: VirtPageNum) -> bool {
        self.ptes.lock().get(&vpn).is_some_and(|pte| pte.dirty)
    }

    fn stack_pointer(&self) -> VirtAddr {
        VirtAddr(self.sp.load(Ordering::Relaxed))
    }
}
