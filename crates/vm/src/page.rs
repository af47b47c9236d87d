//! 页描述符：一个用户虚拟页的全部元数据，以及它在帧、交换区、文件之间的迁移

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use common::config::PAGE_SIZE;
use defines::error::{errno, KResult};
use klocks::{SpinMutex, SpinMutexGuard};

use crate::{
    frame::FrameEntry,
    frame_allocator::Frame,
    hal::{AddressSpace, BackingFile},
    swap::{SwapSlot, SwapStore},
    VirtPageNum, Vm,
};

/// 页内容在文件中的来源
#[derive(Clone)]
pub struct FileBacking {
    pub file: Arc<dyn BackingFile>,
    pub offset: usize,
    /// 页中来自文件的字节数，其余部分补零
    pub len: usize,
}

/// 一个页在任意时刻只处于其中一种状态
#[derive(Default)]
pub enum Residency {
    /// 尚未载入，或者干净地被换出。内容来自文件或者全零
    #[default]
    Unloaded,
    Resident(Arc<FrameEntry>),
    Swapped(SwapSlot),
}

impl Residency {
    fn holds(&self, entry: &Arc<FrameEntry>) -> bool {
        matches!(self, Residency::Resident(frame) if Arc::ptr_eq(frame, entry))
    }
}

/// 页描述符中可变的部分
///
/// 修改前需要持有页所在帧的帧锁（若有）。加锁顺序为帧锁在前、状态锁在后
pub struct PageState {
    pub dirty: bool,
    /// 仅 mmap 的页为 true，换出时写回文件而不是交换区
    pub mapped: bool,
    pub backing: Option<FileBacking>,
    pub residency: Residency,
}

pub struct PageDesc {
    space: Arc<dyn AddressSpace>,
    vpn: VirtPageNum,
    writable: bool,
    accessed: AtomicBool,
    state: SpinMutex<PageState>,
}

impl PageDesc {
    pub(crate) fn new(
        space: Arc<dyn AddressSpace>,
        vpn: VirtPageNum,
        writable: bool,
        backing: Option<FileBacking>,
        mapped: bool,
    ) -> Self {
        debug_assert!(backing.as_ref().map_or(true, |b| b.len <= PAGE_SIZE));
        Self {
            space,
            vpn,
            writable,
            accessed: AtomicBool::new(false),
            state: SpinMutex::new(PageState {
                dirty: false,
                mapped: mapped && backing.is_some(),
                backing,
                residency: Residency::Unloaded,
            }),
        }
    }

    pub fn vpn(&self) -> VirtPageNum {
        self.vpn
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        &self.space
    }

    pub fn is_accessed(&self) -> bool {
        self.accessed.load(Ordering::Relaxed)
    }

    pub(crate) fn set_accessed(&self) {
        self.accessed.store(true, Ordering::Relaxed);
    }

    pub(crate) fn clear_accessed(&self) {
        self.accessed.store(false, Ordering::Relaxed);
    }

    pub(crate) fn lock_state(&self) -> SpinMutexGuard<'_, PageState> {
        self.state.lock()
    }

    /// 当前所在的帧
    pub fn frame(&self) -> Option<Arc<FrameEntry>> {
        match &self.state.lock().residency {
            Residency::Resident(entry) => Some(Arc::clone(entry)),
            _ => None,
        }
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.state.lock().residency, Residency::Resident(_))
    }

    pub fn is_swapped(&self) -> bool {
        matches!(self.state.lock().residency, Residency::Swapped(_))
    }

    pub fn swap_slot(&self) -> Option<usize> {
        match &self.state.lock().residency {
            Residency::Swapped(slot) => Some(slot.index()),
            _ => None,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn is_mapped(&self) -> bool {
        self.state.lock().mapped
    }

    /// 将页的内容读入新分配的帧
    ///
    /// 从交换区读入时槽位随即被释放，返回 `true`，调用者若之后失败需要重新换出
    pub(crate) fn read_in(&self, state: &mut PageState, frame: &mut Frame, swap: &SwapStore) -> KResult<bool> {
        if let Residency::Swapped(_) = state.residency {
            let Residency::Swapped(slot) = core::mem::take(&mut state.residency) else {
                unreachable!()
            };
            swap.read(slot, frame);
            // 交换区中的副本已经没了，下次换出必须重新写
            state.dirty = true;
            return Ok(true);
        }

        let bytes = frame.as_page_bytes_mut();
        match &state.backing {
            Some(backing) => {
                let read = backing.file.read_at(&mut bytes[..backing.len], backing.offset)?;
                if read != backing.len {
                    warn!(
                        "short read for {:?}: {read} of {} bytes at offset {:#x}",
                        self.vpn, backing.len, backing.offset
                    );
                    return Err(errno::EIO);
                }
                bytes[backing.len..].fill(0);
            }
            None => bytes.fill(0),
        }
        Ok(false)
    }

    /// 将脏页的内容保存下来，返回换出后页所处的状态
    fn write_out(&self, state: &mut PageState, frame: &Frame, swap: &SwapStore) -> Residency {
        if state.mapped {
            if let Some(backing) = &state.backing {
                match backing.file.write_at(&frame.as_page_bytes()[..backing.len], backing.offset) {
                    Ok(written) if written == backing.len => {
                        state.mapped = false;
                        return Residency::Unloaded;
                    }
                    Ok(written) => warn!("short write back for {:?}: {written} of {} bytes", self.vpn, backing.len),
                    Err(e) => warn!("failed to write back {:?}: {e}", self.vpn),
                }
                // 写回失败时退而求其次放进交换区，至少不丢数据
            }
        }
        Residency::Swapped(swap.swap_out(frame))
    }
}

impl core::fmt::Debug for PageDesc {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageDesc")
            .field("vpn", &self.vpn)
            .field("writable", &self.writable)
            .field("accessed", &self.is_accessed())
            .finish_non_exhaustive()
    }
}

/// 换出时如何处理页的内容
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum Persist {
    /// 页之后还会被访问，脏数据需要保存
    Keep,
    /// 页即将被销毁，只需要把 mmap 的修改写回文件
    Discard,
}

impl Vm {
    /// 换出一个页
    ///
    /// `page` 为 `None` 时由时钟算法挑选牺牲页；否则换出指定的页（比如进程退出时）。
    /// 页描述符本身保留，只是不再对应任何帧
    pub fn evict(&self, page: Option<&Arc<PageDesc>>) {
        match page {
            Some(page) => {
                self.reclaim(page, Persist::Keep);
            }
            None => loop {
                let victim = self.frames.select_victim();
                if self.reclaim(&victim, Persist::Keep) {
                    return;
                }
                // 在加上帧锁之前，牺牲页已经被别的核换出了
            },
        }
    }

    /// 返回是否真的释放了一个帧
    pub(crate) fn reclaim(&self, page: &Arc<PageDesc>, persist: Persist) -> bool {
        let Some(entry) = page.frame() else {
            page.space.invalidate(page.vpn);
            return false;
        };
        let Some(frame) = entry.lock() else {
            return false;
        };
        let mut state = page.lock_state();
        if !state.residency.holds(&entry) {
            return false;
        }

        if !state.dirty {
            state.dirty = page.space.is_dirty(page.vpn);
        }
        // 先撤销映射再保存内容，之后的写入都会缺页并等待帧锁
        page.space.invalidate(page.vpn);
        state.residency = if !state.dirty || (persist == Persist::Discard && !state.mapped) {
            Residency::Unloaded
        } else {
            page.write_out(&mut state, &frame, &self.swap)
        };
        debug!(
            "evict {:?} from {:?}{}",
            page.vpn,
            entry.ppn(),
            match state.residency {
                Residency::Swapped(ref slot) => alloc::format!(" to swap slot {}", slot.index()),
                _ => alloc::string::String::new(),
            }
        );
        self.frames.free(frame);
        true
    }
}
