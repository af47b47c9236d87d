//! 每个地址空间一张的补充页表：虚拟页号到页描述符的映射，负责按需载入与栈增长

use alloc::sync::Arc;

use common::config::{PAGE_SIZE, STACK_SLACK, USER_SPACE_END, USER_STACK_SIZE};
use defines::error::{errno, KResult};
use hashbrown::{hash_map::Entry, HashMap};
use klocks::SpinMutex;
use scopeguard::{defer, ScopeGuard};
use smallvec::SmallVec;

use crate::{
    hal::{AddressSpace, MapPermission},
    page::{FileBacking, PageDesc, Persist, Residency},
    VirtAddr, VirtPageNum, Vm,
};

pub struct PageTable {
    vm: &'static Vm,
    space: Arc<dyn AddressSpace>,
    pages: SpinMutex<HashMap<VirtPageNum, Arc<PageDesc>>>,
}

impl PageTable {
    pub fn new(vm: &'static Vm, space: Arc<dyn AddressSpace>) -> Self {
        Self {
            vm,
            space,
            pages: SpinMutex::new(HashMap::new()),
        }
    }

    pub fn space(&self) -> &Arc<dyn AddressSpace> {
        &self.space
    }

    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 查找地址所在页的描述符，不会增长栈。可用于检查用户指针
    pub fn get(&self, addr: VirtAddr) -> Option<Arc<PageDesc>> {
        if !addr.is_user() {
            return None;
        }
        self.pages.lock().get(&addr.vpn_floor()).cloned()
    }

    /// 查找地址所在页的描述符。若不存在，但地址看起来是对栈的访问，则增长栈
    ///
    /// 栈访问指：地址落在栈能达到的最大范围内，且不低于栈指针超过 `STACK_SLACK` 字节
    fn get_or_grow(&self, addr: VirtAddr) -> KResult<Arc<PageDesc>> {
        if !addr.is_user() {
            return Err(errno::EFAULT);
        }
        let vpn = addr.vpn_floor();
        let mut pages = self.pages.lock();
        if let Some(page) = pages.get(&vpn) {
            return Ok(Arc::clone(page));
        }

        let sp = self.space.stack_pointer();
        if vpn.page_start().0 < USER_SPACE_END - USER_STACK_SIZE || addr.0 + STACK_SLACK < sp.0 {
            return Err(errno::EFAULT);
        }
        trace!("grow user stack to {vpn:?} (sp = {sp:?})");
        let page = Arc::new(PageDesc::new(Arc::clone(&self.space), vpn, true, None, false));
        pages.insert(vpn, Arc::clone(&page));
        Ok(page)
    }

    fn insert(&self, addr: VirtAddr, page: PageDesc) -> KResult<Arc<PageDesc>> {
        match self.pages.lock().entry(addr.vpn_floor()) {
            Entry::Occupied(_) => Err(errno::EEXIST),
            Entry::Vacant(vacant) => Ok(Arc::clone(vacant.insert(Arc::new(page)))),
        }
    }

    /// 为地址所在页创建一个未载入的匿名页，首次访问时补零
    pub fn allocate(&self, addr: VirtAddr, writable: bool) -> KResult<Arc<PageDesc>> {
        if !addr.is_user() {
            return Err(errno::EFAULT);
        }
        self.insert(
            addr,
            PageDesc::new(Arc::clone(&self.space), addr.vpn_floor(), writable, None, false),
        )
    }

    /// 为地址所在页创建一个由文件提供内容的页
    ///
    /// `mapped` 为真时是 mmap 的页，换出时写回文件；否则是程序段，换出时只会进入交换区
    pub fn map_file(
        &self,
        addr: VirtAddr,
        backing: FileBacking,
        writable: bool,
        mapped: bool,
    ) -> KResult<Arc<PageDesc>> {
        if !addr.is_user() {
            return Err(errno::EFAULT);
        }
        if backing.len > PAGE_SIZE {
            return Err(errno::EINVAL);
        }
        self.insert(
            addr,
            PageDesc::new(
                Arc::clone(&self.space),
                addr.vpn_floor(),
                writable,
                Some(backing),
                mapped,
            ),
        )
    }

    /// 处理缺页，确保地址所在页驻留在内存中并建立映射
    ///
    /// 依次尝试交换区、文件、补零载入页的内容。任何一步失败，已分配的帧都会被释放，
    /// 页回到原先的状态
    pub fn resolve_fault(&self, addr: VirtAddr) -> KResult<Arc<PageDesc>> {
        let page = self.get_or_grow(addr)?;
        // 非驻留的页不会被选为牺牲页，持有其状态锁分配帧是安全的
        let mut state = page.lock_state();
        if let Residency::Resident(_) = state.residency {
            drop(state);
            page.set_accessed();
            return Ok(page);
        }

        let vm = self.vm;
        let entry = vm.frames.allocate(vm, &page)?;
        defer! {
            entry.unpin();
        }
        let guard = entry.lock().unwrap_or_else(|| unreachable!());
        let mut frame = scopeguard::guard(guard, |frame| vm.frames.free(frame));

        let from_swap = page.read_in(&mut state, &mut frame, &vm.swap)?;
        if let Err(e) = self
            .space
            .install(page.vpn(), frame.ppn(), MapPermission::user(page.writable()))
        {
            warn!("failed to install {:?} -> {:?}: {e}", page.vpn(), frame.ppn());
            if from_swap {
                state.residency = Residency::Swapped(vm.swap.swap_out(&frame));
            }
            return Err(e);
        }

        trace!("load {:?} into {:?}", page.vpn(), frame.ppn());
        state.residency = Residency::Resident(Arc::clone(&entry));
        drop(ScopeGuard::into_inner(frame));
        drop(state);
        page.set_accessed();
        Ok(page)
    }

    /// 缺页异常的入口。返回 `false` 表示无法处理，由调用者终止进程
    pub fn handle_memory_exception(&self, addr: usize) -> bool {
        trace!("handle page fault for {addr:#x}");
        match self.resolve_fault(VirtAddr(addr)) {
            Ok(_) => true,
            Err(e) => {
                warn!("unresolvable page fault at {addr:#x}: {e}");
                false
            }
        }
    }

    /// 移除地址所在的页。mmap 页的修改会被写回文件，其他内容直接丢弃
    pub fn unmap(&self, addr: VirtAddr) -> KResult<()> {
        let page = self
            .pages
            .lock()
            .remove(&addr.vpn_floor())
            .ok_or(errno::EINVAL)?;
        self.release(&page);
        Ok(())
    }

    /// 释放所有的页，之后页表为空
    pub fn destroy(&self) {
        let pages: SmallVec<[Arc<PageDesc>; 16]> = self.pages.lock().drain().map(|(_, page)| page).collect();
        if !pages.is_empty() {
            debug!("destroy page table with {} pages", pages.len());
        }
        for page in &pages {
            self.release(page);
        }
    }

    fn release(&self, page: &Arc<PageDesc>) {
        while page.is_resident() {
            self.vm.reclaim(page, Persist::Discard);
        }
        let mut state = page.lock_state();
        if let Residency::Swapped(slot) = core::mem::take(&mut state.residency) {
            self.vm.swap.free_slot(slot);
        }
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        self.destroy();
    }
}
