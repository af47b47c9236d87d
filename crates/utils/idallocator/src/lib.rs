#![cfg_attr(not(test), no_std)]

use alloc::{boxed::Box, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

extern crate alloc;

const BITS: usize = usize::BITS as usize;

/// 基于位图的分配器，总是分配编号最小的空闲 id
///
/// 占用情况逐 bit 记录。分配时找到空闲位并用 CAS 将其置位，
/// 查找与占用是一个不可分割的操作，因此多个核同时分配也不会拿到同一个 id
pub struct BitmapAllocator {
    words: Box<[AtomicUsize]>,
    len: usize,
    allocated: AtomicUsize,
}

impl BitmapAllocator {
    /// 可分配 `0..len` 范围内的 id
    pub fn new(len: usize) -> Self {
        let mut words: Vec<AtomicUsize> = (0..len.div_ceil(BITS)).map(|_| AtomicUsize::new(0)).collect();
        // 最后一个字中超出 `len` 的部分视为已占用，这样就永远不会被分配出去
        let tail = len % BITS;
        if tail != 0 {
            if let Some(last) = words.last_mut() {
                *last.get_mut() = !((1 << tail) - 1);
            }
        }
        Self {
            words: words.into_boxed_slice(),
            len,
            allocated: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 当前已分配出去的 id 数量
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn alloc(&self) -> Option<usize> {
        for (index, word) in self.words.iter().enumerate() {
            let mut current = word.load(Ordering::Relaxed);
            while current != usize::MAX {
                let bit = (!current).trailing_zeros() as usize;
                match word.compare_exchange_weak(
                    current,
                    current | (1 << bit),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.allocated.fetch_add(1, Ordering::Relaxed);
                        return Some(index * BITS + bit);
                    }
                    Err(actual) => current = actual,
                }
            }
        }
        None
    }

    pub fn dealloc(&self, id: usize) {
        debug_assert!(id < self.len);
        let mask = 1 << (id % BITS);
        let prev = self.words[id / BITS].fetch_and(!mask, Ordering::AcqRel);
        debug_assert!(prev & mask != 0, "id {id} has been deallocated!");
        self.allocated.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn is_allocated(&self, id: usize) -> bool {
        debug_assert!(id < self.len);
        self.words[id / BITS].load(Ordering::Acquire) & (1 << (id % BITS)) != 0
    }
}
