#[allow(non_upper_case_globals)]
pub const KiB: usize = 1024;
#[allow(non_upper_case_globals)]
pub const MiB: usize = 1024 * KiB;

/// 一个页大小的 bit 数
pub const PAGE_SIZE_BITS: usize = 12;
/// 页大小
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;

/// 块设备扇区大小
pub const SECTOR_SIZE: usize = 512;
/// 一页在交换区中占据的扇区数
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// 用户地址空间的末端（不含），即 Sv39 低地址的 256GiB 处
///
/// 用户栈从这里向下增长
pub const USER_SPACE_END: usize = 0x40_0000_0000;

/// 用户栈的最大大小
pub const USER_STACK_SIZE: usize = 8 * MiB;

/// 缺页地址允许低于栈指针的距离。`push` 一类指令会先访存再移动栈指针
pub const STACK_SLACK: usize = 32;

/// 时钟算法中，两根指针的间距为帧数除以该值
pub const HAND_SPREAD: usize = 4;
