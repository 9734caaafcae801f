//! Statically allocated task stacks.
//!
//! A [`Stack`] reserves an aligned byte region in static storage; the first
//! (and only) [`Stack::take`] hands out a [`StackRefMut`] describing the
//! region to whatever builds a task on top of it.

use aligned::{A16, Aligned};
use static_cell::ConstStaticCell;

/// Byte pattern written to the low end of a stack when it is taken. A
/// watermark check can later tell how deep the task actually went.
pub const STACK_CANARY: u8 = 0x55;
const CANARY_LEN: usize = 16;

/// Statically allocated stack region of `SIZE` bytes, aligned for any task
/// continuation record placed at its top.
pub struct Stack<const SIZE: usize> {
    region: ConstStaticCell<Aligned<A16, [u8; SIZE]>>,
}

impl<const SIZE: usize> Stack<SIZE> {
    pub const fn new() -> Stack<SIZE> {
        Stack {
            region: ConstStaticCell::new(Aligned([0; SIZE])),
        }
    }

    /// Claim the region. Panics if the stack was already taken.
    pub fn take(&'static self) -> StackRefMut {
        let region = self.region.take();
        region[..CANARY_LEN].fill(STACK_CANARY);
        StackRefMut {
            bottom: region.as_mut_ptr(),
            size: SIZE,
        }
    }
}

/// Exclusive reference to a taken stack region.
pub struct StackRefMut {
    bottom: *mut u8,
    size: usize,
}

unsafe impl Send for StackRefMut {}

impl StackRefMut {
    /// Highest address of the region, exclusive. Stacks grow downward from
    /// here.
    pub fn top_ptr(&mut self) -> *mut u8 {
        unsafe { self.bottom.add(self.size) }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the canary at the low end is still intact. A task that
    /// consumed its whole stack overwrites it on the way past.
    pub fn canary_intact(&self) -> bool {
        let low = unsafe { core::slice::from_raw_parts(self.bottom, CANARY_LEN) };
        low.iter().all(|&byte| byte == STACK_CANARY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_marks_the_low_end() {
        static STACK: Stack<32768> = Stack::new();
        let mut stack = STACK.take();
        assert!(stack.canary_intact());
        assert_eq!(stack.size(), 32768);
        let top = stack.top_ptr() as usize;
        assert_eq!(top % 16, 0);
    }
}
