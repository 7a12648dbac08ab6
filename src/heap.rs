//! Dynamic allocator living at the top of memory.

use crate::memory::Memory;
use anyhow::bail;

/// An extent of heap memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub addr: u32,
    pub size: u32,
}

impl Block {
    fn end(&self) -> u32 {
        self.addr + self.size
    }
}

/// Address-ordered used and free block lists. The heap is active while any
/// block is in use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Heap {
    start: u32,
    used: Vec<Block>,
    free: Vec<Block>,
}

/// Index of `addr` in `list`, or of the first block above it.
fn search(list: &[Block], addr: u32) -> usize {
    list.partition_point(|block| block.addr < addr)
}

impl Heap {
    pub fn is_active(&self) -> bool {
        !self.used.is_empty()
    }

    /// Start address of the heap, or 0 when inactive.
    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn used(&self) -> &[Block] {
        &self.used
    }

    pub fn free_blocks(&self) -> &[Block] {
        &self.free
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.used.clear();
        self.free.clear();
    }

    /// Rebuild the heap from its start and used blocks; free blocks are the
    /// gaps up to `end_mem`.
    pub fn rebuild(start: u32, used: Vec<Block>, end_mem: u32) -> anyhow::Result<Self> {
        let mut free = Vec::new();
        let mut heap_end = start;
        for block in &used {
            if block.size == 0 || block.addr < heap_end || block.addr as u64 + block.size as u64 > end_mem as u64 {
                bail!("Corrupt dynamic heap.");
            }
            if block.addr > heap_end {
                free.push(Block {
                    addr: heap_end,
                    size: block.addr - heap_end,
                });
            }
            heap_end = block.end();
        }
        if heap_end < end_mem {
            free.push(Block {
                addr: heap_end,
                size: end_mem - heap_end,
            });
        }
        let start = if used.is_empty() { 0 } else { start };
        let free = if used.is_empty() { Vec::new() } else { free };
        Ok(Heap { start, used, free })
    }

    /// Allocate `size` bytes, growing memory when no free block fits.
    /// A zero size (or one with the sign bit set) yields 0.
    pub fn malloc(&mut self, mem: &mut Memory, size: u32) -> anyhow::Result<u32> {
        if size == 0 || size & 0x8000_0000 != 0 {
            return Ok(0);
        }
        if !self.is_active() {
            self.start = mem.end_mem();
        }

        if let Some(ix) = self.free.iter().position(|block| block.size >= size) {
            let block = self.free[ix];
            if block.size > size {
                self.free[ix] = Block {
                    addr: block.addr + size,
                    size: block.size - size,
                };
            } else {
                self.free.remove(ix);
            }
            let pos = search(&self.used, block.addr);
            self.used.insert(pos, Block {
                addr: block.addr,
                size,
            });
            return Ok(block.addr);
        }

        let addr = mem.end_mem();
        let rounded = match size.checked_add(0xFF) {
            Some(v) => v & !0xFF,
            None => bail!("Heap allocation too large."),
        };
        if addr.checked_add(rounded).is_none() {
            bail!("Heap allocation too large.");
        }
        mem.resize(addr + rounded)?;
        if rounded > size {
            self.free.push(Block {
                addr: addr + size,
                size: rounded - size,
            });
        }
        self.used.push(Block { addr, size });
        Ok(addr)
    }

    /// Release the block at `addr`. Freeing the last block shrinks memory
    /// back to the heap start.
    pub fn free(&mut self, mem: &mut Memory, addr: u32) -> anyhow::Result<()> {
        let pos = search(&self.used, addr);
        let mut block = match self.used.get(pos) {
            Some(block) if block.addr == addr => *block,
            _ => bail!("Tried to free non-existent block."),
        };
        self.used.remove(pos);

        if self.used.is_empty() {
            mem.resize(self.start)?;
            self.clear();
            return Ok(());
        }

        let mut pos = search(&self.free, addr);
        if let Some(next) = self.free.get(pos).copied() {
            if next.addr == block.end() {
                block.size += next.size;
                self.free.remove(pos);
            }
        }
        if pos > 0 {
            let prev = self.free[pos - 1];
            if prev.end() == block.addr {
                block = Block {
                    addr: prev.addr,
                    size: prev.size + block.size,
                };
                self.free.remove(pos - 1);
                pos -= 1;
            }
        }
        self.free.insert(pos, block);
        Ok(())
    }

    /// Confirm the used and free lists tile `[start, end_mem)` exactly.
    pub fn check(&self, end_mem: u32) -> anyhow::Result<()> {
        if !self.is_active() {
            if self.start != 0 {
                bail!("Heap inconsistency: heapstart nonzero.");
            }
            if !self.free.is_empty() {
                bail!("Heap inconsistency: free list nonempty.");
            }
            return Ok(());
        }
        if self.start == 0 {
            bail!("Heap inconsistency: heapstart is zero.");
        }

        let mut addr = self.start;
        let (mut upos, mut fpos) = (0, 0);
        while upos < self.used.len() || fpos < self.free.len() {
            match (self.used.get(upos), self.free.get(fpos)) {
                (Some(u), _) if u.addr == addr => {
                    addr += u.size;
                    upos += 1;
                }
                (_, Some(f)) if f.addr == addr => {
                    addr += f.size;
                    fpos += 1;
                }
                _ => bail!("Heap inconsistency: no block at address ${:X}.", addr),
            }
        }
        if addr != end_mem {
            bail!("Heap inconsistency: overrun at end of heap.");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::tests::image;
    use proptest::prelude::*;

    fn memory() -> Memory {
        Memory::load(image(&[])).unwrap()
    }

    #[test]
    fn grows_and_splits() {
        let mut mem = memory();
        let mut heap = Heap::default();

        let a = heap.malloc(&mut mem, 16).unwrap();
        assert_eq!(a, 0x200);
        assert_eq!(mem.end_mem(), 0x300);
        assert_eq!(heap.start(), 0x200);
        assert_eq!(heap.free_blocks(), &[Block { addr: 0x210, size: 0xF0 }]);

        let b = heap.malloc(&mut mem, 32).unwrap();
        assert_eq!(b, 0x210);
        heap.check(mem.end_mem()).unwrap();
    }

    #[test]
    fn coalesces_and_shrinks() {
        let mut mem = memory();
        let mut heap = Heap::default();

        let a = heap.malloc(&mut mem, 16).unwrap();
        let b = heap.malloc(&mut mem, 16).unwrap();
        let c = heap.malloc(&mut mem, 16).unwrap();

        heap.free(&mut mem, a).unwrap();
        heap.free(&mut mem, b).unwrap();
        assert_eq!(heap.free_blocks()[0], Block { addr: a, size: 32 });
        heap.check(mem.end_mem()).unwrap();

        heap.free(&mut mem, c).unwrap();
        assert!(!heap.is_active());
        assert_eq!(heap.start(), 0);
        assert_eq!(mem.end_mem(), 0x200);
    }

    #[test]
    fn free_of_unknown_block_fails() {
        let mut mem = memory();
        let mut heap = Heap::default();
        let a = heap.malloc(&mut mem, 8).unwrap();
        assert!(heap.free(&mut mem, a + 1).is_err());
    }

    #[test]
    fn zero_size_allocation() {
        let mut mem = memory();
        let mut heap = Heap::default();
        assert_eq!(heap.malloc(&mut mem, 0).unwrap(), 0);
        assert!(!heap.is_active());
        assert_eq!(mem.end_mem(), 0x200);
    }

    #[test]
    fn rebuild_infers_gaps() {
        let used = vec![Block { addr: 0x210, size: 8 }];
        let heap = Heap::rebuild(0x200, used, 0x300).unwrap();
        assert_eq!(
            heap.free_blocks(),
            &[Block { addr: 0x200, size: 0x10 }, Block { addr: 0x218, size: 0xE8 }]
        );
        heap.check(0x300).unwrap();

        let overlap = vec![Block { addr: 0x210, size: 8 }, Block { addr: 0x214, size: 8 }];
        assert!(Heap::rebuild(0x200, overlap, 0x300).is_err());
    }

    proptest! {
        #[test]
        fn blocks_tile_the_heap(ops in proptest::collection::vec((1u32..600, any::<bool>()), 1..40)) {
            let mut mem = memory();
            let mut heap = Heap::default();
            let mut live = Vec::new();
            for (size, release) in ops {
                if release && !live.is_empty() {
                    let addr = live.remove(size as usize % live.len());
                    heap.free(&mut mem, addr).unwrap();
                } else {
                    live.push(heap.malloc(&mut mem, size).unwrap());
                }
                prop_assert!(heap.check(mem.end_mem()).is_ok());
            }
        }

        #[test]
        fn free_then_malloc_reuses_address(sizes in proptest::collection::vec(1u32..300, 1..10), n in 1u32..300) {
            let mut mem = memory();
            let mut heap = Heap::default();
            for size in sizes {
                heap.malloc(&mut mem, size).unwrap();
            }
            prop_assume!(heap.free_blocks().iter().any(|block| block.size >= n));
            let addr = heap.malloc(&mut mem, n).unwrap();
            heap.free(&mut mem, addr).unwrap();
            prop_assert_eq!(heap.malloc(&mut mem, n).unwrap(), addr);
        }
    }
}
