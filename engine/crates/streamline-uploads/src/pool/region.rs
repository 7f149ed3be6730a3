/// page 内的区域分配器
///
/// first-fit；空闲区域按 offset 排序，释放时与相邻区域合并
#[derive(Debug, Clone)]
pub struct RegionAllocator {
    size: u64,
    alignment: u64,
    /// (offset, size)，按 offset 升序，互不相邻
    free: Vec<(u64, u64)>,
}

impl RegionAllocator {
    pub fn new(size: u64, alignment: u64) -> Self {
        debug_assert!(alignment.is_power_of_two());
        Self {
            size,
            alignment,
            free: vec![(0, size)],
        }
    }

    /// 区域实际占用的大小
    #[inline]
    pub fn aligned_size(&self, size: u64) -> u64 {
        size.max(1).next_multiple_of(self.alignment)
    }

    pub fn allocate(&mut self, size: u64) -> Option<u64> {
        let size = self.aligned_size(size);
        for index in 0..self.free.len() {
            let (offset, free_size) = self.free[index];
            let aligned = offset.next_multiple_of(self.alignment);
            let padding = aligned - offset;
            if free_size < padding + size {
                continue;
            }

            let tail = free_size - padding - size;
            match (padding > 0, tail > 0) {
                (false, false) => {
                    self.free.remove(index);
                }
                (false, true) => self.free[index] = (aligned + size, tail),
                (true, false) => self.free[index] = (offset, padding),
                (true, true) => {
                    self.free[index] = (offset, padding);
                    self.free.insert(index + 1, (aligned + size, tail));
                }
            }
            return Some(aligned);
        }
        None
    }

    pub fn free(&mut self, offset: u64, size: u64) {
        let size = self.aligned_size(size);
        debug_assert!(offset + size <= self.size);

        let index = self.free.partition_point(|(free_offset, _)| *free_offset < offset);
        self.free.insert(index, (offset, size));

        // 先与后一个合并，再与前一个合并
        if index + 1 < self.free.len() {
            let (next_offset, next_size) = self.free[index + 1];
            debug_assert!(offset + size <= next_offset, "double free of region {}", offset);
            if offset + size == next_offset {
                self.free[index].1 += next_size;
                self.free.remove(index + 1);
            }
        }
        if index > 0 {
            let (prev_offset, prev_size) = self.free[index - 1];
            debug_assert!(prev_offset + prev_size <= offset, "double free of region {}", offset);
            if prev_offset + prev_size == offset {
                self.free[index - 1].1 += self.free[index].1;
                self.free.remove(index);
            }
        }
    }

    /// 没有任何已分配的区域
    #[inline]
    pub fn is_unused(&self) -> bool {
        self.free.len() == 1 && self.free[0] == (0, self.size)
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(|(_, size)| size).sum()
    }
}
