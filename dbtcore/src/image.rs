//! Loads a hand-supplied flat guest image into a [`GuestMemory`]. Real ELF/PE
//! loading is explicitly out of scope;
//! this is the minimal stand-in the demo binary and integration tests use to
//! get bytes into the guest address space at a chosen page.

use guest_memory::{GuestFlags, GuestMemory, MemoryError};

/// Copies `bytes` into guest memory starting at `load_page`, allocating
/// however many whole pages it spans with `flags`. Returns the guest address
/// of the first loaded byte.
pub fn load_flat_image(
    memory: &GuestMemory,
    load_page: u32,
    bytes: &[u8],
    flags: GuestFlags,
) -> Result<u32, MemoryError> {
    let page_count = (bytes.len() as u32).div_ceil(guest_memory::PAGE_SIZE as u32).max(1);
    memory.alloc_pages(load_page, page_count, flags)?;

    let base = load_page << guest_memory::PAGE_SHIFT;
    for (i, byte) in bytes.iter().enumerate() {
        unsafe { *memory.host_addr(base + i as u32) = *byte };
    }
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use guest_memory::{MemoryIdAllocator, RegionIdAllocator};

    #[test]
    fn loads_image_bytes_at_chosen_page() {
        let memory = GuestMemory::new(&RegionIdAllocator::new(), MemoryIdAllocator::new().next()).unwrap();
        let code = [0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3];
        let base = load_flat_image(&memory, 4, &code, GuestFlags::READ | GuestFlags::WRITE | GuestFlags::EXEC).unwrap();
        assert_eq!(base, 4 << guest_memory::PAGE_SHIFT);
        for (i, b) in code.iter().enumerate() {
            assert_eq!(unsafe { *memory.host_addr(base + i as u32) }, *b);
        }
    }
}
