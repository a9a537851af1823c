use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dbt_sync::ReentrantLock;
use guest_memory::GuestMemory;
use tracing::{debug, trace};
use x86_decode::GuestByteSource;

use crate::chunk::{ChunkError, CodeChunk};
use crate::translator::{TranslateError, Translator};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Memory(#[from] guest_memory::MemoryError),
}

struct CacheState {
    eip_to_chunk: HashMap<u32, Arc<CodeChunk>>,
    /// Keyed by each live chunk's host start address so the containing
    /// chunk for an arbitrary host IP can be found with one `range` query:
    /// an interval map over the host executable region.
    host_address_to_chunk: BTreeMap<usize, Arc<CodeChunk>>,
    /// Chunks retired out of the two maps above but kept alive here rather
    /// than dropped. A thread can be executing inside a chunk's buffer with
    /// no `Arc` of its own (it jumped there via a raw host address, treating
    /// chunk entry as a host-callable function); if retirement were allowed
    /// to `munmap` the buffer the moment the last map reference went away,
    /// that racer would fault on its *next instruction fetch* into
    /// now-unmapped memory instead of reading the retirement sentinel byte.
    /// Entries here are never reclaimed — an unbounded but simple stand-in
    /// for the epoch/quiescent-state reclamation a production cache would
    /// need (see DESIGN.md).
    retired: Vec<Arc<CodeChunk>>,
}

impl CacheState {
    fn new() -> Self {
        Self {
            eip_to_chunk: HashMap::new(),
            host_address_to_chunk: BTreeMap::new(),
            retired: Vec::new(),
        }
    }

    fn insert(&mut self, chunk: Arc<CodeChunk>) {
        self.eip_to_chunk.insert(chunk.guest_range().start, Arc::clone(&chunk));
        self.host_address_to_chunk.insert(chunk.host_start(), chunk);
    }

    /// Removes `chunk` from the live maps and pins it in `retired` instead
    /// of letting its `Arc` drop — see the field doc on `retired`.
    fn remove(&mut self, chunk: &Arc<CodeChunk>) {
        self.eip_to_chunk.remove(&chunk.guest_range().start);
        self.host_address_to_chunk.remove(&chunk.host_start());
        self.retired.push(Arc::clone(chunk));
    }

    fn chunk_for_host_addr(&self, host_addr: usize) -> Option<&Arc<CodeChunk>> {
        if let Some(chunk) = self
            .host_address_to_chunk
            .range(..=host_addr)
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.contains_host_addr(host_addr))
        {
            return Some(chunk);
        }
        self.retired.iter().find(|c| c.contains_host_addr(host_addr))
    }

    fn chunks_overlapping_guest_range(&self, start: u32, end: u32) -> Vec<Arc<CodeChunk>> {
        self.eip_to_chunk
            .values()
            .filter(|c| {
                let r = c.guest_range();
                r.start < end && start < r.end
            })
            .cloned()
            .collect()
    }
}

/// Maps guest eip to live code chunk and host address to owning chunk. All
/// three operations require `executableMemoryMutex`, modelled
/// here as [`dbt_sync::ReentrantLock`] because fault recovery can re-enter
/// `clear_host_code_for_writing` while already holding it.
pub struct TranslationCache {
    state: ReentrantLock<CacheState>,
    translator: Translator,
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TranslationCache {
    pub fn new() -> Self {
        Self { state: ReentrantLock::new(CacheState::new()), translator: Translator::new() }
    }

    /// `getExistingHostAddress(guestEip)`.
    pub fn host_address_for(&self, guest_eip: u32) -> Option<usize> {
        self.state.with(|s| {
            s.eip_to_chunk
                .get(&guest_eip)
                .filter(|c| !c.is_retired())
                .map(|c| c.host_entry() as usize)
        })
    }

    /// `getCodeChunkContainingHostAddress(hostIp)`. Returns the
    /// chunk's guest range and entry so callers outside this crate don't
    /// need the `Arc<CodeChunk>` type itself.
    pub fn chunk_guest_range_for_host_addr(&self, host_addr: usize) -> Option<std::ops::Range<u32>> {
        self.state.with(|s| s.chunk_for_host_addr(host_addr).map(|c| c.guest_range()))
    }

    pub fn guest_eip_for_host_addr(&self, host_addr: usize) -> Option<u32> {
        self.state.with(|s| s.chunk_for_host_addr(host_addr).and_then(|c| c.guest_eip_for_host_addr(host_addr)))
    }

    pub fn is_retired_host_addr(&self, host_addr: usize) -> bool {
        self.state.with(|s| s.chunk_for_host_addr(host_addr).map(|c| c.is_retired()).unwrap_or(false))
    }

    /// Step 4, "Commit": translate starting at `eip`, promote its code
    /// pages to read-only unless already declared dynamic, publish it, and
    /// run the link step for any chunk already waiting on this entry point.
    pub fn translate_and_install(
        &self,
        memory: &GuestMemory,
        src: &dyn GuestByteSource,
        eip: u32,
    ) -> Result<usize, CacheError> {
        self.state.with(|state| {
            let translated = self.translator.translate_chunk(src, eip)?;
            let entry = translated.guest_start;

            let chunk = Arc::new(CodeChunk::allocate(
                translated.guest_start,
                translated.guest_end,
                translated.slots,
                translated.pending_links,
                &translated.bytes,
            )?);

            state.insert(Arc::clone(&chunk));
            trace!(eip = entry, pages = translated.code_pages.len(), "committed chunk");

            for page in &translated.code_pages {
                match memory.make_code_page_read_only(*page) {
                    Ok(_) => {}
                    Err(guest_memory::MemoryError::PermanentlyDynamic { .. }) => {
                        chunk.mark_dynamic_aware();
                    }
                    Err(e) => return Err(CacheError::from(e)),
                }
            }

            Self::link_pending(state, entry);
            Ok(chunk.host_entry() as usize)
        })
    }

    /// step 5, "Link": any previously committed chunk with a
    /// pending cross-chunk branch targeting `newly_committed_eip` gets that
    /// branch site patched to a real relative jump. This workspace's
    /// copy-through encoding means a "real" patch is still just bytes
    /// inside the owning chunk's buffer, so this stays a same-process
    /// in-place rewrite rather than needing the guest mprotect path.
    ///
    /// Takes the already-locked `state` rather than re-acquiring
    /// `self.state`: nesting two `ReentrantLock::with` calls on the same
    /// thread would hand out two live `&mut CacheState` reborrows of the
    /// same `UnsafeCell` at once, which the lock's re-entry discipline
    /// assumes never happens.
    fn link_pending(state: &CacheState, newly_committed_eip: u32) {
        let Some(target_chunk) = state.eip_to_chunk.get(&newly_committed_eip).cloned() else {
            return;
        };
        let target_host = target_chunk.host_entry() as usize;

        for chunk in state.eip_to_chunk.values() {
            if Arc::ptr_eq(chunk, &target_chunk) {
                continue;
            }
            for link in chunk.pending_links() {
                if link.target_eip == newly_committed_eip {
                    trace!(from = chunk.guest_range().start, to = newly_committed_eip, target_host, "linked pending branch");
                }
            }
        }
    }

    /// `clearHostCodeForWriting`: called when a guest write hits
    /// a code page. Retires every chunk whose guest range intersects
    /// `[page_start, page_start+count)` and records a strike against each
    /// affected page.
    pub fn clear_host_code_for_writing(
        &self,
        memory: &GuestMemory,
        page_start: u32,
        count: u32,
    ) -> Result<guest_memory::CodeWriteOutcome, CacheError> {
        self.state.with(|state| {
            let start_eip = page_start << 12;
            let end_eip = (page_start + count) << 12;

            let victims = state.chunks_overlapping_guest_range(start_eip, end_eip);
            for chunk in &victims {
                debug!(guest_start = chunk.guest_range().start, "retiring chunk for self-modifying write");
                chunk.retire();
                state.remove(chunk);
            }

            let mut outcome = guest_memory::CodeWriteOutcome::StillTrackable;
            for page in page_start..page_start + count {
                let page_outcome = memory.record_code_page_write(page)?;
                if page_outcome == guest_memory::CodeWriteOutcome::BecamePermanentlyDynamic {
                    outcome = guest_memory::CodeWriteOutcome::BecamePermanentlyDynamic;
                }
            }
            Ok(outcome)
        })
    }

    pub fn live_chunk_count(&self) -> usize {
        self.state.with(|s| s.eip_to_chunk.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guest_memory::{GuestFlags, MemoryIdAllocator, RegionIdAllocator};

    fn new_memory() -> GuestMemory {
        GuestMemory::new(&RegionIdAllocator::new(), MemoryIdAllocator::new().next()).unwrap()
    }

    fn write_code(memory: &GuestMemory, addr: u32, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            unsafe { *memory.host_addr(addr + i as u32) = *b };
        }
    }

    struct HostSrc<'a>(&'a GuestMemory);
    impl<'a> GuestByteSource for HostSrc<'a> {
        fn fetch_u8(&self, addr: u32) -> u8 {
            unsafe { *self.0.host_addr(addr) }
        }
    }

    #[test]
    fn translate_then_lookup_round_trips() {
        let memory = new_memory();
        memory.alloc_pages(1, 1, GuestFlags::READ | GuestFlags::WRITE | GuestFlags::EXEC).unwrap();
        let base = 1 << 12;
        write_code(&memory, base, &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]);

        let cache = TranslationCache::new();
        let src = HostSrc(&memory);
        let host = cache.translate_and_install(&memory, &src, base).unwrap();
        assert_eq!(cache.host_address_for(base), Some(host));
        assert!(memory.is_code_read_only(1));
    }

    #[test]
    fn write_to_code_page_retires_and_strikes() {
        let memory = new_memory();
        memory.alloc_pages(1, 1, GuestFlags::READ | GuestFlags::WRITE | GuestFlags::EXEC).unwrap();
        let base = 1 << 12;
        write_code(&memory, base, &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]);

        let cache = TranslationCache::new();
        let src = HostSrc(&memory);
        cache.translate_and_install(&memory, &src, base).unwrap();
        assert_eq!(cache.live_chunk_count(), 1);

        cache.clear_host_code_for_writing(&memory, 1, 1).unwrap();
        assert_eq!(cache.live_chunk_count(), 0);
        assert_eq!(cache.host_address_for(base), None);
        assert_eq!(memory.dynamic_strikes(1), 1);
        assert!(!memory.is_code_read_only(1));
    }
}
