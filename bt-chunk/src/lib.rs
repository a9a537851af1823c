//! Code chunks and the translation cache: two-pass guest→host code
//! generation, intra-chunk jump fixup, and the cache that maps guest eip
//! (and host address) to live chunks so the execution loop and fault
//! handler can find them.

mod cache;
mod chunk;
mod translator;

pub use cache::{CacheError, TranslationCache};
pub use chunk::{ChunkError, ChunkSlot, CodeChunk, PendingLink, LIVE_EXIT_SENTINEL, RETIRED_SENTINEL};
pub use translator::{HostMappedGuestBytes, TranslateError, TranslatedChunk, Translator, MAX_CHUNK_INSTRUCTIONS};
