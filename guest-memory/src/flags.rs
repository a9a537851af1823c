use bitflags::bitflags;

bitflags! {
    /// Guest-visible permissions and allocation state for a single guest
    /// page. Independent of [`NativeFlags`], which tracks how the host
    /// mapping is actually protected right now.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GuestFlags: u16 {
        const READ         = 0b0000_0001;
        const WRITE        = 0b0000_0010;
        const EXEC         = 0b0000_0100;
        const ALLOCATED    = 0b0000_1000;
        const SHARED       = 0b0001_0000;
        const MAPPED_HOST  = 0b0010_0000;
    }
}

bitflags! {
    /// Host-side mapping state for a guest page. `CODEPAGE_READONLY` is set
    /// only while a live chunk is translated from this page and the page
    /// hasn't been declared permanently dynamic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NativeFlags: u8 {
        const COMMITTED         = 0b0000_0001;
        const CODEPAGE_READONLY = 0b0000_0010;
    }
}

/// Once a code page's patch counter reaches this, it is permanently treated
/// as dynamic code and never write-protected again.
pub const MAX_DYNAMIC_STRIKES: u8 = 15;
