//! Memory limits for the per-request arena
//!
//! Growth failure is unrecoverable for the request that hits it: the arena
//! reports a fatal failure rather than retrying, and the boundary tears the
//! context down. Limits are set at context construction and fixed for the
//! context's lifetime.

/// Default size of the first arena page (4 KiB)
pub const DEFAULT_PAGE_SIZE: usize = 4 * 1024;

/// Ceiling on the size of any single arena page (4 MiB)
///
/// Page sizes double on repeated growth within a request up to this cap,
/// which bounds page count without letting one request's growth pattern
/// drive unbounded page sizes.
pub const MAX_PAGE_SIZE: usize = 4 * 1024 * 1024;

/// Ceiling on total bytes a single request may hold live (64 MiB)
pub const MAX_REQUEST_BYTES: usize = 64 * 1024 * 1024;

/// Memory limits enforced by the arena
#[derive(Debug, Clone, Copy)]
pub struct MemoryLimits {
    /// Size of the first page allocated for a fresh arena
    pub page_size: usize,

    /// Largest page the doubling growth policy may allocate
    pub max_page_size: usize,

    /// Total live bytes a request may obligate before allocation fails
    pub max_request_bytes: usize,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        MemoryLimits {
            page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
            max_request_bytes: MAX_REQUEST_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_ordered() {
        let limits = MemoryLimits::default();
        assert!(limits.page_size <= limits.max_page_size);
        assert!(limits.max_page_size <= limits.max_request_bytes);
    }
}
