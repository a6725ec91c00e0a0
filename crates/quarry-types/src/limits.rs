//! Engine-wide size constants.

/// Size of a page on disk, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Bytes at the head of every data page reserved for the pageLSN.
pub const PAGE_LSN_BYTES: usize = 8;

/// Usable bytes per page once the pageLSN header is accounted for.
pub const EFFECTIVE_PAGE_SIZE: usize = PAGE_SIZE - PAGE_LSN_BYTES;

/// Largest before/after image an update record may carry. Two images of
/// this size plus the record header still fit in one page of log.
pub const MAX_UPDATE_BYTES: usize = EFFECTIVE_PAGE_SIZE / 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_images_fit_in_a_page() {
        assert!(2 * MAX_UPDATE_BYTES <= EFFECTIVE_PAGE_SIZE);
    }
}
