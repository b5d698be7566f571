//! Page selection for cached searches

use serde::{Deserialize, Serialize};

/// One-based page of a fixed size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pager {
    pub page: usize,
    pub size: usize,
}

impl Pager {
    /// Page `page` (one-based, 0 is treated as 1) of `size` rows
    pub fn new(page: usize, size: usize) -> Self {
        Self {
            page: page.max(1),
            size,
        }
    }

    /// First page of `size` rows
    pub fn first(size: usize) -> Self {
        Self::new(1, size)
    }

    /// Following page of the same size
    pub fn next(&self) -> Self {
        Self::new(self.page.saturating_add(1), self.size)
    }

    /// Position of the first row of the page, saturating at `usize::MAX`
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.size)
    }

    /// Position one past the last row of the page, saturating at `usize::MAX`
    pub fn end(&self) -> usize {
        self.offset().saturating_add(self.size)
    }
}

impl Default for Pager {
    fn default() -> Self {
        Self::first(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets() {
        let pager = Pager::new(3, 20);
        assert_eq!(pager.offset(), 40);
        assert_eq!(pager.end(), 60);
        assert_eq!(pager.next(), Pager::new(4, 20));
        assert_eq!(Pager::new(0, 10), Pager::first(10));
        assert_eq!(Pager::default().size, 100);
    }

    #[test]
    fn test_huge_page_saturates() {
        let pager = Pager::new(usize::MAX, 10);
        assert_eq!(pager.offset(), usize::MAX);
        assert_eq!(pager.end(), usize::MAX);
        assert_eq!(pager.next(), pager);
    }
}
