use crate::common::config::{PageId, INVALID_PAGE_ID};
use crate::storage::page::b_plus_tree_internal_page::BPlusTreeInternalPage;
use crate::storage::page::b_plus_tree_leaf_page::BPlusTreeLeafPage;
use crate::storage::page::header_page::HeaderPage;

/// A buffer-pooled page of the B+ tree, tagged by kind. The variant is the
/// page-type discriminator: split/merge recursion dispatches on it at the
/// boundary of each recursive call.
pub enum BPlusTreePage<K, V> {
    Internal(BPlusTreeInternalPage<K>),
    Leaf(BPlusTreeLeafPage<K, V>),
    Header(HeaderPage),
}

impl<K: Clone + Default, V> BPlusTreePage<K, V> {
    pub fn is_leaf_page(&self) -> bool {
        matches!(self, BPlusTreePage::Leaf(_))
    }

    pub fn page_id(&self) -> PageId {
        match self {
            BPlusTreePage::Internal(page) => page.page_id(),
            BPlusTreePage::Leaf(page) => page.page_id(),
            BPlusTreePage::Header(_) => crate::common::config::HEADER_PAGE_ID,
        }
    }

    pub fn parent_page_id(&self) -> PageId {
        match self {
            BPlusTreePage::Internal(page) => page.parent_page_id(),
            BPlusTreePage::Leaf(page) => page.parent_page_id(),
            BPlusTreePage::Header(_) => INVALID_PAGE_ID,
        }
    }

    pub fn set_parent_page_id(&mut self, parent_page_id: PageId) {
        match self {
            BPlusTreePage::Internal(page) => page.set_parent_page_id(parent_page_id),
            BPlusTreePage::Leaf(page) => page.set_parent_page_id(parent_page_id),
            BPlusTreePage::Header(_) => unreachable!("header page has no parent"),
        }
    }

    pub fn is_root_page(&self) -> bool {
        self.parent_page_id() == INVALID_PAGE_ID
    }

    pub fn size(&self) -> usize {
        match self {
            BPlusTreePage::Internal(page) => page.size(),
            BPlusTreePage::Leaf(page) => page.size(),
            BPlusTreePage::Header(page) => page.num_records(),
        }
    }

    pub fn max_size(&self) -> usize {
        match self {
            BPlusTreePage::Internal(page) => page.max_size(),
            BPlusTreePage::Leaf(page) => page.max_size(),
            BPlusTreePage::Header(_) => unreachable!("header page has no fanout"),
        }
    }

    pub fn min_size(&self) -> usize {
        match self {
            BPlusTreePage::Internal(page) => page.min_size(),
            BPlusTreePage::Leaf(page) => page.min_size(),
            BPlusTreePage::Header(_) => unreachable!("header page has no fanout"),
        }
    }

    pub fn as_internal(&self) -> &BPlusTreeInternalPage<K> {
        match self {
            BPlusTreePage::Internal(page) => page,
            _ => unreachable!("expected an internal page"),
        }
    }

    pub fn as_internal_mut(&mut self) -> &mut BPlusTreeInternalPage<K> {
        match self {
            BPlusTreePage::Internal(page) => page,
            _ => unreachable!("expected an internal page"),
        }
    }

    pub fn as_leaf(&self) -> &BPlusTreeLeafPage<K, V> {
        match self {
            BPlusTreePage::Leaf(page) => page,
            _ => unreachable!("expected a leaf page"),
        }
    }

    pub fn as_leaf_mut(&mut self) -> &mut BPlusTreeLeafPage<K, V> {
        match self {
            BPlusTreePage::Leaf(page) => page,
            _ => unreachable!("expected a leaf page"),
        }
    }

    pub fn as_header(&self) -> &HeaderPage {
        match self {
            BPlusTreePage::Header(page) => page,
            _ => unreachable!("expected the header page"),
        }
    }

    pub fn as_header_mut(&mut self) -> &mut HeaderPage {
        match self {
            BPlusTreePage::Header(page) => page,
            _ => unreachable!("expected the header page"),
        }
    }
}
