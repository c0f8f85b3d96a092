pub mod btree_index;
pub mod btree_iterator;
pub mod comparator;
pub mod root_directory;

pub use btree_index::BPlusTreeIndex;
pub use btree_iterator::TreeIndexIterator;
pub use comparator::{default_comparator, KeyComparator};
pub use root_directory::RootDirectory;
