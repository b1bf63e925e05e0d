pub mod archive_store;
pub mod archive_tree;
pub mod backend;
pub mod byte_ranges;
pub mod catalog;
pub mod chunk_assembler;
pub mod contents_cache;
pub mod delta;
pub mod key_allocator;
pub mod patcher;
pub mod reconciler;
