//! Bundle assembly: one-block descriptors and the fork-aware bundler.

mod bundler;
mod one_block_file;

pub use bundler::Bundler;
pub use one_block_file::OneBlockFile;
