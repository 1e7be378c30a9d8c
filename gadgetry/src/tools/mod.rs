//! Built-in gadgets.

pub mod edit_file;

pub use edit_file::{EditFile, FileStat, FileSystem, MemoryFileSystem, StdFileSystem};
