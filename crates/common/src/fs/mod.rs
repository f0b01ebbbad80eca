pub mod safe_write;

pub use safe_write::{remove_file_if_exists, AtomicWriter, SafeWriteError};
