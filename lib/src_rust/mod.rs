// Allocation layer shared by every heap-owning part of the library.
//
// alloc owns the process-wide table; the other modules are built on top
// of it and never call libc's allocator on their own behalf.

pub mod alloc;
pub mod error;

// Allocator sets and adapters
pub mod global;
pub mod tracking;
