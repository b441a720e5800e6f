use std::fmt;

/// One of the four entries of an allocator table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocatorSlot {
    Malloc,
    Calloc,
    Realloc,
    Free,
}

impl AllocatorSlot {
    pub const ALL: [AllocatorSlot; 4] = [Self::Malloc, Self::Calloc, Self::Realloc, Self::Free];

    pub const fn name(self) -> &'static str {
        match self {
            Self::Malloc => "malloc",
            Self::Calloc => "calloc",
            Self::Realloc => "realloc",
            Self::Free => "free",
        }
    }
}

impl fmt::Display for AllocatorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    /// Some, but not all, of the slots were supplied. Installing the
    /// remainder from another set would pair e.g. a custom `malloc` with the
    /// platform `free`.
    #[error("allocator table is missing the {} slot(s)", slot_list(.missing))]
    IncompleteTable { missing: Vec<AllocatorSlot> },
}

pub type Result<T> = std::result::Result<T, AllocatorError>;

fn slot_list(slots: &[AllocatorSlot]) -> String {
    slots
        .iter()
        .map(|slot| slot.name())
        .collect::<Vec<_>>()
        .join(", ")
}
