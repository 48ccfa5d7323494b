//! Explicit allocation context.
//!
//! Callers hand every allocator an [`AllocationContext`] at construction
//! instead of threading a global "memory flags" mask through each call. The
//! context names the owner of the memory (its [`MemTag`]) and how the
//! backing metadata may be placed ([`AllocFlags`]); both show up in the
//! diagnostics the allocators emit.

use core::fmt;

use bitflags::bitflags;

bitflags! {
    /// Placement hints for the metadata an allocator reserves.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// Metadata may live in pageable memory.
        const PAGEABLE = 1 << 0;

        /// Allocation may happen from a context that can be preempted.
        const PREEMPTABLE = 1 << 1;
    }
}

/// Four-character owner tag, printed in diagnostics.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemTag([u8; 4]);

impl MemTag {
    pub const UNKNOWN: Self = Self(*b"????");

    #[must_use]
    pub const fn new(tag: [u8; 4]) -> Self {
        Self(tag)
    }

    #[must_use]
    pub const fn bytes(&self) -> [u8; 4] {
        self.0
    }
}

impl Default for MemTag {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for MemTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            let ch = if b.is_ascii_graphic() { char::from(b) } else { '.' };
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for MemTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemTag({self})")
    }
}

/// Owner tag plus placement flags for one allocator instance.
///
/// Displays as the tag, followed by the flag names when any are set:
/// `ires` or `ires PAGEABLE | PREEMPTABLE`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationContext {
    tag: MemTag,
    flags: AllocFlags,
}

impl AllocationContext {
    #[must_use]
    pub const fn new(tag: MemTag, flags: AllocFlags) -> Self {
        Self { tag, flags }
    }

    #[must_use]
    pub const fn tagged(tag: [u8; 4]) -> Self {
        Self::new(MemTag::new(tag), AllocFlags::empty())
    }

    #[must_use]
    pub const fn with_flags(self, flags: AllocFlags) -> Self {
        Self { flags, ..self }
    }

    #[must_use]
    pub const fn tag(&self) -> MemTag {
        self.tag
    }

    #[must_use]
    pub const fn flags(&self) -> AllocFlags {
        self.flags
    }

    #[must_use]
    pub const fn is_pageable(&self) -> bool {
        self.flags.contains(AllocFlags::PAGEABLE)
    }
}

impl fmt::Display for AllocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag)?;
        if !self.flags.is_empty() {
            f.write_str(" ")?;
            bitflags::parser::to_writer(&self.flags, &mut *f)?;
        }
        Ok(())
    }
}
