use alloc::string::String;
use core::fmt;

use fm_support::MemTag;

use crate::size_class::{NUM_CLASSES, SizeClass};

/// Point-in-time snapshot of a [`HeapManager`](crate::HeapManager), taken by
/// [`HeapManager::summary`](crate::HeapManager::summary).
///
/// The `Display` output is meant for diagnostic dumps:
///
/// ```text
/// heap sdma [ihep]
///   max        0x10000
///   available  0xff80
///   used       0x80
///   offset     0x4080
///   blocks     5
///   free 0x1000: 4
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapSummary {
    pub(crate) name: String,
    pub(crate) tag: MemTag,
    pub(crate) min_class: SizeClass,
    pub(crate) max_memory: u64,
    pub(crate) used: u64,
    pub(crate) cur_offset: u64,
    pub(crate) blocks: usize,
    pub(crate) free_counts: [u32; NUM_CLASSES],
}

impl HeapSummary {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn tag(&self) -> MemTag {
        self.tag
    }

    #[must_use]
    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }

    #[must_use]
    pub fn used(&self) -> u64 {
        self.used
    }

    #[must_use]
    pub fn available(&self) -> u64 {
        self.max_memory - self.used
    }

    #[must_use]
    pub fn cur_offset(&self) -> u64 {
        self.cur_offset
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks
    }

    #[must_use]
    pub fn free_count(&self, class: SizeClass) -> u32 {
        self.free_counts[class.index()]
    }

    /// Size classes with at least one free block, smallest first.
    pub fn nonempty_classes(&self) -> impl Iterator<Item = (SizeClass, u32)> + '_ {
        self.min_class
            .and_larger()
            .map(|class| (class, self.free_count(class)))
            .filter(|&(_, count)| count != 0)
    }
}

impl fmt::Display for HeapSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "heap {} [{}]", self.name, self.tag)?;
        writeln!(f, "  max        {:#x}", self.max_memory)?;
        writeln!(f, "  available  {:#x}", self.available())?;
        writeln!(f, "  used       {:#x}", self.used)?;
        writeln!(f, "  offset     {:#x}", self.cur_offset)?;
        write!(f, "  blocks     {}", self.blocks)?;
        for (class, count) in self.nonempty_classes() {
            write!(f, "\n  free {:#x}: {count}", class.size())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> HeapSummary {
        let mut free_counts = [0; NUM_CLASSES];
        free_counts[6] = 3;
        free_counts[12] = 4;
        HeapSummary {
            name: String::from("sdma"),
            tag: MemTag::new(*b"ihep"),
            min_class: SizeClass::new(6).unwrap(),
            max_memory: 0x1_0000,
            used: 0x80,
            cur_offset: 0x4100,
            blocks: 9,
            free_counts,
        }
    }

    #[test]
    fn test_accessors() {
        let summary = summary();
        assert_eq!(summary.available(), 0xff80);
        assert_eq!(summary.block_count(), 9);
        let classes: Vec<_> = summary
            .nonempty_classes()
            .map(|(class, count)| (class.log2(), count))
            .collect();
        assert_eq!(classes, vec![(6, 3), (12, 4)]);
    }

    #[test]
    fn test_display() {
        let text = summary().to_string();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "heap sdma [ihep]");
        assert_eq!(lines[2], "  available  0xff80");
        assert_eq!(lines[6], "  free 0x40: 3");
        assert_eq!(lines[7], "  free 0x1000: 4");
        assert_eq!(lines.len(), 8);
    }
}
