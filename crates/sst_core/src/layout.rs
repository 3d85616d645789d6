//! Byte layout of internal rows.
//!
//! The extension set is fixed at table construction, so the whole layout is
//! precomputed once: user fields first, then one slot per derived column in
//! registration order. Every node computes the same layout from the same
//! configuration, which is what makes one-sided writes at equal offsets safe.

use crate::row::SlotType;

/// Placement of one extension slot inside the internal row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotDesc {
    pub slot_type: SlotType,
    /// Byte offset from the start of the internal row.
    pub offset: usize,
}

/// Precomputed layout of one internal row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowLayout {
    user_size: usize,
    slots: Vec<SlotDesc>,
    content_len: usize,
    stride: usize,
}

impl RowLayout {
    pub fn new(user_size: usize, slot_types: &[SlotType]) -> RowLayout {
        let mut offset = user_size;
        let mut slots = Vec::with_capacity(slot_types.len());
        for &slot_type in slot_types {
            slots.push(SlotDesc { slot_type, offset });
            offset += slot_type.size();
        }
        // Rows are stored back to back; keep each one 8-byte aligned.
        let stride = (offset + 7) & !7;
        RowLayout {
            user_size,
            slots,
            content_len: offset,
            stride,
        }
    }

    /// Size of the user-declared row prefix.
    pub fn user_size(&self) -> usize {
        self.user_size
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> SlotDesc {
        self.slots[index]
    }

    /// Bytes of one internal row that carry data (user fields plus slots).
    pub fn content_len(&self) -> usize {
        self.content_len
    }

    /// Distance between consecutive rows in the table buffer.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Offset of row `index` within the table buffer.
    pub fn row_offset(&self, index: usize) -> usize {
        index * self.stride
    }

    /// Start of the extension region within a row.
    pub fn extension_offset(&self) -> usize {
        self.user_size
    }

    /// Length of the extension region within a row.
    pub fn extension_len(&self) -> usize {
        self.content_len - self.user_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_packed_after_user_fields() {
        let layout = RowLayout::new(12, &[SlotType::Bool, SlotType::I64, SlotType::Bool]);
        assert_eq!(layout.user_size(), 12);
        assert_eq!(layout.slot(0).offset, 12);
        assert_eq!(layout.slot(1).offset, 13);
        assert_eq!(layout.slot(2).offset, 21);
        assert_eq!(layout.content_len(), 22);
        assert_eq!(layout.stride(), 24);
        assert_eq!(layout.extension_offset(), 12);
        assert_eq!(layout.extension_len(), 10);
    }

    #[test]
    fn layout_is_identical_for_identical_inputs() {
        // Every node derives the layout from the same configuration, so two
        // independent computations must place every field at the same offset.
        let a = RowLayout::new(16, &[SlotType::I64, SlotType::Bool]);
        let b = RowLayout::new(16, &[SlotType::I64, SlotType::Bool]);
        assert_eq!(a, b);
        for k in 0..a.num_slots() {
            assert_eq!(a.slot(k).offset, b.slot(k).offset);
        }
    }

    #[test]
    fn no_extensions_means_user_only_rows() {
        let layout = RowLayout::new(8, &[]);
        assert_eq!(layout.content_len(), 8);
        assert_eq!(layout.extension_len(), 0);
        assert_eq!(layout.row_offset(3), 24);
    }
}
