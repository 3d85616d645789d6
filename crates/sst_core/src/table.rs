//! Shared storage for the table's internal rows.
//!
//! The buffer is written concurrently by the local node (its own row) and by
//! the transport applying inbound one-sided writes (mirror rows), so every
//! cell is an `AtomicU8` accessed with relaxed ordering. Readers must expect
//! tearing between fields; whole-table consistency is only available through
//! [`TableBuffer::snapshot_bytes`].

use std::sync::atomic::{AtomicU8, Ordering};

use crate::layout::RowLayout;
use crate::row::{Row, SlotValue};

/// The backing store for `N` internal rows.
pub struct TableBuffer {
    cells: Box<[AtomicU8]>,
    layout: RowLayout,
    num_rows: usize,
}

impl TableBuffer {
    pub fn new(layout: RowLayout, num_rows: usize) -> TableBuffer {
        let len = layout.stride() * num_rows;
        let mut cells = Vec::with_capacity(len);
        cells.resize_with(len, || AtomicU8::new(0));
        TableBuffer {
            cells: cells.into_boxed_slice(),
            layout,
            num_rows,
        }
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Offset of row `index` within the buffer.
    pub fn row_offset(&self, index: usize) -> usize {
        assert!(index < self.num_rows, "row index {index} out of range");
        self.layout.row_offset(index)
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the buffer.
    pub fn read_into(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.cells.len(), "read past end of table");
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = self.cells[offset + i].load(Ordering::Relaxed);
        }
    }

    /// Copy a byte range out of the buffer.
    pub fn read_range(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read_into(offset, &mut out);
        out
    }

    /// Store `src` into the buffer starting at `offset`.
    pub fn write_range(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.cells.len(), "write past end of table");
        for (i, &byte) in src.iter().enumerate() {
            self.cells[offset + i].store(byte, Ordering::Relaxed);
        }
    }

    /// Copy of the user fields of row `index`. The copy may be torn with
    /// respect to a concurrent inbound write.
    pub fn read_user_row<R: Row>(&self, index: usize) -> R {
        let mut row = R::zeroed();
        self.read_into(self.row_offset(index), bytemuck::bytes_of_mut(&mut row));
        row
    }

    /// Overwrite the user fields of row `index`.
    pub fn write_user_row<R: Row>(&self, index: usize, row: &R) {
        self.write_range(self.row_offset(index), bytemuck::bytes_of(row));
    }

    /// Decode extension slot `slot` of row `index`.
    pub fn read_slot(&self, index: usize, slot: usize) -> SlotValue {
        let desc = self.layout.slot(slot);
        let bytes = self.read_range(self.row_offset(index) + desc.offset, desc.slot_type.size());
        SlotValue::decode(desc.slot_type, &bytes)
    }

    /// Encode `value` into extension slot `slot` of row `index`.
    pub fn write_slot(&self, index: usize, slot: usize, value: SlotValue) {
        let desc = self.layout.slot(slot);
        assert!(
            value.slot_type() == desc.slot_type,
            "slot {slot} holds {:?}, not {:?}",
            desc.slot_type,
            value.slot_type()
        );
        let mut bytes = vec![0u8; desc.slot_type.size()];
        value.encode(&mut bytes);
        self.write_range(self.row_offset(index) + desc.offset, &bytes);
    }

    /// One-pass copy of the whole table, detached from future writes.
    pub fn snapshot_bytes(&self) -> Box<[u8]> {
        let mut out = vec![0u8; self.cells.len()];
        self.read_into(0, &mut out);
        out.into_boxed_slice()
    }
}
