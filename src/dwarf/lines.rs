//! Flattened line table of the designated compile unit.
//!
//! The raw DWARF line program is decoded once at load time into a sorted
//! row list; the stepping loop then answers two questions in O(log n):
//! does this pc sit on a statement boundary of the designated file, and
//! which address range belongs to the line being executed (the stepping
//! range, in gdb terms).

/// One decoded line-program row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRow {
    pub address: u64,
    pub line: u64,
    pub is_stmt: bool,
    /// Whether the row's file is the designated source file.
    pub in_source: bool,
    pub end_sequence: bool,
}

/// Address-sorted line rows with range lookups.
#[derive(Debug, Default)]
pub struct LineTable {
    rows: Vec<LineRow>,
}

impl LineTable {
    pub fn new(mut rows: Vec<LineRow>) -> Self {
        rows.sort_by_key(|r| r.address);
        LineTable { rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of distinct designated-file lines with generated code.
    pub fn source_line_count(&self) -> usize {
        let mut lines: Vec<u64> = self
            .rows
            .iter()
            .filter(|r| r.in_source && !r.end_sequence)
            .map(|r| r.line)
            .collect();
        lines.sort_unstable();
        lines.dedup();
        lines.len()
    }

    /// The row starting exactly at `pc`, if `pc` is a statement boundary.
    pub fn stmt_boundary(&self, pc: u64) -> Option<&LineRow> {
        // Partition-point rather than binary-search: duplicate addresses are
        // possible across sequences and all of them must be considered.
        let first = self.rows.partition_point(|r| r.address < pc);
        self.rows[first..]
            .iter()
            .take_while(|r| r.address == pc)
            .find(|r| r.is_stmt && !r.end_sequence)
    }

    /// The contiguous address range `[lo, hi)` covering the line entered at
    /// `pc`. Used as the stepping range: stops inside it belong to the same
    /// line and are not captured again.
    pub fn stepping_range(&self, pc: u64) -> (u64, u64) {
        let after = self.rows.partition_point(|r| r.address <= pc);
        if after == 0 {
            return (pc, pc + 1);
        }
        let start = after - 1;
        let line = self.rows[start].line;
        let mut end = start + 1;
        while end < self.rows.len()
            && !self.rows[end - 1].end_sequence
            && self.rows[end].line == line
        {
            end += 1;
        }
        let hi = self
            .rows
            .get(end)
            .map(|r| r.address)
            .unwrap_or(self.rows[start].address + 1);
        (self.rows[start].address, hi)
    }
}
