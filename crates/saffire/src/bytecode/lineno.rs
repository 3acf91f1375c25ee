//! Compact mapping from code offsets to source lines.
//!
//! The table stores the first line of the frame and then one entry per line
//! change: the code-offset delta since the previous change followed by the line
//! delta. Both are LEB128 varints (7 bits per byte, high bit set on every byte
//! but the last). Line deltas are zigzag-encoded so a backwards step (a loop
//! increment emitted after its body) survives the round trip.

/// Encoded line table of one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineTable {
    start_line: u32,
    deltas: Vec<u8>,
}

impl LineTable {
    #[must_use]
    pub fn from_parts(start_line: u32, deltas: Vec<u8>) -> Self {
        Self { start_line, deltas }
    }

    #[must_use]
    pub fn start_line(&self) -> u32 {
        self.start_line
    }

    #[must_use]
    pub fn deltas(&self) -> &[u8] {
        &self.deltas
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.start_line == 0 && self.deltas.is_empty()
    }

    /// Decodes the table into `(offset, line)` pairs.
    ///
    /// Returns `None` if the delta bytes are truncated.
    #[must_use]
    pub fn entries(&self) -> Option<Vec<(usize, u32)>> {
        let mut entries = vec![(0, self.start_line)];
        let mut offset = 0usize;
        let mut line = i64::from(self.start_line);
        let mut pos = 0;
        while pos < self.deltas.len() {
            let code_delta = read_varint(&self.deltas, &mut pos)?;
            let line_delta = unzigzag(read_varint(&self.deltas, &mut pos)?);
            offset += usize::try_from(code_delta).ok()?;
            line += line_delta;
            entries.push((offset, u32::try_from(line).ok()?));
        }
        Some(entries)
    }

    /// Returns the source line of the instruction starting at `offset`.
    #[must_use]
    pub fn line_for_offset(&self, offset: usize) -> Option<u32> {
        if self.is_empty() {
            return None;
        }
        let entries = self.entries()?;
        entries
            .iter()
            .take_while(|(start, _)| *start <= offset)
            .last()
            .map(|&(_, line)| line)
    }
}

/// Accumulates line changes while a frame is assembled.
#[derive(Debug, Default)]
pub(crate) struct LineTableBuilder {
    start_line: Option<u32>,
    last_offset: usize,
    last_line: u32,
    deltas: Vec<u8>,
}

impl LineTableBuilder {
    /// Records that the instruction at `offset` came from `line`.
    ///
    /// Line 0 means "unknown" and never produces an entry.
    pub fn record(&mut self, offset: usize, line: u32) {
        if line == 0 || line == self.last_line {
            return;
        }
        if self.start_line.is_none() {
            self.start_line = Some(line);
        } else {
            write_varint(&mut self.deltas, (offset - self.last_offset) as u64);
            write_varint(&mut self.deltas, zigzag(i64::from(line) - i64::from(self.last_line)));
        }
        self.last_offset = offset;
        self.last_line = line;
    }

    pub fn finish(self) -> LineTable {
        LineTable {
            start_line: self.start_line.unwrap_or(0),
            deltas: self.deltas,
        }
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value > 0x7F {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

fn read_varint(bytes: &[u8], pos: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0;
    loop {
        let byte = *bytes.get(*pos)?;
        *pos += 1;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    (value >> 1) as i64 ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_varint_splits_large_values() {
        let mut out = Vec::new();
        write_varint(&mut out, 127);
        assert_eq!(out, vec![0x7F]);
        out.clear();
        write_varint(&mut out, 300);
        assert_eq!(out, vec![0xAC, 0x02]);
        let mut pos = 0;
        assert_eq!(read_varint(&out, &mut pos), Some(300));
        assert_eq!(pos, 2);
    }

    #[test]
    fn test_zigzag_handles_negative_deltas() {
        for value in [0, 1, -1, 63, -64, 1000, -1000] {
            assert_eq!(unzigzag(zigzag(value)), value, "zigzag of {value}");
        }
    }

    #[test]
    fn test_builder_records_only_changes() {
        let mut builder = LineTableBuilder::default();
        builder.record(0, 3);
        builder.record(5, 3);
        builder.record(10, 4);
        builder.record(400, 2);
        builder.record(403, 0);
        let table = builder.finish();

        assert_eq!(table.start_line(), 3);
        assert_eq!(table.entries(), Some(vec![(0, 3), (10, 4), (400, 2)]));
        assert_eq!(table.line_for_offset(7), Some(3));
        assert_eq!(table.line_for_offset(10), Some(4));
        assert_eq!(table.line_for_offset(500), Some(2));
    }

    #[test]
    fn test_truncated_table_is_rejected() {
        let table = LineTable::from_parts(1, vec![0x85]);
        assert_eq!(table.entries(), None);
    }
}
