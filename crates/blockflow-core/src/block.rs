//! Half-open block ranges and the canonical segment-file naming scheme.
//!
//! Three file-name shapes exist, and only these three:
//!
//! - full store state: `<end>-<start>.kv`
//! - partial store state: `<end>-<start>.partial`
//! - map output cache: `<start>-<end>.output`
//!
//! Block numbers are zero-padded to 10 digits. State files put the end block
//! first so a lexicographic listing is ordered by ascending end block.

use blockflow_types::BlockRef;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A half-open block range `[start_block, exclusive_end_block)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Range {
    pub start_block: u64,
    pub exclusive_end_block: u64,
}

impl Range {
    pub fn new(start_block: u64, exclusive_end_block: u64) -> Self {
        Range {
            start_block,
            exclusive_end_block,
        }
    }

    pub fn len(&self) -> u64 {
        self.exclusive_end_block.saturating_sub(self.start_block)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, block_num: u64) -> bool {
        block_num >= self.start_block && block_num < self.exclusive_end_block
    }

    pub fn contains_block_ref(&self, block_ref: &BlockRef) -> bool {
        self.contains(block_ref.num)
    }

    /// True when `next` starts exactly where this range ends.
    pub fn is_next(&self, next: &Range) -> bool {
        self.exclusive_end_block == next.start_block
    }
}

impl std::fmt::Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start_block, self.exclusive_end_block)
    }
}

/// An ordered collection of ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ranges(pub Vec<Range>);

impl Ranges {
    pub fn sort_by_start(&mut self) {
        self.0.sort_by_key(|r| r.start_block);
    }

    pub fn sort_by_end(&mut self) {
        self.0.sort_by_key(|r| r.exclusive_end_block);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Range> {
        self.0.iter()
    }
}

impl std::fmt::Display for Ranges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(", "))
    }
}

impl From<Vec<Range>> for Ranges {
    fn from(ranges: Vec<Range>) -> Self {
        Ranges(ranges)
    }
}

impl IntoIterator for Ranges {
    type Item = Range;
    type IntoIter = std::vec::IntoIter<Range>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Round `block_num` down to a save-interval boundary.
pub fn boundary_below(block_num: u64, save_interval: u64) -> u64 {
    block_num - block_num % save_interval
}

fn pad(block_num: u64) -> String {
    format!("{:010}", block_num)
}

/// Prefix shared by every state file whose end block is `exclusive_end_block`.
pub fn state_file_prefix(exclusive_end_block: u64) -> String {
    pad(exclusive_end_block)
}

/// `<end>-<start>.kv`
pub fn full_state_filename(range: &Range) -> String {
    format!("{}-{}.kv", pad(range.exclusive_end_block), pad(range.start_block))
}

/// `<end>-<start>.partial`
pub fn partial_filename(range: &Range) -> String {
    format!(
        "{}-{}.partial",
        pad(range.exclusive_end_block),
        pad(range.start_block)
    )
}

/// `<start>-<end>.output`
pub fn output_filename(range: &Range) -> String {
    format!(
        "{}-{}.output",
        pad(range.start_block),
        pad(range.exclusive_end_block)
    )
}

/// A parsed state-file name: its range plus whether it is a partial segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateFileInfo {
    pub range: Range,
    pub partial: bool,
}

fn parse_padded(part: &str) -> Option<u64> {
    if part.len() != 10 || !part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    part.parse().ok()
}

fn split_name(name: &str) -> Option<(u64, u64, &str)> {
    let (stem, extension) = name.rsplit_once('.')?;
    let (first, second) = stem.split_once('-')?;
    Some((parse_padded(first)?, parse_padded(second)?, extension))
}

/// Parse a `.kv` or `.partial` file name.
pub fn parse_state_filename(name: &str) -> Result<StateFileInfo, Error> {
    let (end, start, extension) = split_name(name)
        .ok_or_else(|| Error::invalid_request(format!("invalid state file name {:?}", name)))?;
    let partial = match extension {
        "kv" => false,
        "partial" => true,
        _ => {
            return Err(Error::invalid_request(format!(
                "invalid state file extension in {:?}",
                name
            )))
        }
    };
    if start >= end {
        return Err(Error::invalid_request(format!(
            "invalid state file range in {:?}",
            name
        )));
    }
    Ok(StateFileInfo {
        range: Range::new(start, end),
        partial,
    })
}

/// Parse a `.output` cache file name.
pub fn parse_output_filename(name: &str) -> Result<Range, Error> {
    let (start, end, extension) = split_name(name)
        .ok_or_else(|| Error::invalid_request(format!("invalid output file name {:?}", name)))?;
    if extension != "output" || start >= end {
        return Err(Error::invalid_request(format!(
            "invalid output file name {:?}",
            name
        )));
    }
    Ok(Range::new(start, end))
}

/// The longest prefix of `ranges` (sorted by start) that is contiguous and
/// begins at or after `from`. Ranges starting below `from` are skipped.
pub fn continuous_ranges(ranges: &[Range], from: u64) -> Vec<Range> {
    let mut out: Vec<Range> = Vec::new();
    for range in ranges {
        if range.start_block < from {
            continue;
        }
        if let Some(last) = out.last() {
            if !last.is_next(range) {
                break;
            }
        }
        out.push(*range);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames() {
        let range = Range::new(100, 10_000);
        assert_eq!(full_state_filename(&range), "0000010000-0000000100.kv");
        assert_eq!(
            partial_filename(&Range::new(10_000, 20_000)),
            "0000020000-0000010000.partial"
        );
        assert_eq!(output_filename(&range), "0000000100-0000010000.output");
        assert_eq!(state_file_prefix(10_000), "0000010000");
    }

    #[test]
    fn state_filename_roundtrip() {
        for (name, partial) in [
            ("0000010000-0000000100.kv", false),
            ("0000020000-0000010000.partial", true),
        ] {
            let info = parse_state_filename(name).unwrap();
            assert_eq!(info.partial, partial);
            let back = if partial {
                partial_filename(&info.range)
            } else {
                full_state_filename(&info.range)
            };
            assert_eq!(back, name);
        }
    }

    #[test]
    fn output_filename_roundtrip() {
        let name = "0000000100-0000010000.output";
        let range = parse_output_filename(name).unwrap();
        assert_eq!(output_filename(&range), name);
    }

    #[test]
    fn parsers_reject_bad_names() {
        for name in [
            "100-200.kv",
            "0000010000-0000000100.bin",
            "0000010000-0000000100",
            "000001000a-0000000100.kv",
            "0000000100-0000010000.kv.tmp",
            "0000000100-0000000100.kv",
            "0000000100-0000010000.partial", // start >= end once flipped
        ] {
            assert!(parse_state_filename(name).is_err(), "accepted {:?}", name);
        }
        assert!(parse_output_filename("0000010000-0000000100.output").is_err());
        assert!(parse_output_filename("x").is_err());
    }

    #[test]
    fn continuity() {
        let ranges = vec![
            Range::new(100, 200),
            Range::new(200, 300),
            Range::new(300, 400),
        ];
        assert_eq!(continuous_ranges(&ranges, 0), ranges);
        assert_eq!(continuous_ranges(&ranges, 99), ranges);

        let broken = vec![
            Range::new(100, 200),
            Range::new(200, 300),
            Range::new(400, 500),
        ];
        assert_eq!(
            continuous_ranges(&broken, 0),
            vec![Range::new(100, 200), Range::new(200, 300)]
        );

        let skipped = vec![Range::new(100, 200), Range::new(300, 400)];
        assert_eq!(continuous_ranges(&skipped, 300), vec![Range::new(300, 400)]);
        assert!(continuous_ranges(&[], 0).is_empty());
    }

    #[test]
    fn boundaries() {
        assert_eq!(boundary_below(1234, 1000), 1000);
        assert_eq!(boundary_below(1000, 1000), 1000);
        assert_eq!(boundary_below(999, 1000), 0);
    }
}
