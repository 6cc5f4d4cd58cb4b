//! Page range interval management.
//!
//! The stored rows of one page blob are sorted by start and never overlap.
//! Every function here is pure: it takes the rows that overlap the request
//! (as returned by the metadata store) and describes the replacement as a
//! [`RangeEdit`], which the caller applies in one metadata call.

use crate::models::{slice_chunks, ExtentChunk, PageRange, PageRangeModel};

/// Rows to drop (by start offset) and rows to insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeEdit {
    pub removed: Vec<u64>,
    pub inserted: Vec<PageRangeModel>,
}

/// A piece of page blob content: stored bytes or an unwritten gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageSegment {
    Data(ExtentChunk),
    Zero(u64),
}

/// Writes `chunk` over `range`.
///
/// All overlapping rows collapse into one row spanning the union; the parts
/// of the first and last rows outside `range` keep their original bytes.
pub fn update(
    overlapping: &[PageRangeModel],
    range: PageRange,
    chunk: ExtentChunk,
) -> RangeEdit {
    let mut chunks = Vec::new();
    let mut start = range.start;
    let mut end = range.end;

    if let Some(first) = overlapping.first() {
        if first.start < range.start {
            chunks.extend(slice_chunks(
                &first.extent_chunks,
                0,
                range.start - first.start,
            ));
            start = first.start;
        }
    }

    chunks.push(chunk);

    if let Some(last) = overlapping.last() {
        if last.end > range.end {
            chunks.extend(slice_chunks(
                &last.extent_chunks,
                range.end + 1 - last.start,
                last.end - range.end,
            ));
            end = last.end;
        }
    }

    RangeEdit {
        removed: overlapping.iter().map(|r| r.start).collect(),
        inserted: vec![PageRangeModel::new(start, end, chunks)],
    }
}

/// Clears `range`, keeping the untouched prefix and suffix of the edge rows.
pub fn clear(overlapping: &[PageRangeModel], range: PageRange) -> RangeEdit {
    let mut inserted = Vec::new();

    if let Some(first) = overlapping.first() {
        if first.start < range.start {
            inserted.push(PageRangeModel::new(
                first.start,
                range.start - 1,
                slice_chunks(&first.extent_chunks, 0, range.start - first.start),
            ));
        }
    }

    if let Some(last) = overlapping.last() {
        if last.end > range.end {
            inserted.push(PageRangeModel::new(
                range.end + 1,
                last.end,
                slice_chunks(
                    &last.extent_chunks,
                    range.end + 1 - last.start,
                    last.end - range.end,
                ),
            ));
        }
    }

    RangeEdit {
        removed: overlapping.iter().map(|r| r.start).collect(),
        inserted,
    }
}

/// Drops everything at or beyond `size` bytes.
pub fn truncate(rows: &[PageRangeModel], size: u64) -> RangeEdit {
    let beyond: Vec<PageRangeModel> = rows.iter().filter(|r| r.end >= size).cloned().collect();
    if beyond.is_empty() {
        return RangeEdit::default();
    }
    if size == 0 {
        return RangeEdit {
            removed: beyond.iter().map(|r| r.start).collect(),
            inserted: Vec::new(),
        };
    }
    clear(&beyond, PageRange::new(size, u64::MAX - 1))
}

/// Returns the stored ranges, trimmed to `filter` when one is given.
///
/// The trimmed ends are views only; the stored rows are untouched.
pub fn filtered(rows: &[PageRangeModel], filter: Option<PageRange>) -> Vec<PageRange> {
    rows.iter()
        .map(PageRangeModel::range)
        .filter_map(|r| match filter {
            None => Some(r),
            Some(f) if r.overlaps(&f) => {
                Some(PageRange::new(r.start.max(f.start), r.end.min(f.end)))
            }
            Some(_) => None,
        })
        .collect()
}

/// Describes the content of `start..=end` as stored chunks and zero gaps.
pub fn layout(rows: &[PageRangeModel], start: u64, end: u64) -> Vec<PageSegment> {
    let mut segments = Vec::new();
    let mut cursor = start;

    for row in rows {
        if row.end < cursor || row.start > end {
            continue;
        }
        if row.start > cursor {
            segments.push(PageSegment::Zero(row.start - cursor));
            cursor = row.start;
        }
        let last = row.end.min(end);
        segments.extend(
            slice_chunks(&row.extent_chunks, cursor - row.start, last + 1 - cursor)
                .into_iter()
                .map(PageSegment::Data),
        );
        cursor = last + 1;
        if cursor > end {
            break;
        }
    }

    if cursor <= end {
        segments.push(PageSegment::Zero(end + 1 - cursor));
    }
    segments
}
