//! Splits a byte range into per-segment sub-requests when an origin is
//! served as `{base}.0`, `{base}.1`, ... fixed-size segments rather than
//! one flat URL.

/// One sub-request: which segment file, the byte offset within that
/// segment, and how many bytes to take from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSpan {
    pub index: u64,
    pub local_offset: u64,
    pub local_length: u64,
}

/// Decompose `[offset, offset + length)` into spans that each lie within
/// a single segment. With `segment_size = None` the whole range is one
/// span against segment `0` (the caller then uses the base URL
/// unmodified, with no `.0` suffix).
pub fn plan(offset: u64, length: u64, segment_size: Option<u64>) -> Vec<SegmentSpan> {
    if length == 0 {
        return Vec::new();
    }
    let Some(seg_size) = segment_size else {
        return vec![SegmentSpan {
            index: 0,
            local_offset: offset,
            local_length: length,
        }];
    };

    let mut spans = Vec::new();
    let mut remaining = length;
    let mut pos = offset;
    while remaining > 0 {
        let index = pos / seg_size;
        let local_offset = pos % seg_size;
        let room_in_segment = seg_size - local_offset;
        let local_length = remaining.min(room_in_segment);
        spans.push(SegmentSpan {
            index,
            local_offset,
            local_length,
        });
        pos += local_length;
        remaining -= local_length;
    }
    spans
}

/// Build the URL to fetch for a given segment index, given the base URL
/// and whether the origin is segmented at all.
pub fn segment_url(base: &str, index: u64, segmented: bool) -> String {
    if segmented {
        format!("{base}.{index}")
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsegmented_origin_is_one_span() {
        let spans = plan(100, 50, None);
        assert_eq!(
            spans,
            vec![SegmentSpan {
                index: 0,
                local_offset: 100,
                local_length: 50
            }]
        );
    }

    #[test]
    fn range_within_one_segment() {
        let spans = plan(10, 20, Some(4096));
        assert_eq!(
            spans,
            vec![SegmentSpan {
                index: 0,
                local_offset: 10,
                local_length: 20
            }]
        );
    }

    #[test]
    fn range_straddling_segment_boundary_splits_in_two() {
        let spans = plan(4090, 20, Some(4096));
        assert_eq!(
            spans,
            vec![
                SegmentSpan {
                    index: 0,
                    local_offset: 4090,
                    local_length: 6
                },
                SegmentSpan {
                    index: 1,
                    local_offset: 0,
                    local_length: 14
                },
            ]
        );
    }

    #[test]
    fn range_spanning_three_segments() {
        let spans = plan(0, 4096 * 2 + 10, Some(4096));
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].index, 0);
        assert_eq!(spans[1].index, 1);
        assert_eq!(spans[2].index, 2);
        assert_eq!(spans[2].local_length, 10);
    }

    #[test]
    fn zero_length_plans_no_spans() {
        assert!(plan(0, 0, Some(4096)).is_empty());
    }

    #[test]
    fn segment_url_appends_index_only_when_segmented() {
        assert_eq!(segment_url("http://h/disk.img", 3, true), "http://h/disk.img.3");
        assert_eq!(segment_url("http://h/disk.img", 3, false), "http://h/disk.img");
    }
}
