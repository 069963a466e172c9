//! Normalizing iterator over block-status replies.
//!
//! The NBD spec is liberal about what a server may return for one block
//! status command. A compliant client has to cope with:
//!
//! - *single extent*: the reply covers only the beginning of the requested
//!   range, and more commands are needed for the rest;
//! - *short reply*: several extents that still stop before the end;
//! - *long reply*: the final extent may exceed the requested range and must
//!   be clipped;
//! - *consecutive extents of the same type*, which should be merged.
//!
//! [`extents`] hides all of that: it issues as many block-status commands as
//! needed and yields a monotonically increasing, non-overlapping sequence in
//! which no two consecutive extents share the same `zero` value.

use std::collections::VecDeque;

use crate::client::{Client, RawExtent};
use crate::{Error, Result};

/// A contiguous image region known to be data or zeroes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Extent {
    /// Offset of the first byte.
    pub start: u64,
    /// Length in bytes.
    pub length: u64,
    /// Whether the region reads as zeroes.
    pub zero: bool,
}

/// Anything that can answer block-status queries for an export.
///
/// [`Client`] is the production implementation; tests script replies.
pub trait ExtentSource {
    /// Total size of the export in bytes.
    fn export_size(&self) -> u64;

    /// Raw `base:allocation` reply for `[offset, offset + length)`.
    fn block_status(&mut self, offset: u64, length: u64) -> Result<Vec<RawExtent>>;
}

impl ExtentSource for Client {
    fn export_size(&self) -> u64 {
        Client::export_size(self)
    }

    fn block_status(&mut self, offset: u64, length: u64) -> Result<Vec<RawExtent>> {
        Client::block_status(self, offset, length)
    }
}

// NBD limits one block status command to 4 GiB - 1. Use a smaller step to
// bound the number of extents held in memory for very fragmented images.
const MAX_STEP: u64 = 2 * 1024 * 1024 * 1024 - 1;

/// Iterates merged extents covering `[offset, offset + length)`.
///
/// When `length` is `None` the range extends to the end of the export. The
/// requested range must be within the export.
pub fn extents<S: ExtentSource>(source: &mut S, offset: u64, length: Option<u64>) -> Extents<'_, S> {
    let end = match length {
        Some(length) => offset + length,
        None => source.export_size(),
    };
    Extents {
        source,
        offset,
        end,
        current: None,
        replied: VecDeque::new(),
        done: false,
    }
}

/// Iterator returned by [`extents`].
pub struct Extents<'a, S: ExtentSource> {
    source: &'a mut S,
    // Next byte whose status we have not consumed yet.
    offset: u64,
    end: u64,
    // Accumulates consecutive extents with the same zero value.
    current: Option<Extent>,
    // Unconsumed extents from the last reply.
    replied: VecDeque<RawExtent>,
    done: bool,
}

impl<S: ExtentSource> Iterator for Extents<'_, S> {
    type Item = Result<Extent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(raw) = self.replied.pop_front() {
                // Clip the last extent of a long reply to the requested
                // range.
                let length = raw.length.min(self.end - self.offset);
                if length == 0 {
                    continue;
                }
                let start = self.offset;
                self.offset += length;
                if self.offset == self.end {
                    // The server must not send more extents past the
                    // requested range; drop any it sent anyway.
                    self.replied.clear();
                }

                match &mut self.current {
                    Some(current) if current.zero == raw.zero() => {
                        current.length += length;
                    }
                    Some(current) => {
                        let finished = *current;
                        self.current = Some(Extent {
                            start,
                            length,
                            zero: raw.zero(),
                        });
                        return Some(Ok(finished));
                    }
                    None => {
                        self.current = Some(Extent {
                            start,
                            length,
                            zero: raw.zero(),
                        });
                    }
                }
                continue;
            }

            if self.offset < self.end {
                let step = (self.end - self.offset).min(MAX_STEP);
                match self.source.block_status(self.offset, step) {
                    Ok(reply) if reply.is_empty() => {
                        self.done = true;
                        return Some(Err(Error::Protocol(
                            "server returned no extents".to_string(),
                        )));
                    }
                    Ok(reply) => self.replied = reply.into(),
                    Err(err) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                }
                continue;
            }

            // Requested range fully consumed; emit the accumulated extent.
            self.done = true;
            return self.current.take().map(Ok);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{extents, Extent, ExtentSource};
    use crate::client::RawExtent;
    use crate::proto::STATE_ZERO;
    use crate::Result;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    struct FakeSource {
        export_size: u64,
        // Each call pops the next scripted reply.
        replies: Vec<Vec<RawExtent>>,
        requests: Vec<(u64, u64)>,
    }

    impl FakeSource {
        fn new(export_size: u64, replies: Vec<Vec<RawExtent>>) -> Self {
            Self {
                export_size,
                replies,
                requests: Vec::new(),
            }
        }
    }

    impl ExtentSource for FakeSource {
        fn export_size(&self) -> u64 {
            self.export_size
        }

        fn block_status(&mut self, offset: u64, length: u64) -> Result<Vec<RawExtent>> {
            self.requests.push((offset, length));
            Ok(self.replies.remove(0))
        }
    }

    fn data(length: u64) -> RawExtent {
        RawExtent { length, flags: 0 }
    }

    fn zero(length: u64) -> RawExtent {
        RawExtent {
            length,
            flags: STATE_ZERO,
        }
    }

    fn collect(source: &mut FakeSource, offset: u64, length: Option<u64>) -> Vec<Extent> {
        extents(source, offset, length)
            .collect::<Result<Vec<_>>>()
            .expect("scripted replies are valid")
    }

    #[test]
    fn merges_consecutive_zero_extents_and_clips_long_reply() {
        // One reply for [0, 96 MiB): 64 data, 16 zero, 16 zero, then 8 MiB
        // of data beyond the requested range.
        let mut source = FakeSource::new(
            128 * MIB,
            vec![vec![data(64 * MIB), zero(16 * MIB), zero(16 * MIB), data(8 * MIB)]],
        );
        let result = collect(&mut source, 0, Some(96 * MIB));
        assert_eq!(
            result,
            vec![
                Extent { start: 0, length: 64 * MIB, zero: false },
                Extent { start: 64 * MIB, length: 32 * MIB, zero: true },
            ]
        );
        assert_eq!(source.requests, vec![(0, 96 * MIB)]);
    }

    #[test]
    fn single_extent_replies_trigger_more_requests() {
        let mut source = FakeSource::new(
            3 * MIB,
            vec![vec![data(MIB)], vec![data(MIB)], vec![zero(MIB)]],
        );
        let result = collect(&mut source, 0, None);
        assert_eq!(
            result,
            vec![
                Extent { start: 0, length: 2 * MIB, zero: false },
                Extent { start: 2 * MIB, length: MIB, zero: true },
            ]
        );
        assert_eq!(
            source.requests,
            vec![(0, 3 * MIB), (MIB, 2 * MIB), (2 * MIB, MIB)]
        );
    }

    #[test]
    fn short_reply_is_completed_by_following_request() {
        let mut source = FakeSource::new(
            4 * MIB,
            vec![vec![data(MIB), zero(MIB)], vec![zero(MIB), data(MIB)]],
        );
        let result = collect(&mut source, 0, None);
        assert_eq!(
            result,
            vec![
                Extent { start: 0, length: MIB, zero: false },
                Extent { start: MIB, length: 2 * MIB, zero: true },
                Extent { start: 3 * MIB, length: MIB, zero: false },
            ]
        );
    }

    #[test]
    fn subrange_is_covered_exactly() {
        let mut source = FakeSource::new(10 * MIB, vec![vec![zero(2 * MIB)]]);
        let result = collect(&mut source, 4 * MIB, Some(2 * MIB));
        assert_eq!(
            result,
            vec![Extent { start: 4 * MIB, length: 2 * MIB, zero: true }]
        );
        assert_eq!(source.requests, vec![(4 * MIB, 2 * MIB)]);
    }

    #[test]
    fn extra_extents_after_requested_end_are_dropped() {
        // Non-compliant server keeps talking after covering the range.
        let mut source = FakeSource::new(
            4 * MIB,
            vec![vec![data(2 * MIB), zero(MIB), data(MIB)]],
        );
        let result = collect(&mut source, 0, Some(2 * MIB));
        assert_eq!(
            result,
            vec![Extent { start: 0, length: 2 * MIB, zero: false }]
        );
    }

    #[test]
    fn empty_range_yields_nothing() {
        let mut source = FakeSource::new(MIB, vec![]);
        let result = collect(&mut source, MIB, Some(0));
        assert!(result.is_empty());
    }

    proptest! {
        // Scripted replies with arbitrary fragmentation must be normalized
        // into a gapless, non-overlapping cover with alternating zero flags.
        #[test]
        fn coverage_is_exact_and_alternating(
            fragments in prop::collection::vec((any::<bool>(), 1u64..64), 1..40),
            chunk in 1usize..8,
        ) {
            let total: u64 = fragments.iter().map(|(_, len)| len).sum();
            let raw: Vec<RawExtent> = fragments
                .iter()
                .map(|(is_zero, len)| RawExtent {
                    length: *len,
                    flags: if *is_zero { STATE_ZERO } else { 0 },
                })
                .collect();
            // Split the raw list into several replies to exercise the
            // short-reply path.
            let replies: Vec<Vec<RawExtent>> =
                raw.chunks(chunk).map(<[RawExtent]>::to_vec).collect();

            let mut source = FakeSource::new(total, replies);
            let result = collect(&mut source, 0, None);

            let mut position = 0;
            for extent in &result {
                prop_assert_eq!(extent.start, position);
                prop_assert!(extent.length > 0);
                position += extent.length;
            }
            prop_assert_eq!(position, total);
            for pair in result.windows(2) {
                prop_assert_ne!(pair[0].zero, pair[1].zero);
            }
        }
    }
}
