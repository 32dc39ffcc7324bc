// SPDX-License-Identifier: BSD-3-Clause-LBNL
//! K-way merge of per-chunk record sequences into one time-ordered sequence.
//!
//! Each chunk exposes only its head record, so chunk-local order is preserved.
//! Heads are ordered by `(timestamp, chunk index)`; equal timestamps therefore
//! come out lower chunk first. A later chunk's head only overtakes the lowest
//! pending chunk when it is earlier by more than the regression tolerance, so a
//! tolerated regression at a chunk boundary merges exactly as it would inside
//! one chunk. Global frame numbers are the chunk-local ordinal plus the number
//! of records in all preceding chunks, and every emitted record is checked
//! against its predecessor and against the latest timestamp seen so far.
use chrono::{DateTime, TimeDelta, Utc};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::ingest::record::PacketRecord;
use crate::ingest::runner::ChunkOutput;
use crate::ingest::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    /// How far a timestamp may fall behind the latest one already emitted.
    pub max_timestamp_regression: TimeDelta,
}

impl MergePolicy {
    pub fn new(max_timestamp_regression: Duration) -> Self {
        Self {
            max_timestamp_regression: TimeDelta::from_std(max_timestamp_regression)
                .unwrap_or(TimeDelta::MAX),
        }
    }
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            max_timestamp_regression: TimeDelta::zero(),
        }
    }
}

struct Cursor {
    chunk: usize,
    frame_offset: u64,
    head: Option<PacketRecord>,
    rest: std::vec::IntoIter<PacketRecord>,
}

impl Cursor {
    fn advance(&mut self) -> Option<DateTime<Utc>> {
        self.head = self.rest.next();
        self.head.as_ref().map(|r| r.timestamp)
    }
}

pub struct Merger {
    cursors: Vec<Cursor>,
    heap: BinaryHeap<Reverse<(DateTime<Utc>, usize)>>,
    policy: MergePolicy,
    cancel: Option<CancellationToken>,
    // Lowest cursor that may still hold a head.
    first: usize,
    // Last emitted frame and the latest timestamp emitted so far.
    previous: Option<(u64, DateTime<Utc>)>,
    total: u64,
    fused: bool,
}

impl Merger {
    pub fn new(
        mut outputs: Vec<ChunkOutput>,
        policy: MergePolicy,
        cancel: Option<CancellationToken>,
    ) -> Self {
        outputs.sort_by_key(|o| o.chunk.index);

        let mut cursors = Vec::with_capacity(outputs.len());
        let mut heap = BinaryHeap::with_capacity(outputs.len());
        let mut frame_offset = 0u64;
        for output in outputs {
            let count = output.records.len() as u64;
            let mut cursor = Cursor {
                chunk: output.chunk.index,
                frame_offset,
                head: None,
                rest: output.records.into_iter(),
            };
            if let Some(ts) = cursor.advance() {
                heap.push(Reverse((ts, cursors.len())));
            }
            cursors.push(cursor);
            frame_offset += count;
        }

        Self {
            cursors,
            heap,
            policy,
            cancel,
            first: 0,
            previous: None,
            total: frame_offset,
            fused: false,
        }
    }

    /// Records across all chunks, i.e. the last global frame number.
    pub fn total_records(&self) -> u64 {
        self.total
    }

    fn violation(
        &mut self,
        chunk: usize,
        previous_frame: u64,
        frame: u64,
        reason: String,
    ) -> PipelineError {
        error!(
            "merge invariant violated in chunk {chunk} between frames {previous_frame} and {frame}: {reason}"
        );
        self.fused = true;
        PipelineError::MergeInvariantViolated {
            chunk,
            previous_frame,
            frame,
            reason,
        }
    }

    /// Picks the cursor to emit from and removes its heap entry.
    fn select(&mut self) -> Option<usize> {
        let Reverse((earliest, position)) = *self.heap.peek()?;
        while self.cursors[self.first].head.is_none() {
            self.first += 1;
        }
        let first = self.first;
        if position != first {
            if let Some(head) = &self.cursors[first].head {
                if head.timestamp - earliest <= self.policy.max_timestamp_regression {
                    self.heap.retain(|Reverse((_, p))| *p != first);
                    return Some(first);
                }
            }
        }
        self.heap.pop();
        Some(position)
    }
}

impl Iterator for Merger {
    type Item = Result<PacketRecord, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            self.fused = true;
            return Some(Err(PipelineError::Cancelled));
        }

        let Some(position) = self.select() else {
            self.fused = true;
            return None;
        };
        let cursor = &mut self.cursors[position];
        let mut record = cursor.head.take()?;
        record.frame_number += cursor.frame_offset;
        let chunk = cursor.chunk;
        if let Some(ts) = cursor.advance() {
            self.heap.push(Reverse((ts, position)));
        }

        let (previous_frame, latest) = self.previous.unwrap_or((0, record.timestamp));
        if record.frame_number != previous_frame + 1 {
            let frame = record.frame_number;
            return Some(Err(self.violation(
                chunk,
                previous_frame,
                frame,
                format!("expected frame {}", previous_frame + 1),
            )));
        }
        let regression = latest - record.timestamp;
        if regression > self.policy.max_timestamp_regression {
            let frame = record.frame_number;
            return Some(Err(self.violation(
                chunk,
                previous_frame,
                frame,
                format!(
                    "timestamp {} is {regression} before {latest}",
                    record.timestamp
                ),
            )));
        }

        self.previous = Some((record.frame_number, latest.max(record.timestamp)));
        Some(Ok(record))
    }
}
