//! Non-destructive merge of one time series into another.
//!
//! [`fill`] walks the destination's archives from finest to coarsest and
//! looks for runs of missing samples. Each run longer than one step is
//! filled from the source, again preferring the source's finest archive and
//! falling back to coarser ones once a finer archive's reach is exhausted.
//!
//! Only timestamps inside a gap are ever written, so samples already present
//! in the destination are never changed and merging twice is a no-op.

use bucky_store::{Point, StoreError, TimeSeriesStore};
use tracing::{debug, trace};

/// What a fill did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillReport {
    /// Runs of missing samples found in the destination.
    pub gaps_found: usize,
    /// Runs left alone because they were a single sample long.
    pub gaps_skipped: usize,
    /// Runs a fill was attempted for.
    pub gaps_filled: usize,
    /// Source samples written into the destination.
    pub points_written: usize,
}

/// Scanner state over one destination archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GapState {
    NoGap,
    InGap { since: i64 },
}

/// Merge `src` into `dst` for everything older than `start`.
///
/// `now` is the clock both series are read against.
pub fn fill(
    src: &dyn TimeSeriesStore,
    dst: &dyn TimeSeriesStore,
    start: i64,
    now: i64,
) -> Result<FillReport, StoreError> {
    let mut report = FillReport::default();
    let mut start = start;

    for retention in dst.retentions() {
        let from = now - retention.max_retention();
        if from >= start {
            // Already covered by a finer archive.
            continue;
        }

        let Some(series) = dst.fetch(from, start)? else {
            continue;
        };
        let step = series.step();
        trace!(from, until = start, step, "scanning destination archive");

        let mut state = GapState::NoGap;
        for (t, value) in series.iter() {
            state = match (state, value.is_nan()) {
                (GapState::NoGap, true) => GapState::InGap { since: t },
                (GapState::InGap { since }, false) => {
                    close_gap(src, dst, since, t, step, now, &mut report)?;
                    GapState::NoGap
                }
                (state, _) => state,
            };
        }
        if let GapState::InGap { since } = state {
            // The last slot may reach past `start` into a finer archive's
            // territory; only timestamps up to `start` belong to this scan.
            let until = series.until_time().min(start + 1);
            close_gap(src, dst, since, until, step, now, &mut report)?;
        }

        start = from;
    }

    debug!(
        gaps = report.gaps_found,
        filled = report.gaps_filled,
        points = report.points_written,
        "fill complete"
    );
    Ok(report)
}

/// Merge `src` into `dst` over their whole history.
pub fn fill_all(
    src: &dyn TimeSeriesStore,
    dst: &dyn TimeSeriesStore,
    now: i64,
) -> Result<FillReport, StoreError> {
    fill(src, dst, now, now)
}

fn close_gap(
    src: &dyn TimeSeriesStore,
    dst: &dyn TimeSeriesStore,
    gap_from: i64,
    gap_until: i64,
    step: i64,
    now: i64,
    report: &mut FillReport,
) -> Result<(), StoreError> {
    report.gaps_found += 1;
    // A single missing sample is left alone.
    if gap_until - gap_from <= step {
        report.gaps_skipped += 1;
        return Ok(());
    }
    report.gaps_filled += 1;
    report.points_written += fill_window(src, dst, gap_from, gap_until, now)?;
    Ok(())
}

/// Copy every valid source sample with `gap_from <= t < gap_until` into
/// `dst`, finest source archive first.
fn fill_window(
    src: &dyn TimeSeriesStore,
    dst: &dyn TimeSeriesStore,
    gap_from: i64,
    gap_until: i64,
    now: i64,
) -> Result<usize, StoreError> {
    if gap_until <= src.start_time() {
        // Source holds nothing this old.
        return Ok(0);
    }

    let mut written = 0;
    let mut stop = gap_until;
    for retention in src.retentions() {
        let reach = now - retention.max_retention();
        if stop <= reach {
            continue;
        }
        let from = gap_from.max(reach);

        // Fetches are exclusive of `from`; back off one second so a sample
        // sitting exactly on the gap start is included.
        let fetch_from = (from - 1).max(reach);
        if let Some(series) = src.fetch(fetch_from, stop)? {
            let points: Vec<Point> = series
                .points()
                .into_iter()
                .filter(|p| p.timestamp >= gap_from && p.timestamp < gap_until)
                .filter(|p| p.timestamp <= stop)
                .collect();
            if !points.is_empty() {
                trace!(gap_from, gap_until, count = points.len(), "writing source samples");
                dst.update_many(&points)?;
                written += points.len();
            }
        }

        stop = from;
        if gap_from >= stop {
            break;
        }
    }
    Ok(written)
}
