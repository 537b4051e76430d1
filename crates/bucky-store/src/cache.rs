//! Bounded write-back cache of incoming points.
//!
//! Points are buffered per metric. When the cache is full, the metric with
//! the most buffered points is flushed first so each write to the backing
//! series moves as many samples as possible.

use std::collections::HashMap;

use tracing::debug;

use crate::traits::Point;

/// Buffered points for one metric.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Metric name.
    pub metric: String,
    /// Points in arrival order.
    pub points: Vec<Point>,
}

/// Indexed max-heap keyed by metric name, ordered by buffered point count.
#[derive(Debug)]
pub struct WriteCache {
    heap: Vec<CacheEntry>,
    index: HashMap<String, usize>,
    buffered: usize,
    max_points: usize,
}

impl WriteCache {
    /// Create a cache holding at most `max_points` points before it reports full.
    pub fn new(max_points: usize) -> Self {
        Self {
            heap: Vec::new(),
            index: HashMap::new(),
            buffered: 0,
            max_points,
        }
    }

    /// Buffer a point for `metric`.
    pub fn push(&mut self, metric: &str, point: Point) {
        self.buffered += 1;
        match self.index.get(metric) {
            Some(&i) => {
                self.heap[i].points.push(point);
                self.sift_up(i);
            }
            None => {
                let i = self.heap.len();
                self.heap.push(CacheEntry {
                    metric: metric.to_string(),
                    points: vec![point],
                });
                self.index.insert(metric.to_string(), i);
                self.sift_up(i);
            }
        }
    }

    /// Remove and return the metric with the most buffered points.
    pub fn pop_largest(&mut self) -> Option<CacheEntry> {
        if self.heap.is_empty() {
            return None;
        }
        let entry = self.remove_at(0);
        debug!(metric = %entry.metric, points = entry.points.len(), "evicting largest series");
        Some(entry)
    }

    /// Remove and return the buffered points of a specific metric.
    pub fn take(&mut self, metric: &str) -> Option<CacheEntry> {
        let i = *self.index.get(metric)?;
        Some(self.remove_at(i))
    }

    /// Buffered points of `metric`, if any.
    pub fn get(&self, metric: &str) -> Option<&[Point]> {
        self.index
            .get(metric)
            .map(|&i| self.heap[i].points.as_slice())
    }

    /// Whether the point bound has been reached.
    pub fn is_full(&self) -> bool {
        self.buffered >= self.max_points
    }

    /// Total buffered points.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Number of metrics with buffered points.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn remove_at(&mut self, i: usize) -> CacheEntry {
        let last = self.heap.len() - 1;
        self.swap(i, last);
        let entry = self.heap.pop().expect("heap is non-empty");
        self.index.remove(&entry.metric);
        self.buffered -= entry.points.len();
        if i < self.heap.len() {
            self.sift_down(i);
            self.sift_up(i);
        }
        entry
    }

    fn weight(&self, i: usize) -> usize {
        self.heap[i].points.len()
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.index.insert(self.heap[a].metric.clone(), a);
        self.index.insert(self.heap[b].metric.clone(), b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.weight(i) <= self.weight(parent) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut largest = i;
            if left < self.heap.len() && self.weight(left) > self.weight(largest) {
                largest = left;
            }
            if right < self.heap.len() && self.weight(right) > self.weight(largest) {
                largest = right;
            }
            if largest == i {
                break;
            }
            self.swap(i, largest);
            i = largest;
        }
    }
}
