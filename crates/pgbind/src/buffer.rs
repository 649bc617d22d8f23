//! Pending-row accumulator shared by concurrent producers.

use parking_lot::Mutex;

/// Rows waiting for the next flush.
///
/// Every operation takes the same lock, so concurrent `add` calls interleave
/// safely and never overlap with a drain.
#[derive(Debug)]
pub struct RowBuffer<R> {
    rows: Mutex<Vec<R>>,
}

impl<R> Default for RowBuffer<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> RowBuffer<R> {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
        }
    }

    /// Buffer a row; `None` is ignored
    pub fn add(&self, row: impl Into<Option<R>>) {
        if let Some(row) = row.into() {
            self.rows.lock().push(row);
        }
    }

    /// Buffer several rows under one lock acquisition
    pub fn add_all<I: IntoIterator<Item = R>>(&self, rows: I) {
        self.rows.lock().extend(rows);
    }

    /// Remove and return everything buffered, oldest first
    pub fn drain_all(&self) -> Vec<R> {
        std::mem::take(&mut *self.rows.lock())
    }

    /// Put drained rows back ahead of anything added since the drain
    pub fn restore(&self, mut rows: Vec<R>) {
        if rows.is_empty() {
            return;
        }
        let mut buffered = self.rows.lock();
        rows.append(&mut buffered);
        *buffered = rows;
    }

    /// Number of buffered rows
    pub fn count(&self) -> usize {
        self.rows.lock().len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Drop every buffered row, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut rows = self.rows.lock();
        let dropped = rows.len();
        rows.clear();
        dropped
    }
}
