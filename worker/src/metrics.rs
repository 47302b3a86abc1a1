use crate::{Result, WorkerErr};

/// Running element-wise average of fixed-length `f32` records.
#[derive(Debug, Clone)]
pub struct AverageMeter {
    sums: Vec<f64>,
    counts: Vec<usize>,
}

impl AverageMeter {
    /// Creates an empty meter for records of `len` values.
    pub fn new(len: usize) -> Self {
        Self {
            sums: vec![0.0; len],
            counts: vec![0; len],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sums.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    /// Adds one record.
    ///
    /// # Errors
    /// Returns `WorkerErr::ShapeMismatch` if `record` has the wrong length;
    /// the meter is left untouched in that case.
    pub fn update(&mut self, record: &[f32]) -> Result<()> {
        if record.len() != self.len() {
            return Err(WorkerErr::ShapeMismatch {
                what: "meter record",
                got: record.len(),
                expected: self.len(),
            });
        }

        for ((sum, count), &v) in self.sums.iter_mut().zip(&mut self.counts).zip(record) {
            *sum += v as f64;
            *count += 1;
        }

        Ok(())
    }

    /// Element-wise mean of the records since the last reset.
    ///
    /// # Errors
    /// Returns `WorkerErr::EmptyMeter` if some slot has not been updated.
    pub fn average(&self) -> Result<Vec<f32>> {
        self.sums
            .iter()
            .zip(&self.counts)
            .map(|(&sum, &count)| match count {
                0 => Err(WorkerErr::EmptyMeter),
                n => Ok((sum / n as f64) as f32),
            })
            .collect()
    }

    pub fn reset(&mut self) {
        self.sums.fill(0.0);
        self.counts.fill(0);
    }
}
