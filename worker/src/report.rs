use std::fmt;

use log::info;

/// Averaged metrics of one logging interval.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport<'a> {
    pub epoch: usize,
    pub step: usize,
    pub total_steps: usize,
    pub lr: f64,
    /// `(loss key, average)` in configuration order.
    pub losses: Vec<(&'a str, f32)>,
    /// Average seconds spent in forward, backward and update.
    pub train_time: f32,
    /// Average seconds spent waiting for the batch.
    pub data_time: f32,
}

impl fmt::Display for StepReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "e{}, {}/{}, lr:{:.6}",
            self.epoch, self.step, self.total_steps, self.lr
        )?;
        for (key, value) in &self.losses {
            write!(f, ", {key}:{value:.6}")?;
        }
        write!(
            f,
            ", train_time:{:.3}s, data_time:{:.3}s",
            self.train_time, self.data_time
        )
    }
}

/// Sink for the periodic training line, injected into the rank that logs.
pub trait Reporter: Send {
    fn report(&mut self, report: &StepReport<'_>);
}

/// Emits each report through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&mut self, report: &StepReport<'_>) {
        info!(epoch = report.epoch, step = report.step; "{report}");
    }
}
