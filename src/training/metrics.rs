//! Training metrics and run history
//!
//! Per-epoch averages of the loss breakdown plus the validation results,
//! persisted as `history.csv`.

use std::path::Path;

use crate::error::{FairFlowError, Result};

use super::losses::LossBreakdown;

/// Sample-weighted running mean
#[derive(Debug, Clone, Copy, Default)]
pub struct AverageMeter {
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value`, observed over `n` samples
    pub fn update(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Averages of one epoch's loss breakdowns
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochMeters {
    pub total: AverageMeter,
    pub nll: AverageMeter,
    pub adversarial: AverageMeter,
    pub disc_accuracy: AverageMeter,
    pub recon: AverageMeter,
}

impl EpochMeters {
    pub fn update(&mut self, loss: &LossBreakdown, n: usize) {
        self.total.update(loss.total, n);
        self.nll.update(loss.nll, n);
        self.adversarial.update(loss.adversarial, n);
        self.disc_accuracy.update(loss.disc_accuracy, n);
        self.recon.update(loss.recon, n);
    }
}

/// Result of one validation pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationSummary {
    /// Sample-weighted `nll_weight*nll - adv_weight*disc + recon`
    pub loss: f64,
    pub disc_accuracy: f64,
    pub nll: f64,
    /// Mean absolute error of `reverse(forward(x))` on the first batch
    pub recon_mae: f64,
}

/// One row of the run history
#[derive(Debug, Clone, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub itr: usize,
    pub loss: f64,
    pub nll: f64,
    pub adversarial: f64,
    pub disc_accuracy: f64,
    pub adv_weight: f64,
    pub validation: Option<ValidationSummary>,
}

/// Per-epoch records of a run
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    records: Vec<EpochRecord>,
}

const HEADER: [&str; 12] = [
    "epoch",
    "itr",
    "loss",
    "nll",
    "adversarial",
    "disc_accuracy",
    "adv_weight",
    "val_loss",
    "val_disc_accuracy",
    "val_nll",
    "val_recon_mae",
    "validated",
];

fn parse_field(value: &str, column: &str) -> Result<f64> {
    value
        .parse()
        .map_err(|_| FairFlowError::Serialization(format!("history column `{column}`: bad value {value:?}")))
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_epoch(&mut self, record: EpochRecord) {
        self.records.push(record);
    }

    /// Attach a validation result to the latest epoch
    pub fn record_validation(&mut self, summary: ValidationSummary) {
        if let Some(last) = self.records.last_mut() {
            last.validation = Some(summary);
        }
    }

    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    pub fn num_epochs(&self) -> usize {
        self.records.len()
    }

    pub fn latest_loss(&self) -> Option<f64> {
        self.records.last().map(|r| r.loss)
    }

    /// Validation results in order, paired with their epoch
    pub fn validations(&self) -> Vec<(usize, ValidationSummary)> {
        self.records
            .iter()
            .filter_map(|r| r.validation.map(|v| (r.epoch, v)))
            .collect()
    }

    pub fn best_validation(&self) -> Option<(usize, ValidationSummary)> {
        self.validations()
            .into_iter()
            .min_by(|a, b| a.1.loss.total_cmp(&b.1.loss))
    }

    /// Mean training loss over the last `window` epochs
    pub fn loss_ma(&self, window: usize) -> f64 {
        let n = window.min(self.records.len());
        if n == 0 {
            return 0.0;
        }
        self.records.iter().rev().take(n).map(|r| r.loss).sum::<f64>() / n as f64
    }

    /// Write as CSV; epochs without validation leave the `val_*` columns empty
    pub fn save_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(HEADER)?;

        for r in &self.records {
            let (val_loss, val_acc, val_nll, val_mae) = match r.validation {
                Some(v) => (
                    v.loss.to_string(),
                    v.disc_accuracy.to_string(),
                    v.nll.to_string(),
                    v.recon_mae.to_string(),
                ),
                None => Default::default(),
            };
            writer.write_record([
                r.epoch.to_string(),
                r.itr.to_string(),
                r.loss.to_string(),
                r.nll.to_string(),
                r.adversarial.to_string(),
                r.disc_accuracy.to_string(),
                r.adv_weight.to_string(),
                val_loss,
                val_acc,
                val_nll,
                val_mae,
                r.validation.is_some().to_string(),
            ])?;
        }

        writer.flush()?;
        Ok(())
    }

    pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut history = Self::new();

        for result in reader.records() {
            let record = result?;
            if record.len() != HEADER.len() {
                return Err(FairFlowError::Serialization(format!(
                    "history row has {} columns, expected {}",
                    record.len(),
                    HEADER.len()
                )));
            }
            let f = |i: usize| parse_field(&record[i], HEADER[i]);
            let validation = if &record[11] == "true" {
                Some(ValidationSummary {
                    loss: f(7)?,
                    disc_accuracy: f(8)?,
                    nll: f(9)?,
                    recon_mae: f(10)?,
                })
            } else {
                None
            };
            history.records.push(EpochRecord {
                epoch: f(0)? as usize,
                itr: f(1)? as usize,
                loss: f(2)?,
                nll: f(3)?,
                adversarial: f(4)?,
                disc_accuracy: f(5)?,
                adv_weight: f(6)?,
                validation,
            });
        }

        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    fn record(epoch: usize, loss: f64) -> EpochRecord {
        EpochRecord {
            epoch,
            itr: epoch * 10,
            loss,
            nll: loss * 2.0,
            adversarial: 0.69,
            disc_accuracy: 0.5,
            adv_weight: 1.0,
            validation: None,
        }
    }

    fn summary(loss: f64) -> ValidationSummary {
        ValidationSummary {
            loss,
            disc_accuracy: 0.52,
            nll: 1.4,
            recon_mae: 1e-6,
        }
    }

    #[test]
    fn test_average_meter_is_sample_weighted() {
        let mut meter = AverageMeter::new();
        meter.update(1.0, 3);
        meter.update(5.0, 1);
        assert_abs_diff_eq!(meter.avg(), 2.0);
        assert_eq!(meter.count(), 4);
        meter.reset();
        assert_eq!(meter.avg(), 0.0);
    }

    #[test]
    fn test_history_validation_tracking() {
        let mut history = TrainingHistory::new();
        history.record_validation(summary(9.0));
        assert!(history.validations().is_empty());

        for epoch in 1..=4 {
            history.record_epoch(record(epoch, 5.0 - epoch as f64));
            if epoch % 2 == 0 {
                history.record_validation(summary(10.0 / epoch as f64));
            }
        }
        assert_eq!(history.num_epochs(), 4);
        assert_eq!(history.latest_loss(), Some(1.0));
        assert_eq!(history.validations().len(), 2);
        assert_eq!(history.best_validation().map(|(e, _)| e), Some(4));
        assert_abs_diff_eq!(history.loss_ma(2), 1.5);
    }

    #[test]
    fn test_history_csv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.csv");

        let mut history = TrainingHistory::new();
        history.record_epoch(record(1, 3.0));
        history.record_epoch(record(2, 2.5));
        history.record_validation(summary(-0.25));
        history.save_csv(&path).unwrap();

        let loaded = TrainingHistory::load_csv(&path).unwrap();
        assert_eq!(loaded.records(), history.records());
        assert!(loaded.records()[0].validation.is_none());
    }
}
