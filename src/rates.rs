use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RateWindowError {
    #[error("interval {index} is inverted or empty ({start} >= {end})")]
    InvertedInterval {
        index: usize,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("interval {index} overlaps its predecessor")]
    Overlap { index: usize },
    #[error("no rate covers {0}")]
    OutOfRange(DateTime<Utc>),
}

/// A single half-open priced (or power-valued) interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub value: f64,
}

impl Rate {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, value: f64) -> Self {
        Self { start, end, value }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn hours(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / 3600.0
    }
}

/// An immutable snapshot of ordered, disjoint rate intervals.
///
/// Providers replace the whole snapshot on refresh; consumers hold a clone
/// taken at tick start and never observe mid-tick changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateWindow {
    rates: Vec<Rate>,
}

impl RateWindow {
    /// Build a window from intervals, sorting by start and validating that
    /// each interval is non-empty and disjoint from its predecessor.
    pub fn new(mut rates: Vec<Rate>) -> Result<Self, RateWindowError> {
        rates.sort_by_key(|r| r.start);
        for (index, rate) in rates.iter().enumerate() {
            if rate.start >= rate.end {
                return Err(RateWindowError::InvertedInterval {
                    index,
                    start: rate.start,
                    end: rate.end,
                });
            }
            if index > 0 && rate.start < rates[index - 1].end {
                return Err(RateWindowError::Overlap { index });
            }
        }
        Ok(Self { rates })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rate> {
        self.rates.iter()
    }

    pub fn first(&self) -> Option<&Rate> {
        self.rates.first()
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.rates.first().map(|r| r.start)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.rates.last().map(|r| r.end)
    }

    /// Value at `t` using half-open interval semantics.
    pub fn at(&self, t: DateTime<Utc>) -> Result<f64, RateWindowError> {
        let idx = self.rates.partition_point(|r| r.end <= t);
        match self.rates.get(idx) {
            Some(rate) if rate.contains(t) => Ok(rate.value),
            _ => Err(RateWindowError::OutOfRange(t)),
        }
    }

    /// Clip the window to `[from, to)`, splitting intervals at the bounds.
    pub fn slice(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> RateWindow {
        let rates = self
            .rates
            .iter()
            .filter(|r| r.end > from && r.start < to)
            .map(|r| Rate {
                start: r.start.max(from),
                end: r.end.min(to),
                value: r.value,
            })
            .collect();
        Self { rates }
    }

    /// Intervals sorted ascending by `(value, start)`. The sort is stable, so
    /// intervals equal in both keys keep their positional order.
    pub fn sorted_by_value(&self) -> Vec<Rate> {
        let mut sorted = self.rates.clone();
        sorted.sort_by(|a, b| {
            a.value
                .partial_cmp(&b.value)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.start.cmp(&b.start))
        });
        sorted
    }

    /// Integrate a power-valued window (W) into energy (kWh). Values are
    /// piecewise constant, so the result is independent of how the coverage
    /// is subdivided into intervals.
    pub fn energy_kwh(&self) -> f64 {
        self.rates
            .iter()
            .map(|r| r.value * r.hours() / 1000.0)
            .sum()
    }

    /// Duration-weighted mean value over the window.
    pub fn average(&self) -> Option<f64> {
        let hours: f64 = self.rates.iter().map(Rate::hours).sum();
        if hours <= 0.0 {
            return None;
        }
        let weighted: f64 = self.rates.iter().map(|r| r.value * r.hours()).sum();
        Some(weighted / hours)
    }

    pub fn max_value(&self) -> Option<f64> {
        self.rates.iter().map(|r| r.value).fold(None, |acc, v| {
            Some(match acc {
                Some(m) if m >= v => m,
                _ => v,
            })
        })
    }
}

impl IntoIterator for RateWindow {
    type Item = Rate;
    type IntoIter = std::vec::IntoIter<Rate>;

    fn into_iter(self) -> Self::IntoIter {
        self.rates.into_iter()
    }
}
