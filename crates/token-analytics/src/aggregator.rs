use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::DataPoint;

/// Reducer applied to the samples of one time bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Avg,
    Sum,
    Min,
    Max,
    Count,
}

impl Aggregation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Count => "count",
        }
    }

    fn reduce(self, values: &[f64]) -> f64 {
        match self {
            Self::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Self::Sum => values.iter().sum(),
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Count => values.len() as f64,
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "avg" => Ok(Self::Avg),
            "sum" => Ok(Self::Sum),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "count" => Ok(Self::Count),
            other => Err(format!("unsupported aggregation: {}", other)),
        }
    }
}

/// Groups samples into epoch-aligned buckets of `bucket_ms` and reduces each
/// bucket. The output is keyed by bucket start and sorted ascending.
pub fn aggregate_buckets(
    samples: &[DataPoint],
    aggregation: Aggregation,
    bucket_ms: i64,
) -> Vec<DataPoint> {
    if bucket_ms <= 0 {
        return samples.to_vec();
    }

    let mut buckets: BTreeMap<i64, Vec<f64>> = BTreeMap::new();
    for sample in samples {
        let bucket_start = sample.timestamp - sample.timestamp.rem_euclid(bucket_ms);
        buckets.entry(bucket_start).or_default().push(sample.value);
    }

    buckets
        .into_iter()
        .map(|(timestamp, values)| DataPoint {
            timestamp,
            value: aggregation.reduce(&values),
        })
        .collect()
}

/// Nearest-rank percentile of an unsorted slice; `None` when empty.
pub fn percentile(values: &[f64], quantile: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (quantile.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
}

#[cfg(test)]
mod tests {
    use super::{aggregate_buckets, percentile, Aggregation};
    use crate::types::DataPoint;

    fn points(raw: &[(i64, f64)]) -> Vec<DataPoint> {
        raw.iter()
            .map(|(timestamp, value)| DataPoint {
                timestamp: *timestamp,
                value: *value,
            })
            .collect()
    }

    #[test]
    fn aggregate_buckets_aligns_to_bucket_start() {
        let samples = points(&[(1_000, 1.0), (1_500, 3.0), (2_100, 10.0), (3_999, 2.0)]);

        let avg = aggregate_buckets(&samples, Aggregation::Avg, 1_000);
        assert_eq!(avg, points(&[(1_000, 2.0), (2_000, 10.0), (3_000, 2.0)]));

        let count = aggregate_buckets(&samples, Aggregation::Count, 2_000);
        assert_eq!(count, points(&[(0, 2.0), (2_000, 2.0)]));
    }

    #[test]
    fn aggregate_buckets_min_max_sum() {
        let samples = points(&[(0, 4.0), (10, -1.0), (20, 7.0)]);
        assert_eq!(
            aggregate_buckets(&samples, Aggregation::Min, 100),
            points(&[(0, -1.0)])
        );
        assert_eq!(
            aggregate_buckets(&samples, Aggregation::Max, 100),
            points(&[(0, 7.0)])
        );
        assert_eq!(
            aggregate_buckets(&samples, Aggregation::Sum, 100),
            points(&[(0, 10.0)])
        );
    }

    #[test]
    fn aggregation_parses_case_insensitively() {
        assert_eq!("AVG".parse::<Aggregation>(), Ok(Aggregation::Avg));
        assert!("median".parse::<Aggregation>().is_err());
    }

    #[test]
    fn percentile_uses_nearest_rank() {
        let values: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(percentile(&values, 0.95), Some(95.0));
        assert_eq!(percentile(&values, 0.99), Some(99.0));
        assert_eq!(percentile(&[42.0], 0.99), Some(42.0));
        assert_eq!(percentile(&[], 0.5), None);
    }
}
