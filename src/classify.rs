//! Class breaks and colors for the joined values

use geojson::FeatureCollection;
use serde::Serialize;

use crate::error::ClassifyError;
use crate::join::VALUE_PROPERTY;
use crate::types::{ClassMethod, ColorScheme};

/// Fill for features without a usable value
pub const NO_DATA_COLOR: &str = "#cccccc";

pub const DEFAULT_CLASS_COUNT: usize = 5;

/// N+1 ascending breaks and N colors; class `i` spans `breaks[i]..=breaks[i + 1]`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub method: ClassMethod,
    pub scheme: ColorScheme,
    pub breaks: Vec<f64>,
    pub colors: Vec<&'static str>,
}

impl Classification {
    pub fn class_count(&self) -> usize {
        self.colors.len()
    }

    /// Index of the first class containing `value`; shared boundaries go to the lower class
    pub fn class_of(&self, value: Option<f64>) -> Option<usize> {
        let v = value.filter(|v| v.is_finite())?;
        self.breaks
            .windows(2)
            .position(|w| w[0] <= v && v <= w[1])
    }

    pub fn color_for(&self, value: Option<f64>) -> &'static str {
        self.class_of(value)
            .and_then(|i| self.colors.get(i).copied())
            .unwrap_or(NO_DATA_COLOR)
    }

    /// Number of values landing in each class
    pub fn class_counts(&self, values: &[Option<f64>]) -> Vec<usize> {
        let mut counts = vec![0; self.class_count()];
        for v in values {
            if let Some(i) = self.class_of(*v) {
                counts[i] += 1;
            }
        }
        counts
    }

    /// Decimal places that keep adjacent breaks distinguishable in a label
    fn label_precision(&self) -> usize {
        let (Some(first), Some(last)) = (self.breaks.first(), self.breaks.last()) else {
            return 0;
        };
        let span = last - first;
        let reference = if span > 0.0 { span } else { first.abs() };
        if !reference.is_finite() || reference == 0.0 || reference >= 10.0 {
            0
        } else if reference >= 1.0 {
            1
        } else {
            ((-reference.log10()).ceil() as usize + 1).min(6)
        }
    }

    /// Legend rows as (label, color)
    pub fn legend_entries(&self) -> Vec<(String, &'static str)> {
        self.colors
            .iter()
            .enumerate()
            .filter_map(|(i, color)| {
                let lo = self.breaks.get(i)?;
                let p = self.label_precision();
                let label = match self.breaks.get(i + 1) {
                    Some(hi) => format!("{:.*} - {:.*}", p, lo, p, hi),
                    None => format!("{:.*}+", p, lo),
                };
                Some((label, *color))
            })
            .collect()
    }
}

/// A palette supplies at most as many classes as it has colors
pub fn check_class_count(class_count: usize, scheme: ColorScheme) -> Result<(), ClassifyError> {
    let max = scheme.colors().len();
    if class_count == 0 || class_count > max {
        return Err(ClassifyError::ClassCount {
            requested: class_count,
            max,
            scheme: scheme.as_str(),
        });
    }
    Ok(())
}

/// Compute breaks over the finite values; NaN and missing values are ignored
pub fn classify(
    values: &[Option<f64>],
    class_count: usize,
    method: ClassMethod,
    scheme: ColorScheme,
) -> Result<Classification, ClassifyError> {
    check_class_count(class_count, scheme)?;
    let palette = scheme.colors();

    let mut sorted: Vec<f64> = values
        .iter()
        .filter_map(|v| v.filter(|v| v.is_finite()))
        .collect();
    sorted.sort_by(f64::total_cmp);

    let breaks = match (sorted.first(), sorted.last()) {
        (Some(&min), Some(&max)) => match method {
            ClassMethod::Quantile => (0..=class_count)
                .map(|i| sorted[i * (sorted.len() - 1) / class_count])
                .collect(),
            ClassMethod::Equal => {
                // dividing first keeps the step finite when max - min overflows
                let n = class_count as f64;
                let interval = max / n - min / n;
                let mut breaks: Vec<f64> = (0..=class_count)
                    .map(|i| min + interval * i as f64)
                    .collect();
                // keep max inclusive despite rounding
                breaks[class_count] = max;
                breaks
            }
        },
        _ => Vec::new(),
    };

    Ok(Classification {
        method,
        scheme,
        breaks,
        colors: palette[..class_count].to_vec(),
    })
}

/// `choropleth_value` of every feature, None where it is null or absent
pub fn feature_values(collection: &FeatureCollection) -> Vec<Option<f64>> {
    collection
        .features
        .iter()
        .map(|f| {
            f.properties
                .as_ref()
                .and_then(|p| p.get(VALUE_PROPERTY))
                .and_then(|v| v.as_f64())
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValueStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

/// Summary of the finite values, None when there are none
pub fn value_stats(values: &[Option<f64>]) -> Option<ValueStats> {
    let finite: Vec<f64> = values
        .iter()
        .filter_map(|v| v.filter(|v| v.is_finite()))
        .collect();
    if finite.is_empty() {
        return None;
    }
    let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
    let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = finite.iter().sum::<f64>() / finite.len() as f64;
    Some(ValueStats {
        count: finite.len(),
        min,
        max,
        mean,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    fn approx(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-9)
    }

    #[test]
    fn test_equal_interval_breaks() {
        let values = some(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
        let c = classify(&values, 5, ClassMethod::Equal, ColorScheme::Reds).unwrap();
        assert!(approx(&c.breaks, &[1.0, 2.8, 4.6, 6.4, 8.2, 10.0]), "{:?}", c.breaks);
        assert_eq!(c.colors.len(), 5);
        assert_eq!(c.colors[0], "#fff5f0");
    }

    #[test]
    fn test_quantile_breaks_use_floor_index() {
        let values = some(&[10.0, 1.0, 9.0, 2.0, 8.0, 3.0, 7.0, 4.0, 6.0, 5.0]);
        let c = classify(&values, 5, ClassMethod::Quantile, ColorScheme::Blues).unwrap();
        // indexes floor(i * 9 / 5) = 0, 1, 3, 5, 7, 9
        assert_eq!(c.breaks, vec![1.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
    }

    #[test]
    fn test_quantile_duplicates_are_allowed() {
        let values = some(&[1.0, 1.0, 1.0, 1.0, 5.0]);
        let c = classify(&values, 4, ClassMethod::Quantile, ColorScheme::Reds).unwrap();
        assert_eq!(c.breaks, vec![1.0, 1.0, 1.0, 1.0, 5.0]);
        assert_eq!(c.class_of(Some(1.0)), Some(0));
        assert_eq!(c.class_of(Some(5.0)), Some(3));
    }

    #[test]
    fn test_every_finite_value_lands_in_a_class() {
        let values = some(&[0.1, 0.7, 3.3, 3.3, 9.9, 12.0, 12.5, 40.2, 41.0, 1e6]);
        for method in [ClassMethod::Quantile, ClassMethod::Equal] {
            for n in 1..=9 {
                let c = classify(&values, n, method, ColorScheme::Greens).unwrap();
                for v in &values {
                    assert!(c.class_of(*v).is_some(), "{:?} n={} v={:?}", method, n, v);
                }
                let counts = c.class_counts(&values);
                assert_eq!(counts.iter().sum::<usize>(), values.len());
            }
        }
    }

    #[test]
    fn test_shared_boundary_goes_to_lower_class() {
        let values = some(&[0.0, 10.0]);
        let c = classify(&values, 2, ClassMethod::Equal, ColorScheme::Reds).unwrap();
        assert_eq!(c.breaks, vec![0.0, 5.0, 10.0]);
        assert_eq!(c.class_of(Some(5.0)), Some(0));
        assert_eq!(c.class_of(Some(10.0)), Some(1));
    }

    #[test]
    fn test_missing_values_are_gray() {
        let values = vec![Some(1.0), None, Some(f64::NAN), Some(3.0)];
        let c = classify(&values, 2, ClassMethod::Equal, ColorScheme::Reds).unwrap();
        assert_eq!(c.color_for(None), NO_DATA_COLOR);
        assert_eq!(c.color_for(Some(f64::NAN)), NO_DATA_COLOR);
        assert_eq!(c.color_for(Some(1.0)), "#fff5f0");
        assert_eq!(c.color_for(Some(3.0)), "#fee0d2");
    }

    #[test]
    fn test_constant_values_fall_in_first_class() {
        let values = some(&[4.0, 4.0, 4.0]);
        let c = classify(&values, 3, ClassMethod::Equal, ColorScheme::Reds).unwrap();
        assert_eq!(c.class_of(Some(4.0)), Some(0));
    }

    #[test]
    fn test_no_values_yields_no_breaks() {
        let c = classify(&[None], 5, ClassMethod::Quantile, ColorScheme::Reds).unwrap();
        assert!(c.breaks.is_empty());
        assert_eq!(c.color_for(Some(1.0)), NO_DATA_COLOR);
    }

    #[test]
    fn test_class_count_bounds() {
        assert!(classify(&[], 0, ClassMethod::Equal, ColorScheme::Reds).is_err());
        assert!(classify(&[], 10, ClassMethod::Equal, ColorScheme::Reds).is_err());
        assert!(classify(&[], 10, ClassMethod::Equal, ColorScheme::Diverging).is_ok());
    }

    #[test]
    fn test_stats() {
        let stats = value_stats(&[Some(2.0), None, Some(4.0), Some(9.0)]).unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
        assert_eq!(stats.mean, 5.0);
        assert!(value_stats(&[None]).is_none());
    }

    #[test]
    fn test_legend_labels() {
        let c = classify(&some(&[0.0, 100.0]), 2, ClassMethod::Equal, ColorScheme::Reds).unwrap();
        let entries = c.legend_entries();
        assert_eq!(entries[0].0, "0 - 50");
        assert_eq!(entries[1].0, "50 - 100");
    }

    #[test]
    fn test_equal_interval_over_full_float_range() {
        let values = some(&[-1e308, 0.0, 1e308]);
        let c = classify(&values, 5, ClassMethod::Equal, ColorScheme::Reds).unwrap();
        assert!(c.breaks.iter().all(|b| b.is_finite()), "{:?}", c.breaks);
        assert!(c.breaks.windows(2).all(|w| w[0] <= w[1]));
        for v in &values {
            assert!(c.class_of(*v).is_some(), "{:?}", v);
        }
        assert_eq!(c.class_counts(&values).iter().sum::<usize>(), 3);
    }

    #[test]
    fn test_rate_labels_keep_decimals() {
        let c = classify(&some(&[0.0, 0.5, 1.0]), 5, ClassMethod::Equal, ColorScheme::Reds).unwrap();
        let labels: Vec<String> = c.legend_entries().into_iter().map(|(l, _)| l).collect();
        assert_eq!(labels[0], "0.0 - 0.2");
        assert_eq!(labels[4], "0.8 - 1.0");

        let c = classify(&some(&[0.01, 0.05]), 2, ClassMethod::Equal, ColorScheme::Reds).unwrap();
        assert_eq!(c.legend_entries()[0].0, "0.010 - 0.030");
    }
}
