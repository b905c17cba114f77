use crate::error::PipelineError;
use crate::value::{PropertyBag, PropertyValue};
use serde::Serialize;
use std::collections::BTreeMap;

/// Rounding steps for numeric properties. A step of 0 disables rounding.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuantizeRules {
    pub float_step: f64,
    pub int_step: f64,
    /// Per-key overrides (case-sensitive), taking precedence over the type default.
    pub field_steps: BTreeMap<String, f64>,
}

/// What quantization changed on one feature (or, summed, on a run).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QuantizeStats {
    pub changes: u64,
    pub total_abs_error: f64,
    pub field_errors: BTreeMap<String, f64>,
}

impl QuantizeStats {
    fn record(&mut self, key: &str, diff: f64) {
        self.changes += 1;
        self.total_abs_error += diff;
        *self.field_errors.entry(key.to_owned()).or_default() += diff;
    }
}

impl QuantizeRules {
    /// Parses directives such as `float=0.01,int=1,score=0.05`.
    ///
    /// Tokens may be separated by commas, semicolons or whitespace. `float`
    /// and `int` (any case) set the type defaults; any other key is a
    /// per-field override.
    pub fn parse(spec: &str) -> Result<Self, PipelineError> {
        let mut rules = QuantizeRules::default();

        let tokens = spec
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .map(str::trim)
            .filter(|t| !t.is_empty());

        for token in tokens {
            let invalid = || PipelineError::Config(format!("invalid quantize token {token:?}"));

            let (key, value) = token.split_once('=').ok_or_else(invalid)?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return Err(invalid());
            }

            let step: f64 = value.parse().map_err(|e| {
                PipelineError::Config(format!("parse quantize value {token:?}: {e}"))
            })?;
            if !step.is_finite() || step < 0.0 {
                return Err(PipelineError::Config(format!(
                    "quantize step must be a non-negative number for {token:?}"
                )));
            }

            match key.to_ascii_lowercase().as_str() {
                "float" => rules.float_step = step,
                "int" => rules.int_step = step,
                _ => {
                    rules.field_steps.insert(key.to_owned(), step);
                }
            }
        }

        Ok(rules)
    }

    pub fn is_noop(&self) -> bool {
        self.float_step <= 0.0 && self.int_step <= 0.0 && self.field_steps.values().all(|s| *s <= 0.0)
    }

    fn step_for(&self, key: &str, value: &PropertyValue) -> f64 {
        if let Some(step) = self.field_steps.get(key) {
            return *step;
        }
        match value {
            PropertyValue::Float(_) => self.float_step,
            PropertyValue::Int(_) => self.int_step,
            PropertyValue::Null | PropertyValue::Bool(_) | PropertyValue::String(_) => 0.0,
        }
    }

    /// Rounds numeric values in place and reports what changed.
    pub fn apply(&self, props: &mut PropertyBag) -> QuantizeStats {
        let mut stats = QuantizeStats::default();

        for (key, value) in props.iter_mut() {
            let step = self.step_for(key, value);
            if step <= 0.0 {
                continue;
            }

            match value {
                PropertyValue::Float(v) => {
                    if let Some((quantized, diff)) = quantize_float(*v, step) {
                        *v = quantized;
                        stats.record(key, diff);
                    }
                }
                PropertyValue::Int(v) => {
                    if let Some((quantized, diff)) = quantize_int(*v, step) {
                        *v = quantized;
                        stats.record(key, diff);
                    }
                }
                PropertyValue::Null | PropertyValue::Bool(_) | PropertyValue::String(_) => {}
            }
        }

        stats
    }
}

/// Nearest multiple of `step`; `None` when the value is already on the grid.
///
/// Values within a few ulps of a grid point count as on the grid, so decimal
/// steps such as 0.1 leave `0.3` untouched.
pub fn quantize_float(value: f64, step: f64) -> Option<(f64, f64)> {
    if step <= 0.0 || !value.is_finite() {
        return None;
    }
    let k = (value / step).round();
    let inverse = (1.0 / step).round();
    // Dividing by an integral inverse yields the closest float to k/inverse.
    let quantized = if inverse >= 1.0 && (1.0 / step - inverse).abs() <= 1e-9 * inverse {
        k / inverse
    } else {
        k * step
    };
    let diff = (quantized - value).abs();
    if diff <= 4.0 * f64::EPSILON * value.abs().max(step) {
        return None;
    }
    Some((quantized, diff))
}

/// Same rule as [`quantize_float`], computed in floating point then truncated.
pub fn quantize_int(value: i64, step: f64) -> Option<(i64, f64)> {
    if step <= 0.0 {
        return None;
    }
    let quantized = ((value as f64 / step).round() * step) as i64;
    if quantized == value {
        return None;
    }
    let diff = (quantized as f64 - value as f64).abs();
    (diff != 0.0).then_some((quantized, diff))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults_and_overrides() {
        let rules = QuantizeRules::parse("float=0.01; INT=5 score=0.5,,").unwrap();
        assert_eq!(rules.float_step, 0.01);
        assert_eq!(rules.int_step, 5.0);
        assert_eq!(rules.field_steps.get("score"), Some(&0.5));
        assert!(QuantizeRules::parse("").unwrap().is_noop());
    }

    #[test]
    fn rejects_bad_directives() {
        for spec in ["float", "float=", "=1", "float=abc", "int=-1", "x=inf"] {
            assert!(
                matches!(QuantizeRules::parse(spec), Err(PipelineError::Config(_))),
                "{spec}"
            );
        }
    }

    #[test]
    fn values_on_the_grid_are_fixed_points() {
        assert_eq!(quantize_float(0.75, 0.25), None);
        assert_eq!(quantize_float(-3.0, 1.5), None);
        assert_eq!(quantize_int(40, 10.0), None);
        assert_eq!(quantize_int(7, 0.0), None);

        let rules = QuantizeRules {
            float_step: 0.25,
            int_step: 10.0,
            ..Default::default()
        };
        let mut props = PropertyBag::from([
            ("a".to_string(), PropertyValue::Float(0.5)),
            ("b".to_string(), PropertyValue::Int(30)),
        ]);
        let before = props.clone();
        let stats = rules.apply(&mut props);
        assert_eq!(props, before);
        assert_eq!(stats.changes, 0);
        assert!(stats.field_errors.is_empty());
    }

    #[test]
    fn decimal_steps_keep_decimal_values() {
        assert_eq!(quantize_float(0.3, 0.1), None);
        assert_eq!(quantize_float(0.7, 0.1), None);
        assert_eq!(quantize_float(1.15, 0.05), None);
        assert_eq!(quantize_float(-2.01, 0.01), None);

        assert_eq!(quantize_float(0.26, 0.1).map(|(q, _)| q), Some(0.3));
        let (q, _) = quantize_float(1.26, 0.1).unwrap();
        assert_eq!(q, 1.3);
        assert_eq!(quantize_float(q, 0.1), None);
    }

    #[test]
    fn error_is_bounded_by_half_step() {
        let steps = [0.001, 0.01, 0.3, 1.0, 2.5, 100.0];
        let mut v = -1234.5678_f64;
        while v < 1234.0 {
            for step in steps {
                if let Some((q, diff)) = quantize_float(v, step) {
                    assert!(diff <= step / 2.0 + 1e-9, "v={v} step={step} q={q}");
                    assert!((q - v).abs() - diff < 1e-12);
                }
            }
            v += 37.123;
        }

        for i in -1000_i64..1000 {
            if let Some((q, diff)) = quantize_int(i, 7.0) {
                assert!(diff <= 3.5, "i={i} q={q}");
            }
        }
    }

    #[test]
    fn applies_type_defaults_and_field_overrides() {
        let rules = QuantizeRules::parse("float=0.1,int=10,exact=0,coarse=100").unwrap();
        let mut props = PropertyBag::from([
            ("f".to_string(), PropertyValue::Float(1.26)),
            ("i".to_string(), PropertyValue::Int(14)),
            ("exact".to_string(), PropertyValue::Float(1.2345)),
            ("coarse".to_string(), PropertyValue::Int(149)),
            ("name".to_string(), PropertyValue::String("1.26".into())),
            ("flag".to_string(), PropertyValue::Bool(true)),
            ("none".to_string(), PropertyValue::Null),
        ]);

        let stats = rules.apply(&mut props);

        match props["f"] {
            PropertyValue::Float(v) => assert_eq!(v, 1.3),
            ref other => panic!("unexpected {other:?}"),
        }
        assert_eq!(props["i"], PropertyValue::Int(10));
        assert_eq!(props["exact"], PropertyValue::Float(1.2345));
        assert_eq!(props["coarse"], PropertyValue::Int(100));
        assert_eq!(props["name"], PropertyValue::String("1.26".into()));
        assert_eq!(props["flag"], PropertyValue::Bool(true));

        assert_eq!(stats.changes, 3);
        assert!((stats.field_errors["i"] - 4.0).abs() < 1e-9);
        assert!((stats.field_errors["coarse"] - 49.0).abs() < 1e-9);
        assert!((stats.total_abs_error - (0.04 + 4.0 + 49.0)).abs() < 1e-9);
    }
}
