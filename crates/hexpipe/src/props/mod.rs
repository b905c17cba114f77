//! Property normalization: allow/deny filtering, then numeric quantization.

mod filter;
mod quantize;

pub use filter::{DefaultPolicy, FilterSpec};
pub use quantize::{quantize_float, quantize_int, QuantizeRules, QuantizeStats};

use crate::value::PropertyBag;

/// Filters `props`, then quantizes what survives.
pub fn normalize(
    props: PropertyBag,
    filter: &FilterSpec,
    rules: &QuantizeRules,
) -> (PropertyBag, QuantizeStats) {
    let mut kept = filter.apply(props);
    if rules.is_noop() {
        return (kept, QuantizeStats::default());
    }
    let stats = rules.apply(&mut kept);
    (kept, stats)
}
