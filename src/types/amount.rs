//! Raw amount representations delivered by balance modules.
//!
//! Modules report each balance field (`free`/`reserves`/`locks`/`extra`) in
//! whatever shape the chain's ledger uses: a bare amount, a single labelled
//! amount, or a list of labelled amounts. Everything is normalized to a list
//! of labelled entries before any arithmetic.

use serde::{Deserialize, Serialize};

use crate::serde_utils::{is_false, u128_string};

/// One labelled amount within a balance field.
///
/// The flags are only meaningful on specific fields: `include_in_total` on
/// `extra` entries, `include_in_transferable` and `exclude_from_fee_payable`
/// on lock entries. Modules leave the rest defaulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelledAmount {
    pub label: String,
    #[serde(with = "u128_string")]
    pub amount: u128,
    #[serde(default, skip_serializing_if = "is_false")]
    pub include_in_total: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub include_in_transferable: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub exclude_from_fee_payable: bool,
}

impl LabelledAmount {
    pub fn new(label: impl Into<String>, amount: u128) -> Self {
        Self {
            label: label.into(),
            amount,
            include_in_total: false,
            include_in_transferable: false,
            exclude_from_fee_payable: false,
        }
    }
}

/// A balance field as a module delivers it.
///
/// `#[serde(untagged)]` accepts all three wire shapes; [`AmountField::entries`]
/// is the canonical view used for arithmetic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AmountField {
    Plain(#[serde(with = "u128_string")] u128),
    Labelled(LabelledAmount),
    Many(Vec<LabelledAmount>),
}

impl Default for AmountField {
    fn default() -> Self {
        AmountField::Plain(0)
    }
}

impl AmountField {
    /// Normalize into the canonical list-of-labelled-amounts shape.
    ///
    /// A bare amount becomes a single unlabelled entry with default flags.
    pub fn entries(&self) -> Vec<LabelledAmount> {
        match self {
            AmountField::Plain(amount) => vec![LabelledAmount::new("", *amount)],
            AmountField::Labelled(entry) => vec![entry.clone()],
            AmountField::Many(entries) => entries.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            AmountField::Plain(amount) => *amount == 0,
            AmountField::Labelled(_) => false,
            AmountField::Many(entries) => entries.is_empty(),
        }
    }

    /// Sum across all entries. Used for `free`, `reserves`, and (filtered)
    /// `extra`.
    pub fn sum(&self) -> u128 {
        self.sum_where(|_| true)
    }

    /// Filtered sum over the normalized entries; a bare amount is filtered as
    /// an unlabelled entry with default flags.
    pub fn sum_where(&self, pred: impl Fn(&LabelledAmount) -> bool) -> u128 {
        self.entries()
            .iter()
            .filter(|e| pred(e))
            .map(|e| e.amount)
            .sum()
    }

    /// Maximum across all entries. Locks overlay rather than stack, so only
    /// the largest binding lock matters.
    pub fn max(&self) -> u128 {
        self.max_where(|_| true)
    }

    pub fn max_where(&self, pred: impl Fn(&LabelledAmount) -> bool) -> u128 {
        self.entries()
            .iter()
            .filter(|e| pred(e))
            .map(|e| e.amount)
            .max()
            .unwrap_or(0)
    }
}

impl From<u128> for AmountField {
    fn from(amount: u128) -> Self {
        AmountField::Plain(amount)
    }
}

impl From<LabelledAmount> for AmountField {
    fn from(entry: LabelledAmount) -> Self {
        AmountField::Labelled(entry)
    }
}

impl From<Vec<LabelledAmount>> for AmountField {
    fn from(entries: Vec<LabelledAmount>) -> Self {
        AmountField::Many(entries)
    }
}

/// Format a planck amount as a whole-token decimal string.
///
/// Trailing fractional zeroes are trimmed: `1000000000000` at 10 decimals
/// formats as `"100"`, not `"100.0000000000"`.
pub fn format_units(planck: u128, decimals: u8) -> String {
    if decimals == 0 {
        return planck.to_string();
    }
    let divisor = 10u128.pow(decimals as u32);
    let whole = planck / divisor;
    let frac = planck % divisor;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{frac:0width$}", width = decimals as usize);
    let frac = frac.trim_end_matches('0');
    format!("{whole}.{frac}")
}

/// Convert a planck amount to a lossy float token quantity, for fiat math.
pub fn to_float(planck: u128, decimals: u8) -> f64 {
    planck as f64 / 10f64.powi(decimals as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_amount_normalizes_to_single_entry() {
        let field = AmountField::from(42u128);
        let entries = field.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, 42);
        assert_eq!(entries[0].label, "");
    }

    #[test]
    fn sum_and_max_over_lists() {
        let field = AmountField::from(vec![
            LabelledAmount::new("staking", 100),
            LabelledAmount::new("vesting", 40),
        ]);
        assert_eq!(field.sum(), 140);
        assert_eq!(field.max(), 100);
    }

    #[test]
    fn filtered_max_over_empty_set_is_zero() {
        let field = AmountField::from(vec![LabelledAmount {
            include_in_transferable: true,
            ..LabelledAmount::new("vesting", 40)
        }]);
        assert_eq!(field.max_where(|e| !e.include_in_transferable), 0);
    }

    #[test]
    fn untagged_deserialization_accepts_all_shapes() {
        let plain: AmountField = serde_json::from_str(r#""1000""#).unwrap();
        assert_eq!(plain, AmountField::Plain(1000));

        let labelled: AmountField =
            serde_json::from_str(r#"{"label":"misc","amount":"5"}"#).unwrap();
        assert_eq!(labelled, AmountField::Labelled(LabelledAmount::new("misc", 5)));

        let many: AmountField =
            serde_json::from_str(r#"[{"label":"a","amount":"1"},{"label":"b","amount":"2"}]"#)
                .unwrap();
        assert_eq!(many.sum(), 3);
    }

    #[test]
    fn format_units_trims_trailing_zeroes() {
        assert_eq!(format_units(1_000_000_000_000, 10), "100");
        assert_eq!(format_units(1_234_500_000_000, 10), "123.45");
        assert_eq!(format_units(1, 10), "0.0000000001");
        assert_eq!(format_units(0, 10), "0");
        assert_eq!(format_units(7, 0), "7");
    }
}
