pub mod artifacts;
pub mod bits;
pub mod bitset;
pub mod io;
pub mod matrix;

use serde::{Deserialize, Serialize};

/// Sign of a mask decision: does the observed user carry the attribute or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// The user has the attribute (`+a`).
    Has,
    /// The user lacks the attribute (`−a`).
    Lacks,
}

/// One signed decision of an attack mask.
///
/// The canonical in-memory form is this explicit pair; the legacy on-disk
/// form is a single JSON number per decision (see [`legacy_mask`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignedAttr {
    pub attr: u32,
    pub polarity: Polarity,
}

impl SignedAttr {
    pub fn has(attr: u32) -> Self {
        Self {
            attr,
            polarity: Polarity::Has,
        }
    }

    pub fn lacks(attr: u32) -> Self {
        Self {
            attr,
            polarity: Polarity::Lacks,
        }
    }

    pub fn is_positive(&self) -> bool {
        self.polarity == Polarity::Has
    }
}

/// One step of a targeted fingerprinting run: how many users remained
/// indistinguishable after the mask grew to `len_mask` decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub len_anon_set: u64,
    pub len_mask: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum MaskError {
    #[error("number {0} is not a legacy signed attribute")]
    BadValue(f64),
    #[error("legacy mask entry is not a number")]
    NotANumber,
}

/// Tolerance for recognizing the `±0.01` signed-zero sentinels.
const SENTINEL_EPSILON: f64 = 1e-9;

/// Converts a mask to the legacy numeric form: `+n` → `n`, `−n` → `-n`,
/// with `+0` written as `0` and `−0` written as `-0.01`.
pub fn mask_to_legacy(mask: &[SignedAttr]) -> Vec<serde_json::Number> {
    mask.iter()
        .map(|m| match (m.polarity, m.attr) {
            (Polarity::Has, a) => serde_json::Number::from(a),
            (Polarity::Lacks, 0) => {
                serde_json::Number::from_f64(-0.01).unwrap_or_else(|| serde_json::Number::from(0))
            }
            (Polarity::Lacks, a) => serde_json::Number::from(-i64::from(a)),
        })
        .collect()
}

/// Parses the legacy numeric form. Accepts `0` and `0.01` for `+0`,
/// and `-0.01` for `−0`.
pub fn mask_from_legacy(values: &[serde_json::Number]) -> Result<Vec<SignedAttr>, MaskError> {
    values
        .iter()
        .map(|v| {
            let x = v.as_f64().ok_or(MaskError::NotANumber)?;
            if x >= 0.0 {
                if x.fract() == 0.0 {
                    Ok(SignedAttr::has(x as u32))
                } else if (x - 0.01).abs() < SENTINEL_EPSILON {
                    Ok(SignedAttr::has(0))
                } else {
                    Err(MaskError::BadValue(x))
                }
            } else if x.fract() == 0.0 {
                Ok(SignedAttr::lacks(-x as u32))
            } else if (x + 0.01).abs() < SENTINEL_EPSILON {
                Ok(SignedAttr::lacks(0))
            } else {
                Err(MaskError::BadValue(x))
            }
        })
        .collect()
}

/// Serde adapter storing a `Vec<SignedAttr>` field as the legacy numeric
/// array. Use with `#[serde(with = "common::legacy_mask")]`.
pub mod legacy_mask {
    use super::{mask_from_legacy, mask_to_legacy, SignedAttr};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(mask: &[SignedAttr], ser: S) -> Result<S::Ok, S::Error> {
        ser.collect_seq(mask_to_legacy(mask))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<SignedAttr>, D::Error> {
        let raw = Vec::<serde_json::Number>::deserialize(de)?;
        mask_from_legacy(&raw).map_err(D::Error::custom)
    }
}
