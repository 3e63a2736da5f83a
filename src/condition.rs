//! Condition codes and the study's condition vocabulary.
//!
//! Raw recordings only ever carry **base** codes. **Compound** codes are
//! declared here, once, as the union of exactly two base codes; every
//! component resolves them through [`ConditionVocabulary::expand`].
//!
//! Default numbering (`hundreds · tens · units`):
//!
//! ```text
//! 1xx social      x1x visible     xx1 correct        xx2 wrong key   xx3 too slow
//! 2xx nonsocial   x2x invisible   xx1 correct guess  xx2 incorrect guess
//!
//! compound  x14 = x12 ∪ x13   collapsed visible error
//!           x23 = x21 ∪ x22   collapsed invisible
//! ```
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigError;
use crate::recording::TrialMeta;

/// Integer label of one experimental condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionCode(pub u16);

impl fmt::Display for ConditionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for ConditionCode {
    fn from(v: u16) -> Self {
        ConditionCode(v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseCondition {
    pub code: ConditionCode,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundCondition {
    pub code: ConditionCode,
    pub label: String,
    pub parts: [ConditionCode; 2],
}

/// Every condition the pipeline knows about, in processing order
/// (base codes first, then compounds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionVocabulary {
    pub base: Vec<BaseCondition>,
    #[serde(default)]
    pub compound: Vec<CompoundCondition>,
}

impl Default for ConditionVocabulary {
    fn default() -> Self {
        Self::study()
    }
}

impl ConditionVocabulary {
    /// The social/nonsocial × visible/invisible vocabulary of the study.
    pub fn study() -> Self {
        let base = |code: u16, label: &str| BaseCondition {
            code: ConditionCode(code),
            label: label.to_string(),
        };
        let compound = |code: u16, label: &str, a: u16, b: u16| CompoundCondition {
            code: ConditionCode(code),
            label: label.to_string(),
            parts: [ConditionCode(a), ConditionCode(b)],
        };
        Self {
            base: vec![
                base(111, "social visible correct"),
                base(112, "social visible wrong key"),
                base(113, "social visible too slow"),
                base(121, "social invisible correct guess"),
                base(122, "social invisible incorrect guess"),
                base(211, "nonsocial visible correct"),
                base(212, "nonsocial visible wrong key"),
                base(213, "nonsocial visible too slow"),
                base(221, "nonsocial invisible correct guess"),
                base(222, "nonsocial invisible incorrect guess"),
            ],
            compound: vec![
                compound(114, "social visible error", 112, 113),
                compound(123, "social invisible", 121, 122),
                compound(214, "nonsocial visible error", 212, 213),
                compound(223, "nonsocial invisible", 221, 222),
            ],
        }
    }

    /// Vocabulary made only of base codes (labels are the codes themselves).
    pub fn from_base_codes(codes: &[u16]) -> Self {
        Self {
            base: codes
                .iter()
                .map(|&c| BaseCondition { code: ConditionCode(c), label: c.to_string() })
                .collect(),
            compound: vec![],
        }
    }

    /// All codes in processing order.
    pub fn codes(&self) -> Vec<ConditionCode> {
        self.base
            .iter()
            .map(|b| b.code)
            .chain(self.compound.iter().map(|c| c.code))
            .collect()
    }

    pub fn contains(&self, code: ConditionCode) -> bool {
        self.base.iter().any(|b| b.code == code) || self.compound.iter().any(|c| c.code == code)
    }

    pub fn label(&self, code: ConditionCode) -> Option<&str> {
        self.base
            .iter()
            .find(|b| b.code == code)
            .map(|b| b.label.as_str())
            .or_else(|| self.compound.iter().find(|c| c.code == code).map(|c| c.label.as_str()))
    }

    /// Base codes making up `code`. `None` if the code is unknown.
    pub fn expand(&self, code: ConditionCode) -> Option<Vec<ConditionCode>> {
        if self.base.iter().any(|b| b.code == code) {
            return Some(vec![code]);
        }
        self.compound
            .iter()
            .find(|c| c.code == code)
            .map(|c| c.parts.to_vec())
    }

    /// Positions (into `trials`) of every trial belonging to `code`.
    ///
    /// For compound codes this is the union of both parts, in recording order.
    pub fn select_trials(&self, code: ConditionCode, trials: &[TrialMeta]) -> Vec<usize> {
        let Some(parts) = self.expand(code) else {
            return vec![];
        };
        trials
            .iter()
            .enumerate()
            .filter(|(_, t)| parts.contains(&t.code))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base.is_empty() {
            return Err(ConfigError::invalid("conditions.base", "vocabulary has no base codes"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for code in self.codes() {
            if !seen.insert(code) {
                return Err(ConfigError::invalid(
                    "conditions",
                    format!("code {code} declared more than once"),
                ));
            }
        }
        for c in &self.compound {
            let [a, b] = c.parts;
            if a == b {
                return Err(ConfigError::invalid(
                    "conditions.compound",
                    format!("compound {} joins {a} with itself", c.code),
                ));
            }
            for part in c.parts {
                if !self.base.iter().any(|bc| bc.code == part) {
                    return Err(ConfigError::invalid(
                        "conditions.compound",
                        format!("compound {} refers to {part}, which is not a base code", c.code),
                    ));
                }
            }
        }
        Ok(())
    }
}
