//! # Feature Encoding
//!
//! Turns a (user, trend) pair into the fixed-width numeric vector the classifier
//! consumes. The mapping from categorical values to vector positions is captured
//! once in a [`Vocabulary`] fitted on the training snapshot, and that same
//! vocabulary is stored inside the trained model so inference reproduces the
//! training layout exactly.
//!
//! Canonical layout, in order:
//! 1. `age`, `bmi`, min-max scaled with the ranges seen at fit time.
//! 2. One-hot blocks for skin type, hormone level, trend category and target
//!    skin type. Each block ends with a reserved unknown slot.
//! 3. Pair features derived from the risk table (see [`PAIR_FEATURES`]).

use crate::rules::skin_mismatch;
use crate::types::{MalformedValue, RiskCategory, RiskTable, Trend, UserProfile};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Level name used for a trend that declares no target skin type.
const NO_TARGET: &str = "none";

/// Names of the pair features appended after the categorical blocks.
pub const PAIR_FEATURES: [&str; 8] = [
    "allergen_matches",
    "banned_count",
    "irritant_count",
    "hormonal_count",
    "has_allergies",
    "skin_mismatch",
    "weight_loss_claim",
    "known_severity",
];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EncodingError {
    #[error("{record} '{id}' is missing the required attribute '{attribute}'")]
    MissingAttribute {
        record: &'static str,
        id: String,
        attribute: &'static str,
    },
    #[error("{record} '{id}' has a malformed '{attribute}': {reason}")]
    Malformed {
        record: &'static str,
        id: String,
        attribute: &'static str,
        reason: String,
    },
}

/// The levels of one categorical attribute, in sorted order. Position `i` in the
/// block is `levels[i]`; position `levels.len()` is the unknown bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoricalBlock {
    pub levels: Vec<String>,
}

impl CategoricalBlock {
    fn fit<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let levels: BTreeSet<&str> = values.into_iter().collect();
        Self {
            levels: levels.into_iter().map(str::to_string).collect(),
        }
    }

    /// Block width including the unknown slot.
    #[inline]
    pub fn width(&self) -> usize {
        self.levels.len() + 1
    }

    /// Offset of `value` inside the block. Values not seen at fit time map to the
    /// unknown slot.
    pub fn position(&self, value: &str) -> usize {
        self.levels
            .binary_search_by(|level| level.as_str().cmp(value))
            .unwrap_or(self.levels.len())
    }

    fn names(&self, prefix: &'static str) -> impl Iterator<Item = String> + '_ {
        self.levels
            .iter()
            .map(move |level| format!("{prefix}={level}"))
            .chain(std::iter::once(format!("{prefix}=<unknown>")))
    }
}

/// Min-max range for one numeric attribute.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    pub min: f64,
    pub max: f64,
}

impl NumericRange {
    fn fit(values: impl IntoIterator<Item = f64>) -> Self {
        let (min, max) = values
            .into_iter()
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });
        if min.is_finite() && max.is_finite() {
            Self { min, max }
        } else {
            Self { min: 0.0, max: 1.0 }
        }
    }

    /// Scales `value` into the fitted range. Values outside the range extrapolate
    /// linearly; a degenerate range scales everything to zero.
    #[inline]
    pub fn scale(&self, value: f64) -> f64 {
        let span = self.max - self.min;
        if span > 0.0 {
            (value - self.min) / span
        } else {
            0.0
        }
    }
}

/// The fitted mapping from raw attributes to vector positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub age: NumericRange,
    pub bmi: NumericRange,
    pub skin_types: CategoricalBlock,
    pub hormone_levels: CategoricalBlock,
    pub categories: CategoricalBlock,
    pub target_skin_types: CategoricalBlock,
}

impl Vocabulary {
    /// Fits the vocabulary on the users and trends of one data snapshot.
    pub fn fit(users: &[UserProfile], trends: &[Trend]) -> Self {
        Self {
            age: NumericRange::fit(users.iter().filter_map(|u| u.age.map(f64::from))),
            bmi: NumericRange::fit(users.iter().filter_map(|u| u.bmi)),
            skin_types: CategoricalBlock::fit(users.iter().map(|u| u.skin_type.as_str())),
            hormone_levels: CategoricalBlock::fit(users.iter().map(|u| u.hormone_level.as_str())),
            categories: CategoricalBlock::fit(trends.iter().map(|t| t.category.as_str())),
            target_skin_types: CategoricalBlock::fit(trends.iter().map(target_level)),
        }
    }

    /// Length of every vector encoded under this vocabulary.
    pub fn width(&self) -> usize {
        2 + self.skin_types.width()
            + self.hormone_levels.width()
            + self.categories.width()
            + self.target_skin_types.width()
            + PAIR_FEATURES.len()
    }

    /// Column names in canonical order, one per vector position.
    pub fn feature_names(&self) -> Vec<String> {
        let mut names = vec!["age".to_string(), "bmi".to_string()];
        names.extend(self.skin_types.names("skin_type"));
        names.extend(self.hormone_levels.names("hormone_level"));
        names.extend(self.categories.names("category"));
        names.extend(self.target_skin_types.names("target_skin_type"));
        names.extend(PAIR_FEATURES.iter().map(|name| name.to_string()));
        names
    }
}

fn target_level(trend: &Trend) -> &str {
    trend
        .targets
        .skin_type
        .as_ref()
        .map_or(NO_TARGET, |skin| skin.as_str())
}

fn reject_malformed(
    record: &'static str,
    id: &str,
    malformed: &[MalformedValue],
) -> Result<(), EncodingError> {
    match malformed.first() {
        None => Ok(()),
        Some(bad) => Err(EncodingError::Malformed {
            record,
            id: id.to_string(),
            attribute: bad.attribute,
            reason: format!("could not read '{}' as {}", bad.raw, bad.expected),
        }),
    }
}

/// Encodes pairs under a fixed vocabulary and risk table.
#[derive(Clone, Copy)]
pub struct FeatureEncoder<'a> {
    vocabulary: &'a Vocabulary,
    risk_table: &'a RiskTable,
}

impl<'a> FeatureEncoder<'a> {
    pub fn new(vocabulary: &'a Vocabulary, risk_table: &'a RiskTable) -> Self {
        Self {
            vocabulary,
            risk_table,
        }
    }

    pub fn width(&self) -> usize {
        self.vocabulary.width()
    }

    /// Encodes one pair. Pure: the same inputs under the same vocabulary always
    /// yield the same vector, independent of call order.
    pub fn encode(&self, user: &UserProfile, trend: &Trend) -> Result<Array1<f64>, EncodingError> {
        reject_malformed("user", &user.id, &user.malformed)?;
        reject_malformed("trend", &trend.id, &trend.malformed)?;

        let age = user.age.ok_or_else(|| EncodingError::MissingAttribute {
            record: "user",
            id: user.id.clone(),
            attribute: "age",
        })?;
        let bmi = user.bmi.ok_or_else(|| EncodingError::MissingAttribute {
            record: "user",
            id: user.id.clone(),
            attribute: "bmi",
        })?;
        if !bmi.is_finite() || bmi <= 0.0 {
            return Err(EncodingError::Malformed {
                record: "user",
                id: user.id.clone(),
                attribute: "bmi",
                reason: format!("expected a finite positive value, found {bmi}"),
            });
        }

        let vocab = self.vocabulary;
        let mut features = Array1::<f64>::zeros(vocab.width());
        features[0] = vocab.age.scale(f64::from(age));
        features[1] = vocab.bmi.scale(bmi);

        let mut offset = 2;
        for (block, value) in [
            (&vocab.skin_types, user.skin_type.as_str()),
            (&vocab.hormone_levels, user.hormone_level.as_str()),
            (&vocab.categories, trend.category.as_str()),
            (&vocab.target_skin_types, target_level(trend)),
        ] {
            features[offset + block.position(value)] = 1.0;
            offset += block.width();
        }

        for (i, value) in self.pair_features(user, trend).into_iter().enumerate() {
            features[offset + i] = value;
        }

        Ok(features)
    }

    fn pair_features(&self, user: &UserProfile, trend: &Trend) -> [f64; PAIR_FEATURES.len()] {
        let mut banned = 0.0;
        let mut irritants = 0.0;
        let mut hormonal = 0.0;
        let mut severity = 0.0;
        for entry in trend
            .ingredients
            .iter()
            .filter_map(|ingredient| self.risk_table.lookup(ingredient))
        {
            if entry.banned {
                banned += 1.0;
            }
            match entry.category {
                RiskCategory::Irritant => irritants += 1.0,
                RiskCategory::Hormonal => hormonal += 1.0,
                RiskCategory::Allergen | RiskCategory::None => {}
            }
            severity += entry.severity.unwrap_or(0.0);
        }

        let allergen_matches = trend.ingredients.intersection(&user.allergies).count() as f64;
        let flag = |b: bool| if b { 1.0 } else { 0.0 };

        [
            allergen_matches,
            banned,
            irritants,
            hormonal,
            flag(!user.allergies.is_empty()),
            flag(skin_mismatch(user, trend)),
            flag(trend.targets.weight_loss),
            severity,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{sample_table, sample_trends, sample_users, trend, user};
    use crate::types::{HormoneLevel, SkinType, TrendCategory};
    use approx::assert_abs_diff_eq;

    fn fitted() -> (Vocabulary, RiskTable) {
        (
            Vocabulary::fit(&sample_users(), &sample_trends()),
            sample_table(),
        )
    }

    #[test]
    fn width_matches_feature_names() {
        let (vocab, _) = fitted();
        assert_eq!(vocab.feature_names().len(), vocab.width());
        // 2 numeric + (5+1) skin + (3+1) hormone + (3+1) category + (3+1) target + 8 pair
        assert_eq!(vocab.width(), 2 + 6 + 4 + 4 + 4 + 8);
    }

    #[test]
    fn encoding_is_pure_and_order_independent() {
        let (vocab, table) = fitted();
        let encoder = FeatureEncoder::new(&vocab, &table);
        let users = sample_users();
        let trends = sample_trends();

        let first = encoder.encode(&users[3], &trends[1]).unwrap();
        for u in users.iter().rev() {
            for t in &trends {
                encoder.encode(u, t).unwrap();
            }
        }
        let again = encoder.encode(&users[3], &trends[1]).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn unseen_skin_type_lands_in_unknown_bucket() {
        let users = vec![
            user("U1", SkinType::Oily, &[]),
            user("U2", SkinType::Dry, &[]),
        ];
        let trends = vec![trend("t", TrendCategory::Skincare, &["vitamin c"])];
        let vocab = Vocabulary::fit(&users, &trends);
        let table = sample_table();
        let encoder = FeatureEncoder::new(&vocab, &table);

        let stranger = user("U3", SkinType::Other("acne-prone".to_string()), &[]);
        let features = encoder.encode(&stranger, &trends[0]).unwrap();

        let unknown_slot = 2 + vocab.skin_types.levels.len();
        assert_eq!(vocab.skin_types.position("acne-prone"), vocab.skin_types.levels.len());
        assert_eq!(features[unknown_slot], 1.0);
        assert_eq!(features.slice(ndarray::s![2..unknown_slot]).sum(), 0.0);

        // A known-but-unfitted level behaves the same way.
        let normal = user("U4", SkinType::Normal, &[]);
        let features = encoder.encode(&normal, &trends[0]).unwrap();
        assert_eq!(features[unknown_slot], 1.0);
    }

    #[test]
    fn numeric_attributes_are_min_max_scaled() {
        let mut young = user("U1", SkinType::Oily, &[]);
        young.age = Some(20);
        young.bmi = Some(18.0);
        let mut old = user("U2", SkinType::Oily, &[]);
        old.age = Some(60);
        old.bmi = Some(38.0);
        let trends = vec![trend("t", TrendCategory::Diet, &[])];
        let vocab = Vocabulary::fit(&[young.clone(), old], &trends);
        let table = RiskTable::default();
        let encoder = FeatureEncoder::new(&vocab, &table);

        let mut middle = young.clone();
        middle.age = Some(40);
        middle.bmi = Some(28.0);
        let features = encoder.encode(&middle, &trends[0]).unwrap();
        assert_abs_diff_eq!(features[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(features[1], 0.5, epsilon = 1e-12);

        let features = encoder.encode(&young, &trends[0]).unwrap();
        assert_abs_diff_eq!(features[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn pair_features_reflect_the_risk_table() {
        let (vocab, table) = fitted();
        let encoder = FeatureEncoder::new(&vocab, &table);
        let mut u = user("U1", SkinType::Sensitive, &["fragrance"]);
        u.hormone_level = HormoneLevel::Low;
        let t = trend(
            "combo",
            TrendCategory::Skincare,
            &["fragrance", "hydroquinone", "salicylic acid", "unknown thing"],
        );
        let features = encoder.encode(&u, &t).unwrap();
        let pair = features.slice(ndarray::s![vocab.width() - PAIR_FEATURES.len()..]);

        assert_eq!(pair[0], 1.0); // allergen matches
        assert_eq!(pair[1], 1.0); // banned
        assert_eq!(pair[2], 2.0); // irritants
        assert_eq!(pair[3], 0.0); // hormonal
        assert_eq!(pair[4], 1.0); // has allergies
        assert_eq!(pair[5], 1.0); // sensitive skin, no target
        assert_eq!(pair[6], 0.0);
        assert_abs_diff_eq!(pair[7], 7.0, epsilon = 1e-12);
    }

    #[test]
    fn missing_and_malformed_attributes_are_rejected() {
        let (vocab, table) = fitted();
        let encoder = FeatureEncoder::new(&vocab, &table);
        let t = trend("t", TrendCategory::Diet, &[]);

        let mut no_age = user("U1", SkinType::Oily, &[]);
        no_age.age = None;
        assert!(matches!(
            encoder.encode(&no_age, &t),
            Err(EncodingError::MissingAttribute { attribute: "age", .. })
        ));

        let mut bad_bmi = user("U2", SkinType::Oily, &[]);
        bad_bmi.bmi = Some(f64::NAN);
        assert!(matches!(
            encoder.encode(&bad_bmi, &t),
            Err(EncodingError::Malformed { attribute: "bmi", .. })
        ));
    }

    #[test]
    fn unparsed_cells_fail_only_their_records() {
        let (vocab, table) = fitted();
        let encoder = FeatureEncoder::new(&vocab, &table);
        let good_user = user("U1", SkinType::Oily, &[]);
        let good_trend = trend("t", TrendCategory::Diet, &[]);

        let mut heavy = user("U2", SkinType::Oily, &[]);
        heavy.bmi = None;
        heavy.malformed.push(MalformedValue {
            attribute: "bmi",
            raw: "heavy".to_string(),
            expected: "a number",
        });
        match encoder.encode(&heavy, &good_trend) {
            Err(EncodingError::Malformed {
                record, attribute, reason, ..
            }) => {
                assert_eq!(record, "user");
                assert_eq!(attribute, "bmi");
                assert!(reason.contains("heavy"));
            }
            other => panic!("expected a malformed attribute, got {other:?}"),
        }

        let mut odd = trend("odd tea", TrendCategory::Diet, &["senna"]);
        odd.malformed.push(MalformedValue {
            attribute: "weight_loss",
            raw: "maybe".to_string(),
            expected: "true/false, yes/no or 1/0",
        });
        assert!(matches!(
            encoder.encode(&good_user, &odd),
            Err(EncodingError::Malformed { record: "trend", attribute: "weight_loss", .. })
        ));
        assert!(encoder.encode(&good_user, &good_trend).is_ok());
    }
}
