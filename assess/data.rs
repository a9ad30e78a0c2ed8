//! # Data Loading and Validation Module
//!
//! The exclusive entry point for user-provided data. Three CSV tables are read
//! from a data directory, checked against a fixed schema and turned into the
//! typed records the rule engine and encoder work on.
//!
//! - Strict Schema: column names are not configurable. Key columns (`UserID`,
//!   `TrendName`, `Ingredient`) are required; every other column may be absent,
//!   in which case its documented default applies.
//! - User-Centric Errors: a structurally broken file (unreadable, missing key
//!   column, empty key, duplicate key, bad risk-table entry) fails the whole
//!   load with a `DataError` naming the file, line and column. Duplicate keys
//!   are rejected so every (user, trend) pair is unique downstream.
//! - Record Isolation: an unparseable attribute on one user or trend is kept on
//!   that record as a `MalformedValue`. The record loads, and only the pairs it
//!   takes part in fail to encode.
//! - Normalisation: ingredient and allergy names are trimmed and lower-cased
//!   here, once, so every later comparison is exact.

use crate::matrix::DataIntegrityError;
use crate::types::{
    HormoneLevel, IngredientRiskEntry, MalformedValue, RiskCategory, RiskTable, SkinType, Trend,
    TrendCategory, TrendTargets, UserProfile, normalize_ingredient,
};
use ahash::{AHashMap, AHashSet};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const USERS_FILE: &str = "Users.csv";
pub const TRENDS_FILE: &str = "trends.csv";
pub const RISK_TABLE_FILE: &str = "ingredient_risk.csv";

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error reading '{}': {source}", .path.display())]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed CSV: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "The required column '{column}' was not found in '{file}'. Please check spelling and case."
    )]
    ColumnNotFound { file: String, column: &'static str },
    #[error("'{file}' line {line}: the required value '{column}' is empty.")]
    MissingValue {
        file: String,
        line: u64,
        column: &'static str,
    },
    #[error("'{file}' line {line}: column '{column}' has value '{value}', expected {expected}.")]
    InvalidValue {
        file: String,
        line: u64,
        column: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("'{file}' contains the id '{id}' more than once.")]
    DuplicateId { file: String, id: String },
}

/// A validated snapshot of all three input tables.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub users: Vec<UserProfile>,
    pub trends: Vec<Trend>,
    pub risk_table: RiskTable,
}

impl Dataset {
    pub fn new(users: Vec<UserProfile>, trends: Vec<Trend>, risk_table: RiskTable) -> Self {
        Self {
            users,
            trends,
            risk_table,
        }
    }

    /// Loads `Users.csv`, `trends.csv` and `ingredient_risk.csv` from `dir`.
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self, DataError> {
        let dir = dir.as_ref();
        log::info!("Loading data from '{}'", dir.display());
        let users = load_users(dir.join(USERS_FILE))?;
        let trends = load_trends(dir.join(TRENDS_FILE))?;
        let risk_table = load_risk_table(dir.join(RISK_TABLE_FILE))?;
        log::info!(
            "Loaded {} users, {} trends and {} ingredient risk entries.",
            users.len(),
            trends.len(),
            risk_table.len()
        );
        Ok(Self::new(users, trends, risk_table))
    }

    pub fn user(&self, id: &str) -> Option<&UserProfile> {
        self.users.iter().find(|user| user.id == id)
    }

    pub fn trend(&self, id: &str) -> Option<&Trend> {
        self.trends.iter().find(|trend| trend.id == id)
    }

    /// Resolves a (user, trend) pair, reporting whichever id is unknown.
    pub fn find_pair(
        &self,
        user_id: &str,
        trend_id: &str,
    ) -> Result<(&UserProfile, &Trend), DataIntegrityError> {
        let user = self
            .user(user_id)
            .ok_or_else(|| DataIntegrityError::UnknownUser(user_id.to_string()))?;
        let trend = self
            .trend(trend_id)
            .ok_or_else(|| DataIntegrityError::UnknownTrend(trend_id.to_string()))?;
        Ok((user, trend))
    }
}

/// Loads and validates the user table.
pub fn load_users<P: AsRef<Path>>(path: P) -> Result<Vec<UserProfile>, DataError> {
    let mut table = internal::Table::open(path.as_ref())?;
    let id_col = table.required("UserID")?;
    let age_col = table.optional("Age");
    let bmi_col = table.optional("BMI");
    let skin_col = table.optional("SkinType");
    let allergies_col = table.optional("Allergies");
    let hormone_col = table.optional("HormoneLevel");

    let mut users = Vec::new();
    let mut seen = AHashSet::new();
    for row in table.rows() {
        let row = row?;
        let id = row.required(id_col, "UserID")?.to_string();
        if !seen.insert(id.clone()) {
            return Err(row.duplicate(id));
        }

        let mut malformed = Vec::new();
        let age = row.get(age_col).and_then(|text| match text.parse::<f64>() {
            Ok(value) if value.is_finite() && value >= 0.0 => Some(value.round() as u32),
            _ => {
                malformed.push(row.malformed("age", text, "a non-negative number"));
                None
            }
        });
        let bmi = row.get(bmi_col).and_then(|text| match text.parse::<f64>() {
            Ok(value) => Some(value),
            Err(_) => {
                malformed.push(row.malformed("bmi", text, "a number"));
                None
            }
        });
        let skin_type = row
            .get(skin_col)
            .map_or_else(|| SkinType::Other("unknown".to_string()), SkinType::parse);
        let hormone_level = match row.get(hormone_col) {
            None => HormoneLevel::Normal,
            Some(text) => HormoneLevel::parse(text).unwrap_or_else(|| {
                log::warn!(
                    "{} line {}: unrecognised hormone level '{text}', treating it as normal",
                    row.file(),
                    row.line()
                );
                HormoneLevel::Normal
            }),
        };

        users.push(UserProfile {
            id,
            age,
            bmi,
            skin_type,
            allergies: internal::split_list(row.get(allergies_col)),
            hormone_level,
            malformed,
        });
    }
    log::debug!("Parsed {} users from {}", users.len(), table.file());
    Ok(users)
}

/// Loads and validates the trend table.
pub fn load_trends<P: AsRef<Path>>(path: P) -> Result<Vec<Trend>, DataError> {
    let mut table = internal::Table::open(path.as_ref())?;
    let id_col = table.required("TrendName")?;
    let type_col = table.optional("Type");
    let ingredients_col = table.optional("KeyIngredients");
    let target_col = table.optional("TargetSkinType");
    let weight_loss_col = table.optional("WeightLoss");

    let mut trends = Vec::new();
    let mut seen = AHashSet::new();
    for row in table.rows() {
        let row = row?;
        let id = row.required(id_col, "TrendName")?.to_string();
        if !seen.insert(id.clone()) {
            return Err(row.duplicate(id));
        }

        let skin_type = row.get(target_col).and_then(|text| {
            match text.to_lowercase().as_str() {
                "all" | "any" | "none" => None,
                _ => Some(SkinType::parse(text)),
            }
        });
        let mut malformed = Vec::new();
        let weight_loss = match row.get(weight_loss_col) {
            None => false,
            Some(text) => internal::parse_flag(text).unwrap_or_else(|| {
                malformed.push(row.malformed("weight_loss", text, "true/false, yes/no or 1/0"));
                false
            }),
        };

        trends.push(Trend {
            id,
            category: row
                .get(type_col)
                .map_or(TrendCategory::General, TrendCategory::parse),
            ingredients: internal::split_list(row.get(ingredients_col)),
            targets: TrendTargets {
                skin_type,
                weight_loss,
            },
            malformed,
        });
    }
    log::debug!("Parsed {} trends from {}", trends.len(), table.file());
    Ok(trends)
}

/// Loads and validates the ingredient risk table.
pub fn load_risk_table<P: AsRef<Path>>(path: P) -> Result<RiskTable, DataError> {
    let mut table = internal::Table::open(path.as_ref())?;
    let name_col = table.required("Ingredient")?;
    let banned_col = table.optional("Banned");
    let level_col = table.optional("RiskLevel");
    let category_col = table.optional("Category");
    let severity_col = table.optional("Severity");

    let mut entries = Vec::new();
    let mut seen = AHashSet::new();
    for row in table.rows() {
        let row = row?;
        let ingredient = normalize_ingredient(row.required(name_col, "Ingredient")?);
        if !seen.insert(ingredient.clone()) {
            return Err(row.duplicate(ingredient));
        }

        let banned = match (row.get(banned_col), row.get(level_col)) {
            (Some(text), _) => internal::parse_flag(text)
                .ok_or_else(|| row.invalid("Banned", text, "true/false, yes/no or 1/0"))?,
            (None, Some(level)) => level.eq_ignore_ascii_case("high"),
            (None, None) => false,
        };
        let category = match row.get(category_col) {
            None => RiskCategory::None,
            Some(text) => RiskCategory::parse(text).ok_or_else(|| {
                row.invalid("Category", text, "allergen, hormonal, irritant or none")
            })?,
        };
        let severity = match row.get(severity_col) {
            None => None,
            Some(text) => match text.parse::<f64>() {
                Ok(value) if value.is_finite() && value >= 0.0 => Some(value),
                _ => return Err(row.invalid("Severity", text, "a non-negative number")),
            },
        };

        entries.push(IngredientRiskEntry {
            ingredient,
            banned,
            category,
            severity,
        });
    }
    log::debug!("Parsed {} risk entries from {}", entries.len(), table.file());
    Ok(RiskTable::from_entries(entries))
}

/// Internal module for shared CSV handling.
mod internal {
    use super::*;

    /// Placeholders that mean "no value" in the input tables.
    const NULL_MARKERS: [&str; 3] = ["na", "n/a", "nan"];

    pub(super) struct Table {
        file: String,
        reader: csv::Reader<std::fs::File>,
        columns: AHashMap<String, usize>,
    }

    impl Table {
        pub(super) fn open(path: &Path) -> Result<Self, DataError> {
            let file = path.file_name().map_or_else(
                || path.display().to_string(),
                |name| name.to_string_lossy().into_owned(),
            );
            let handle = std::fs::File::open(path).map_err(|source| DataError::IoError {
                path: path.to_path_buf(),
                source,
            })?;
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .trim(csv::Trim::All)
                .from_reader(handle);
            let columns = reader
                .headers()?
                .iter()
                .enumerate()
                .map(|(i, name)| (name.trim().to_string(), i))
                .collect();
            Ok(Self {
                file,
                reader,
                columns,
            })
        }

        pub(super) fn file(&self) -> &str {
            &self.file
        }

        pub(super) fn required(&self, column: &'static str) -> Result<usize, DataError> {
            self.columns
                .get(column)
                .copied()
                .ok_or_else(|| DataError::ColumnNotFound {
                    file: self.file.clone(),
                    column,
                })
        }

        pub(super) fn optional(&self, column: &str) -> Option<usize> {
            self.columns.get(column).copied()
        }

        pub(super) fn rows(&mut self) -> impl Iterator<Item = Result<Row<'_>, DataError>> + '_ {
            let file = self.file.as_str();
            self.reader.records().map(move |record| {
                let record = record?;
                let line = record.position().map_or(0, |pos| pos.line());
                Ok(Row { file, line, record })
            })
        }
    }

    pub(super) struct Row<'a> {
        file: &'a str,
        line: u64,
        record: csv::StringRecord,
    }

    impl Row<'_> {
        pub(super) fn file(&self) -> &str {
            self.file
        }

        pub(super) fn line(&self) -> u64 {
            self.line
        }

        /// The trimmed value of a column, or `None` when the column is absent,
        /// the cell is empty or it holds a null marker.
        pub(super) fn get(&self, column: Option<usize>) -> Option<&str> {
            let value = self.record.get(column?)?.trim();
            let is_null = value.is_empty()
                || NULL_MARKERS
                    .iter()
                    .any(|marker| value.eq_ignore_ascii_case(marker));
            (!is_null).then_some(value)
        }

        pub(super) fn required(&self, column: usize, name: &'static str) -> Result<&str, DataError> {
            self.get(Some(column)).ok_or_else(|| DataError::MissingValue {
                file: self.file.to_string(),
                line: self.line,
                column: name,
            })
        }

        pub(super) fn invalid(
            &self,
            column: &'static str,
            value: &str,
            expected: &'static str,
        ) -> DataError {
            DataError::InvalidValue {
                file: self.file.to_string(),
                line: self.line,
                column,
                value: value.to_string(),
                expected,
            }
        }

        /// Records an unparseable attribute without failing the load.
        pub(super) fn malformed(
            &self,
            attribute: &'static str,
            raw: &str,
            expected: &'static str,
        ) -> MalformedValue {
            log::warn!(
                "{} line {}: '{raw}' is not a valid {attribute} (expected {expected}); \
                 pairs using this record will not be encoded",
                self.file,
                self.line
            );
            MalformedValue {
                attribute,
                raw: raw.to_string(),
                expected,
            }
        }

        pub(super) fn duplicate(&self, id: String) -> DataError {
            DataError::DuplicateId {
                file: self.file.to_string(),
                id,
            }
        }
    }

    /// Comma-separated names, normalised. `None` (any case) means an empty list.
    pub(super) fn split_list(value: Option<&str>) -> BTreeSet<String> {
        value
            .into_iter()
            .flat_map(|text| text.split(','))
            .map(normalize_ingredient)
            .filter(|name| !name.is_empty() && name != "none")
            .collect()
    }

    pub(super) fn parse_flag(text: &str) -> Option<bool> {
        match text.to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Some(true),
            "false" | "no" | "n" | "0" => Some(false),
            _ => None,
        }
    }
}
