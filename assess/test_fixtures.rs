//! Shared builders for unit tests.

use crate::types::{
    HormoneLevel, IngredientRiskEntry, RiskCategory, RiskTable, SkinType, Trend, TrendCategory,
    TrendTargets, UserProfile, normalize_ingredient,
};

pub(crate) fn user(id: &str, skin_type: SkinType, allergies: &[&str]) -> UserProfile {
    UserProfile {
        id: id.to_string(),
        age: Some(28),
        bmi: Some(24.0),
        skin_type,
        allergies: allergies.iter().map(|a| normalize_ingredient(a)).collect(),
        hormone_level: HormoneLevel::Normal,
        malformed: Vec::new(),
    }
}

pub(crate) fn trend(id: &str, category: TrendCategory, ingredients: &[&str]) -> Trend {
    Trend {
        id: id.to_string(),
        category,
        ingredients: ingredients.iter().map(|i| normalize_ingredient(i)).collect(),
        targets: TrendTargets::default(),
        malformed: Vec::new(),
    }
}

pub(crate) fn entry(
    ingredient: &str,
    category: RiskCategory,
    severity: Option<f64>,
    banned: bool,
) -> IngredientRiskEntry {
    IngredientRiskEntry {
        ingredient: ingredient.to_string(),
        banned,
        category,
        severity,
    }
}

pub(crate) fn sample_table() -> RiskTable {
    RiskTable::from_entries([
        entry("fragrance", RiskCategory::Allergen, None, false),
        entry("peanut oil", RiskCategory::Allergen, Some(4.0), false),
        entry("vitamin c", RiskCategory::None, Some(0.0), false),
        entry("hyaluronic acid", RiskCategory::None, Some(0.0), false),
        entry("hydroquinone", RiskCategory::Irritant, Some(5.0), true),
        entry("salicylic acid", RiskCategory::Irritant, Some(2.0), false),
        entry("glycolic acid", RiskCategory::Irritant, Some(2.0), false),
        entry("senna", RiskCategory::Irritant, Some(1.0), false),
        entry("soy isoflavones", RiskCategory::Hormonal, Some(2.0), false),
        entry("maca root", RiskCategory::Hormonal, Some(1.5), false),
        entry("green tea extract", RiskCategory::None, Some(0.0), false),
        entry("collagen", RiskCategory::None, Some(0.0), false),
        entry("whey", RiskCategory::None, Some(0.0), false),
    ])
}

/// Twelve users spread over every skin type, allergy profile, hormone level and
/// a BMI range that crosses the high-BMI threshold.
pub(crate) fn sample_users() -> Vec<UserProfile> {
    let skins = [
        SkinType::Oily,
        SkinType::Dry,
        SkinType::Combination,
        SkinType::Sensitive,
        SkinType::Normal,
    ];
    let allergy_sets: [&[&str]; 3] = [&[], &["fragrance"], &["peanut oil"]];
    let hormones = [
        HormoneLevel::Normal,
        HormoneLevel::Low,
        HormoneLevel::Normal,
        HormoneLevel::High,
    ];

    (0..12)
        .map(|i| {
            let mut profile = user(
                &format!("U{}", i + 1),
                skins[i % skins.len()].clone(),
                allergy_sets[i % allergy_sets.len()],
            );
            profile.age = Some(20 + 3 * i as u32);
            profile.bmi = Some(19.0 + 1.5 * i as f64);
            profile.hormone_level = hormones[i % hormones.len()];
            profile
        })
        .collect()
}

pub(crate) fn sample_trends() -> Vec<Trend> {
    let mut glow = trend("glow serum", TrendCategory::Skincare, &["fragrance", "vitamin c"]);
    glow.targets.skin_type = Some(SkinType::Oily);
    let mut peel = trend(
        "acid peel",
        TrendCategory::Skincare,
        &["glycolic acid", "salicylic acid"],
    );
    peel.targets.skin_type = Some(SkinType::Oily);
    let whitening = trend(
        "whitening cream",
        TrendCategory::Skincare,
        &["hydroquinone", "vitamin c"],
    );
    let mut mask = trend("hydrating mask", TrendCategory::Skincare, &["hyaluronic acid"]);
    mask.targets.skin_type = Some(SkinType::Dry);
    let mut shake = trend(
        "soy shake",
        TrendCategory::Diet,
        &["soy isoflavones", "green tea extract"],
    );
    shake.targets.weight_loss = true;
    let mut detox = trend("detox tea", TrendCategory::Diet, &["green tea extract", "senna"]);
    detox.targets.weight_loss = true;

    vec![
        glow,
        peel,
        whitening,
        mask,
        shake,
        detox,
        trend("maca boost", TrendCategory::Supplement, &["maca root", "peanut oil"]),
        trend("collagen powder", TrendCategory::Supplement, &["collagen"]),
        trend("fragrance mist", TrendCategory::Skincare, &["fragrance"]),
        trend("keto bar", TrendCategory::Diet, &["peanut oil", "whey"]),
    ]
}
