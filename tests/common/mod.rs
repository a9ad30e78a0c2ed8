use std::fs;
use std::path::Path;

pub const TRENDS_CSV: &str = "\
TrendName,Type,KeyIngredients,TargetSkinType,WeightLoss
Glow Serum,Skincare,\"Fragrance, Vitamin C\",Oily,no
Acid Peel,Skincare,\"Glycolic Acid, Salicylic Acid\",Oily,no
Whitening Cream,Skincare,\"Hydroquinone, Vitamin C\",,no
Hydrating Mask,Skincare,Hyaluronic Acid,Dry,no
Soy Shake,Dietary,\"Soy Isoflavones, Green Tea Extract\",,yes
Detox Tea,Dietary,\"Green Tea Extract, Senna\",,yes
Maca Boost,Supplement,\"Maca Root, Peanut Oil\",,no
Collagen Powder,Supplement,Collagen,,no
Fragrance Mist,Skincare,Fragrance,,no
Keto Bar,Dietary,\"Peanut Oil, Whey\",,no
";

pub const RISK_CSV: &str = "\
Ingredient,Banned,RiskLevel,Category,Severity
Fragrance,false,Medium,allergen,
Peanut Oil,false,Medium,allergen,4
Vitamin C,false,Low,none,0
Hyaluronic Acid,false,Low,none,0
Hydroquinone,true,High,irritant,5
Salicylic Acid,false,Medium,irritant,2
Glycolic Acid,false,Medium,irritant,2
Senna,false,Medium,irritant,1
Soy Isoflavones,false,Medium,hormonal,2
Maca Root,false,Low,hormonal,1.5
Green Tea Extract,false,Low,none,0
Collagen,false,Low,none,0
Whey,false,Low,none,0
";

/// Twelve users cycling through skin types, allergy profiles and hormone levels.
pub fn users_csv() -> String {
    let skins = ["Oily", "Dry", "Combination", "Sensitive", "Normal"];
    let allergies = ["None", "Fragrance", "Peanut Oil"];
    let hormones = ["Normal", "Low", "Normal", "High"];

    let mut csv = String::from("UserID,Age,BMI,SkinType,Allergies,HormoneLevel\n");
    for i in 0..12 {
        csv.push_str(&format!(
            "U{},{},{:.1},{},{},{}\n",
            i + 1,
            20 + 3 * i,
            19.0 + 1.5 * i as f64,
            skins[i % skins.len()],
            allergies[i % allergies.len()],
            hormones[i % hormones.len()],
        ));
    }
    csv
}

pub fn write_sample_data(dir: &Path) {
    fs::write(dir.join("Users.csv"), users_csv()).expect("write users");
    fs::write(dir.join("trends.csv"), TRENDS_CSV).expect("write trends");
    fs::write(dir.join("ingredient_risk.csv"), RISK_CSV).expect("write risk table");
}
