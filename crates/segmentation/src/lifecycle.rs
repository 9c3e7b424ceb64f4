//! RFM code → lifecycle stage classification.
//!
//! The stage table lists some codes under more than one stage. Classification
//! walks the table in `LifecycleStage::ALL` order and the first stage listing
//! the code wins. Codes listed nowhere fall back to `NewCustomers`.

use audience_core::types::LifecycleStage;
use std::collections::BTreeMap;

/// Stage → codes, in classification priority order.
pub const STAGE_TABLE: [(LifecycleStage, &[&str]); 11] = [
    (
        LifecycleStage::Champions,
        &["555", "554", "544", "545", "454", "455", "445"],
    ),
    (
        LifecycleStage::LoyalCustomers,
        &["543", "444", "435", "355", "354", "345", "344"],
    ),
    (
        LifecycleStage::PotentialLoyalists,
        &["512", "511", "422", "421", "412", "411", "311"],
    ),
    (
        LifecycleStage::NewCustomers,
        &["522", "521", "512", "511", "412", "411"],
    ),
    (
        LifecycleStage::Promising,
        &["512", "511", "422", "421", "411", "412"],
    ),
    (
        LifecycleStage::NeedAttention,
        &["413", "414", "343", "344", "313", "314"],
    ),
    (
        LifecycleStage::AboutToSleep,
        &["315", "314", "313", "213", "214", "215"],
    ),
    (
        LifecycleStage::AtRisk,
        &["155", "154", "144", "214", "215", "115"],
    ),
    (
        LifecycleStage::CannotLose,
        &["155", "254", "245", "145", "144"],
    ),
    (
        LifecycleStage::Hibernating,
        &["134", "135", "143", "142", "124", "125"],
    ),
    (
        LifecycleStage::Lost,
        &["111", "112", "121", "131", "141", "151"],
    ),
];

pub const FALLBACK_STAGE: LifecycleStage = LifecycleStage::NewCustomers;

pub fn classify(code: &str) -> LifecycleStage {
    STAGE_TABLE
        .iter()
        .find(|(_, codes)| codes.contains(&code))
        .map(|(stage, _)| *stage)
        .unwrap_or(FALLBACK_STAGE)
}

/// Codes listed under more than one stage, with every stage listing them in
/// table order. The first stage of each list is the one `classify` returns.
pub fn overlapping_codes() -> BTreeMap<&'static str, Vec<LifecycleStage>> {
    let mut listed: BTreeMap<&'static str, Vec<LifecycleStage>> = BTreeMap::new();
    for (stage, codes) in STAGE_TABLE.iter() {
        for code in codes.iter() {
            listed.entry(*code).or_default().push(*stage);
        }
    }
    listed.retain(|_, stages| stages.len() > 1);
    listed
}

pub fn is_ambiguous(code: &str) -> bool {
    STAGE_TABLE
        .iter()
        .filter(|(_, codes)| codes.contains(&code))
        .count()
        > 1
}

/// Advisory marketing actions for a stage.
pub fn recommended_actions(stage: LifecycleStage) -> Vec<String> {
    let actions: &[&str] = match stage {
        LifecycleStage::Champions => &[
            "Reward with exclusive offers and early access",
            "Invite to referral or ambassador programs",
        ],
        LifecycleStage::LoyalCustomers => &[
            "Upsell higher-value products",
            "Enroll in loyalty tiers",
        ],
        LifecycleStage::PotentialLoyalists => &[
            "Offer membership or loyalty sign-up",
            "Recommend complementary products",
        ],
        LifecycleStage::NewCustomers => &[
            "Run onboarding sequence",
            "Build the relationship with early support",
        ],
        LifecycleStage::Promising => &[
            "Create brand awareness with free trials",
            "Send targeted first-repeat incentives",
        ],
        LifecycleStage::NeedAttention => &[
            "Send limited-time offers",
            "Recommend based on past purchases",
        ],
        LifecycleStage::AboutToSleep => &[
            "Share popular products with discounts",
            "Reconnect through re-engagement campaigns",
        ],
        LifecycleStage::AtRisk => &[
            "Send personalized win-back emails",
            "Offer renewals and helpful resources",
        ],
        LifecycleStage::CannotLose => &[
            "Win back with new product announcements",
            "Reach out directly before they churn",
        ],
        LifecycleStage::Hibernating => &[
            "Offer other relevant products and special discounts",
            "Recreate brand value with low-cost reactivation",
        ],
        LifecycleStage::Lost => &[
            "Revive interest with a reach-out campaign",
            "Exclude from high-cost paid campaigns",
        ],
    };
    actions.iter().map(|a| a.to_string()).collect()
}
