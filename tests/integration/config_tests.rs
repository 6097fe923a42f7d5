use std::env;

use stars_meter::config::{FreeLoadPolicy, MeterConfig};
use stars_meter::entitlement::{LoadSignals, PerKind, Plan, ResourceKind};
use stars_meter::error::MeterError;

#[test]
fn test_default_catalog() {
    let config = MeterConfig::default();
    config.validate().expect("default config must be valid");

    assert_eq!(config.base_quota(Plan::Free, ResourceKind::Text), 5);
    assert_eq!(config.base_quota(Plan::Free, ResourceKind::Image), 3);
    assert_eq!(config.base_quota(Plan::Ultra, ResourceKind::Image), 150);
    assert_eq!(config.plan_spec(Plan::Pro).map(|spec| spec.price), Some(499));
    assert_eq!(
        config.pack("week_ultra").map(|pack| pack.grant),
        Some(PerKind::new(500, 15))
    );
    assert_eq!(config.store_timeout(), std::time::Duration::from_secs(5));

    let (kind, offer) = config.promo.offer_for(Plan::Ultra).expect("ultra offer");
    assert_eq!(kind, "ultra_boost");
    assert_eq!(offer.grant, PerKind::new(200, 0));
    assert_eq!(config.promo_ttl(), chrono::Duration::minutes(60));
    assert_eq!(config.offer_cooldown(), chrono::Duration::hours(6));
    assert!(config.promo.offer_for(Plan::Free).is_none());
    assert!(config.free_load.is_none());
}

#[test]
fn test_free_load_tiers() {
    let policy = FreeLoadPolicy::default();
    let healthy = |active_users_today| LoadSignals {
        active_users_today,
        api_cost_today: 60,
        revenue_today: 100,
    };

    assert_eq!(policy.free_text(&healthy(0)), 25);
    assert_eq!(policy.free_text(&healthy(99)), 25);
    assert_eq!(policy.free_text(&healthy(100)), 20);
    assert_eq!(policy.free_text(&healthy(499)), 20);
    assert_eq!(policy.free_text(&healthy(500)), 15);
    assert_eq!(policy.free_text(&healthy(1999)), 15);
    assert_eq!(policy.free_text(&healthy(2000)), 10);

    // exactly 60% is still within budget
    assert!(!policy.over_budget(&healthy(10)));
    let over = LoadSignals {
        active_users_today: 10,
        api_cost_today: 61,
        revenue_today: 100,
    };
    assert!(policy.over_budget(&over));
    assert_eq!(policy.free_text(&over), 10);

    let no_revenue = LoadSignals {
        active_users_today: 10,
        ..LoadSignals::default()
    };
    assert_eq!(policy.free_text(&no_revenue), 10);
}

#[test]
fn test_partial_json_keeps_defaults() {
    let config = MeterConfig::from_json_str(
        r#"{
            "free_daily": { "text": 10, "image": 1 },
            "subscription_days": 14,
            "referral": { "percent": 25 }
        }"#,
    )
    .expect("config should parse");

    assert_eq!(config.free_daily, PerKind::new(10, 1));
    assert_eq!(config.subscription_days, 14);
    assert_eq!(config.referral.percent, 25);
    assert_eq!(config.referral.min_payout, 100);
    assert_eq!(config.base_quota(Plan::Basic, ResourceKind::Text), 50);
}

#[test]
fn test_invalid_configs_are_rejected() {
    for raw in [
        r#"{ "subscription_days": 0 }"#,
        r#"{ "referral": { "percent": 101 } }"#,
        r#"{ "referral": { "min_payout": 0 } }"#,
        r#"{ "store_timeout_ms": 0 }"#,
        r#"{ "trial_plan": "free" }"#,
        r#"{ "plans": { "basic": { "name": "Basic", "price": 199, "daily": { "text": 50, "image": 15 } } } }"#,
        r#"{ "free_daily": "lots" }"#,
        r#"{ "promo": { "ttl_minutes": 0 } }"#,
        r#"{ "promo": { "upgrade_usage_percent": 120 } }"#,
        r#"{ "promo": { "offers": { "a": { "plan": "pro", "grant": { "text": 1, "image": 0 } }, "b": { "plan": "pro", "grant": { "text": 2, "image": 0 } } } } }"#,
        r#"{ "promo": { "offers": { "a": { "plan": "free", "grant": { "text": 1, "image": 0 } } } } }"#,
        r#"{ "free_load": { "tiers": [ { "below_active_users": 500, "text": 20 }, { "below_active_users": 100, "text": 25 } ] } }"#,
    ] {
        let err = MeterConfig::from_json_str(raw).unwrap_err();
        assert!(matches!(err, MeterError::Config(_)), "{} gave {:?}", raw, err);
    }
}

#[test]
fn test_load_from_file_and_env() {
    let path = env::temp_dir().join(format!("meter_config_{}.json", fastrand::u64(..)));
    std::fs::write(&path, r#"{ "trial_days": 3, "subscription_days": 20 }"#).unwrap();

    env::set_var("METER_CONFIG", &path);
    env::set_var("SUB_DAYS", "45");
    env::set_var("RATE_LIMIT_IMAGE_PER_MIN", "2");
    env::set_var("PROMO_TTL_MINUTES", "30");
    let loaded = MeterConfig::load();

    env::set_var("SUB_DAYS", "forever");
    let broken = MeterConfig::load();

    env::remove_var("METER_CONFIG");
    env::remove_var("SUB_DAYS");
    env::remove_var("RATE_LIMIT_IMAGE_PER_MIN");
    env::remove_var("PROMO_TTL_MINUTES");
    std::fs::remove_file(&path).unwrap();

    let config = loaded.expect("config should load");
    assert_eq!(config.trial_days, 3);
    assert_eq!(config.subscription_days, 45, "env overrides the file");
    assert_eq!(config.abuse.image_per_minute, 2);
    assert_eq!(config.promo.ttl_minutes, 30);

    assert!(matches!(broken, Err(MeterError::Config(_))));
}
