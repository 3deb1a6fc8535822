//! Database-backed tests for redemption, the ledger and usage counters
//!
//! Every test creates its own users and codes, so they can share a database.
//! Ledger, redemption and audit tables are append-only and are never cleaned up.
//!
//! ## Running Tests
//! ```bash
//! export DATABASE_URL="postgres://localhost/repurpose_test"
//! cargo test -p repurpose-credits --test engine_integration -- --ignored --test-threads=1
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]
#![allow(clippy::expect_used)]

use std::collections::HashSet;

use repurpose_credits::{
    CodeSelector, CodeUpdate, CounterFeature, CreditEngine, CreditError, DeductOutcome,
    GenerateCodesRequest, Limit, LtdCode, PlanChange, RedeemOutcome, RejectionReason, TierTable,
};
use repurpose_shared::types::{LtdTier, PlanType, UserId};
use sqlx::PgPool;
use uuid::Uuid;

// ============================================================================
// Test Utilities
// ============================================================================

async fn setup() -> (CreditEngine, PgPool) {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    let pool = repurpose_shared::create_pool(&database_url, 20)
        .await
        .expect("Failed to connect to test database");
    repurpose_shared::run_migrations(&pool).await.expect("Failed to run migrations");

    // Generous lock wait so the concurrency tests measure races, not timeouts
    let engine = CreditEngine::new(pool.clone(), TierTable::default(), 5_000);
    (engine, pool)
}

async fn create_user(engine: &CreditEngine) -> UserId {
    let user_id = UserId::new();
    engine
        .plans
        .ensure_user(user_id, &format!("test-{}@example.com", user_id), 10)
        .await
        .expect("Failed to create test user");
    user_id
}

async fn create_code(engine: &CreditEngine, tier: i32, max_redemptions: i32) -> String {
    let batch = engine
        .codes
        .generate_codes(
            GenerateCodesRequest {
                tier,
                quantity: 1,
                prefix: None,
                max_redemptions: Some(max_redemptions),
                expires_at: None,
                notes: Some("integration test".into()),
            },
            UserId::new(),
        )
        .await
        .expect("Failed to generate code");
    batch.codes[0].code.clone()
}

async fn redeem(engine: &CreditEngine, user_id: UserId, code: &str) -> RedeemOutcome {
    engine.redemptions.redeem(user_id, code).await.expect("Redemption failed")
}

fn in_batch(codes: &[LtdCode], batch_id: &str) -> usize {
    codes.iter().filter(|c| c.batch_id == batch_id).count()
}

async fn set_credits(pool: &PgPool, user_id: UserId, credits: i64) {
    sqlx::query("UPDATE users SET credits = $2 WHERE id = $1")
        .bind(user_id.0)
        .bind(credits)
        .execute(pool)
        .await
        .expect("Failed to set credits");
}

async fn ledger_entries(pool: &PgPool, user_id: UserId, action_type: &str) -> i64 {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM credit_usage_log WHERE user_id = $1 AND action_type = $2",
    )
    .bind(user_id.0)
    .bind(action_type)
    .fetch_one(pool)
    .await
    .expect("Failed to count ledger entries")
}

fn rejection(outcome: &RedeemOutcome) -> Option<RejectionReason> {
    match outcome {
        RedeemOutcome::Rejected { reason, .. } => Some(*reason),
        RedeemOutcome::Redeemed { .. } => None,
    }
}

// ============================================================================
// Redemption
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_redeem_upgrades_free_user() {
    let (engine, _pool) = setup().await;
    let user = create_user(&engine).await;
    let code = create_code(&engine, 2, 1).await;

    let outcome = redeem(&engine, user, &code).await;
    match outcome {
        RedeemOutcome::Redeemed {
            tier,
            previous_tier,
            credits,
            monthly_limit,
            stacked_codes,
            ..
        } => {
            assert_eq!(tier, LtdTier::new(2).unwrap());
            assert_eq!(previous_tier, None);
            assert_eq!(credits, 10 + 300);
            assert_eq!(monthly_limit, 300);
            assert_eq!(stacked_codes, 1);
        }
        other => panic!("expected redemption, got {:?}", other),
    }

    let plan = engine.plans.get(user).await.unwrap().unwrap();
    assert_eq!(plan.plan_type, PlanType::Ltd);
    assert!(plan.credit_reset_date.is_some());
}

#[tokio::test]
#[ignore] // Requires database
async fn test_lower_tier_code_stacks_without_downgrade() {
    let (engine, _pool) = setup().await;
    let user = create_user(&engine).await;
    let high = create_code(&engine, 3, 1).await;
    let low = create_code(&engine, 1, 1).await;

    assert!(redeem(&engine, user, &high).await.is_success());
    assert!(redeem(&engine, user, &low).await.is_success());

    let plan = engine.plans.get(user).await.unwrap().unwrap();
    assert_eq!(plan.ltd_tier, Some(LtdTier::new(3).unwrap()));
    assert_eq!(plan.monthly_credit_limit, 750 + 100);
    assert_eq!(plan.credits, 10 + 750 + 100);
    assert_eq!(plan.stacked_codes, 2);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_higher_tier_code_resets_limit_to_new_allotment() {
    let (engine, _pool) = setup().await;
    let user = create_user(&engine).await;
    let low = create_code(&engine, 1, 1).await;
    let high = create_code(&engine, 4, 1).await;

    assert!(redeem(&engine, user, &low).await.is_success());
    assert!(redeem(&engine, user, &high).await.is_success());

    let plan = engine.plans.get(user).await.unwrap().unwrap();
    let tier_4 = LtdTier::new(4).unwrap();
    assert_eq!(plan.ltd_tier, Some(tier_4));
    assert_eq!(
        plan.monthly_credit_limit,
        engine.tiers.monthly_credits(tier_4).unwrap()
    );
    assert_eq!(plan.credits, 10 + 100 + 2000);
    assert_eq!(plan.stacked_codes, 2);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_same_code_twice_is_already_redeemed() {
    let (engine, pool) = setup().await;
    let user = create_user(&engine).await;
    let code = create_code(&engine, 1, 5).await;

    assert!(redeem(&engine, user, &code).await.is_success());
    let second = redeem(&engine, user, &code).await;
    assert_eq!(rejection(&second), Some(RejectionReason::AlreadyRedeemed));

    let stored = engine.codes.find_by_code(&code).await.unwrap().unwrap();
    assert_eq!(stored.current_redemptions, 1);
    assert_eq!(ledger_entries(&pool, user, "ltd_redemption").await, 1);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_code_lookup_is_case_insensitive() {
    let (engine, _pool) = setup().await;
    let user = create_user(&engine).await;
    let code = create_code(&engine, 1, 1).await;

    let outcome = engine
        .redemptions
        .redeem(user, &format!("  {}  ", code.to_lowercase()))
        .await
        .unwrap();
    assert!(outcome.is_success());
}

#[tokio::test]
#[ignore] // Requires database
async fn test_unusable_codes_are_invalid() {
    let (engine, pool) = setup().await;
    let user = create_user(&engine).await;

    let unknown = engine
        .redemptions
        .redeem(user, &format!("NOPE-{}", Uuid::new_v4().simple()))
        .await
        .unwrap();
    assert_eq!(rejection(&unknown), Some(RejectionReason::CodeInvalid));

    let disabled = create_code(&engine, 1, 1).await;
    sqlx::query("UPDATE ltd_codes SET is_active = FALSE WHERE code = $1")
        .bind(&disabled)
        .execute(&pool)
        .await
        .unwrap();
    let outcome = redeem(&engine, user, &disabled).await;
    assert_eq!(rejection(&outcome), Some(RejectionReason::CodeInvalid));

    let expired = create_code(&engine, 1, 1).await;
    sqlx::query("UPDATE ltd_codes SET expires_at = NOW() - INTERVAL '1 minute' WHERE code = $1")
        .bind(&expired)
        .execute(&pool)
        .await
        .unwrap();
    let outcome = redeem(&engine, user, &expired).await;
    assert_eq!(rejection(&outcome), Some(RejectionReason::CodeInvalid));

    let plan = engine.plans.get(user).await.unwrap().unwrap();
    assert_eq!(plan.plan_type, PlanType::Free);
    assert_eq!(plan.credits, 10);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_concurrent_redemption_never_exceeds_max() {
    let (engine, pool) = setup().await;
    let code = create_code(&engine, 2, 3).await;

    let mut users = Vec::new();
    for _ in 0..10 {
        users.push(create_user(&engine).await);
    }

    let mut handles = Vec::new();
    for user in users {
        let engine = engine.clone();
        let code = code.clone();
        handles.push(tokio::spawn(async move {
            engine.redemptions.redeem(user, &code).await
        }));
    }

    let mut redeemed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(RedeemOutcome::Redeemed { .. }) => redeemed += 1,
            Ok(RedeemOutcome::Rejected { reason, .. }) => assert!(
                matches!(
                    reason,
                    RejectionReason::ConcurrentExhaustion | RejectionReason::CodeInvalid
                ),
                "unexpected rejection {:?}",
                reason
            ),
            Err(e) => assert!(e.is_retryable(), "unexpected error {:?}", e),
        }
    }

    let stored = engine.codes.find_by_code(&code).await.unwrap().unwrap();
    assert!(redeemed <= 3);
    assert_eq!(stored.current_redemptions, redeemed);

    let records: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM ltd_redemptions WHERE code_id = $1")
            .bind(stored.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(records, i64::from(redeemed));
}

// ============================================================================
// Ledger
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_insufficient_credits_changes_nothing() {
    let (engine, pool) = setup().await;
    let user = create_user(&engine).await;

    let outcome = engine
        .ledger
        .deduct(user, 11, "style_training", None)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DeductOutcome::Rejected {
            reason: RejectionReason::InsufficientCredits,
            remaining: 10
        }
    );
    assert_eq!(
        engine.ledger.credits_remaining(user).await.unwrap(),
        Some(10)
    );
    assert_eq!(ledger_entries(&pool, user, "style_training").await, 0);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_deduct_logs_balance_after() {
    let (engine, _pool) = setup().await;
    let user = create_user(&engine).await;

    let outcome = engine
        .ledger
        .deduct(
            user,
            4,
            "viral_hook",
            Some(serde_json::json!({ "post_id": 7 })),
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DeductOutcome::Deducted {
            charged: 4,
            remaining: 6
        }
    );

    let history = engine.ledger.usage_history(user, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].credits_used, 4);
    assert_eq!(history[0].credits_remaining, 6);
    assert_eq!(history[0].metadata["post_id"], 7);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_concurrent_deductions_never_overdraw() {
    let (engine, pool) = setup().await;
    let user = create_user(&engine).await;

    let mut handles = Vec::new();
    for _ in 0..25 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.ledger.deduct(user, 1, "content_repurposing", None).await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(DeductOutcome::Deducted { .. }) => succeeded += 1,
            Ok(DeductOutcome::Rejected { reason, .. }) => {
                assert_eq!(reason, RejectionReason::InsufficientCredits)
            }
            Err(e) => assert!(e.is_retryable(), "unexpected error {:?}", e),
        }
    }

    assert!(succeeded <= 10);
    let remaining = engine.ledger.credits_remaining(user).await.unwrap().unwrap();
    assert_eq!(remaining, 10 - succeeded);
    assert_eq!(
        ledger_entries(&pool, user, "content_repurposing").await,
        succeeded
    );
}

#[tokio::test]
#[ignore] // Requires database
async fn test_overdue_reset_applies_once_with_capped_rollover() {
    let (engine, pool) = setup().await;
    let user = create_user(&engine).await;
    let code = create_code(&engine, 1, 1).await;
    assert!(redeem(&engine, user, &code).await.is_success());

    set_credits(&pool, user, 2_000).await;
    sqlx::query("UPDATE users SET credit_reset_date = NOW() - INTERVAL '3 months' WHERE id = $1")
        .bind(user.0)
        .execute(&pool)
        .await
        .unwrap();

    assert!(engine.ledger.reset_if_due(user).await.unwrap());
    assert!(!engine.ledger.reset_if_due(user).await.unwrap());

    let plan = engine.plans.get(user).await.unwrap().unwrap();
    // Tier 1: limit 100, rollover cap 12 months of it
    assert_eq!(plan.rollover_credits, 1_200);
    assert_eq!(plan.credits, 100 + 1_200);
    let next_reset = plan.credit_reset_date.unwrap();
    assert!(next_reset > time::OffsetDateTime::now_utc());
    assert_eq!(ledger_entries(&pool, user, "monthly_reset").await, 1);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_plan_read_does_not_wait_on_locked_row_when_not_due() {
    let (engine, pool) = setup().await;
    let user = create_user(&engine).await;
    let code = create_code(&engine, 1, 1).await;
    assert!(redeem(&engine, user, &code).await.is_success());

    let mut holder = pool.begin().await.unwrap();
    sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
        .bind(user.0)
        .execute(&mut *holder)
        .await
        .unwrap();

    let read = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        engine.ledger.reset_if_due(user),
    )
    .await
    .expect("reset check blocked on the row lock");
    assert!(!read.unwrap());
    holder.rollback().await.unwrap();

    let missing = engine.ledger.reset_if_due(UserId::new()).await.unwrap();
    assert!(!missing);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_add_and_set_balance() {
    let (engine, _pool) = setup().await;
    let user = create_user(&engine).await;

    assert_eq!(engine.ledger.add(user, 15, "support").await.unwrap(), 25);
    let corrected = engine.ledger.set_balance(user, 3, "correction").await;
    assert_eq!(corrected.unwrap(), 3);

    let missing = engine.ledger.add(UserId::new(), 5, "support").await;
    assert!(matches!(missing, Err(CreditError::NotFound(_))));
}

// ============================================================================
// Counters and gate
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_try_consume_stops_at_cap() {
    let (engine, _pool) = setup().await;
    let user = create_user(&engine).await;

    for _ in 0..3 {
        let check = engine
            .counters
            .try_consume(user, CounterFeature::Scheduling, Limit::Capped(3), 1)
            .await
            .unwrap();
        assert!(check.allowed);
    }
    let over = engine
        .counters
        .try_consume(user, CounterFeature::Scheduling, Limit::Capped(3), 1)
        .await
        .unwrap();
    assert!(!over.allowed);
    assert_eq!(over.reason, Some(RejectionReason::LimitExceeded));
    let scheduled = engine.counters.current(user, CounterFeature::Scheduling).await;
    assert_eq!(scheduled.unwrap(), 3);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_charge_action_respects_tier_and_credits() {
    let (engine, _pool) = setup().await;
    let user = create_user(&engine).await;

    // Free plan has no scheduling
    let outcome = engine.charge_action(user, "schedule_post", None).await.unwrap();
    assert!(matches!(
        outcome,
        repurpose_credits::ChargeOutcome::Rejected {
            reason: RejectionReason::TierRestricted,
            ..
        }
    ));

    let code = create_code(&engine, 2, 1).await;
    assert!(redeem(&engine, user, &code).await.is_success());

    let outcome = engine.charge_action(user, "schedule_post", None).await.unwrap();
    match outcome {
        repurpose_credits::ChargeOutcome::Charged { charged, usage, .. } => {
            assert_eq!(charged, 1);
            assert_eq!(usage, Some(1));
        }
        other => panic!("expected charge, got {:?}", other),
    }
}

#[tokio::test]
#[ignore] // Requires database
async fn test_gate_reports_upgrade_tier() {
    let (engine, _pool) = setup().await;
    let user = create_user(&engine).await;

    let decision = engine
        .gate
        .check_feature_access(user, repurpose_credits::Feature::AiChat)
        .await
        .unwrap();
    assert!(!decision.has_access);
    assert_eq!(decision.upgrade_required, Some(LtdTier::new(3).unwrap()));

    let unknown = engine
        .gate
        .check_feature_access(UserId::new(), repurpose_credits::Feature::AiChat)
        .await
        .unwrap();
    assert_eq!(unknown.reason, Some(RejectionReason::UserNotFound));
}

// ============================================================================
// Admin
// ============================================================================

#[tokio::test]
#[ignore] // Requires database
async fn test_admin_plan_change_is_audited() {
    let (engine, pool) = setup().await;
    let user = create_user(&engine).await;
    let admin = UserId::new();

    let snapshot = engine
        .admin
        .change_plan(
            user,
            PlanChange {
                tier: Some(5),
                monthly_credit_limit: None,
                reason: Some("enterprise migration".into()),
            },
            admin,
        )
        .await
        .unwrap();
    assert_eq!(snapshot.tier, Some(LtdTier::new(5).unwrap()));
    assert_eq!(snapshot.monthly_limit, 5_000);

    let outcomes: Vec<String> = sqlx::query_scalar(
        "SELECT details->>'outcome' FROM admin_ltd_actions WHERE admin_user_id = $1",
    )
    .bind(admin.0)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(outcomes, vec!["success".to_string()]);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_failed_admin_action_is_audited() {
    let (engine, pool) = setup().await;
    let admin = UserId::new();

    let result = engine
        .admin
        .grant_credits(UserId::new(), 50, "goodwill", admin)
        .await;
    assert!(matches!(result, Err(CreditError::NotFound(_))));

    let outcome: String = sqlx::query_scalar(
        "SELECT details->>'outcome' FROM admin_ltd_actions WHERE admin_user_id = $1",
    )
    .bind(admin.0)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(outcome, "failed");
}

#[tokio::test]
#[ignore] // Requires database
async fn test_bulk_deactivate_batch() {
    let (engine, _pool) = setup().await;
    let admin = UserId::new();
    let batch = engine
        .codes
        .generate_codes(
            GenerateCodesRequest {
                tier: 4,
                quantity: 5,
                prefix: Some("BULK-".into()),
                max_redemptions: None,
                expires_at: None,
                notes: None,
            },
            admin,
        )
        .await
        .unwrap();
    let unique: HashSet<&str> = batch.codes.iter().map(|c| c.code.as_str()).collect();
    assert_eq!(unique.len(), 5);

    let changed = engine
        .codes
        .set_active(CodeSelector::Batch(batch.batch_id.clone()), false, admin)
        .await
        .unwrap();
    assert_eq!(changed, 5);

    let validation = engine.codes.validate_code(&batch.codes[0].code).await.unwrap();
    assert!(!validation.valid);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_invariant_checks_run() {
    let (engine, _pool) = setup().await;
    let summary = engine.invariant_checker().run_all_checks().await.unwrap();
    assert_eq!(summary.checks_run, repurpose_credits::Invariant::ALL.len());
}

#[tokio::test]
#[ignore] // Requires database
async fn test_batch_lifecycle_expire_and_delete_unredeemed() {
    let (engine, pool) = setup().await;
    let admin = UserId::new();
    let user = create_user(&engine).await;
    let batch = engine
        .codes
        .generate_codes(
            GenerateCodesRequest {
                tier: 2,
                quantity: 10,
                prefix: None,
                max_redemptions: Some(1),
                expires_at: None,
                notes: None,
            },
            admin,
        )
        .await
        .unwrap();
    assert_eq!(batch.codes.len(), 10);

    let redeemed = batch.codes[0].code.clone();
    assert!(redeem(&engine, user, &redeemed).await.is_success());
    assert!(!engine.codes.validate_code(&redeemed).await.unwrap().valid);

    sqlx::query("UPDATE ltd_codes SET expires_at = NOW() - INTERVAL '1 day' WHERE batch_id = $1")
        .bind(&batch.batch_id)
        .execute(&pool)
        .await
        .unwrap();

    let first = engine.codes.sweep_expired().await.unwrap();
    assert_eq!(in_batch(&first, &batch.batch_id), 10);
    let second = engine.codes.sweep_expired().await.unwrap();
    assert_eq!(in_batch(&second, &batch.batch_id), 0);

    let deleted = engine
        .codes
        .delete_unredeemed(CodeSelector::Batch(batch.batch_id.clone()), admin)
        .await
        .unwrap();
    assert_eq!(deleted.len(), 9);
    assert!(deleted.iter().all(|c| c.code != redeemed));

    let survivor = engine.codes.find_by_code(&redeemed).await.unwrap().unwrap();
    assert_eq!(survivor.current_redemptions, 1);
    assert!(!survivor.is_active);
}

#[tokio::test]
#[ignore] // Requires database
async fn test_redeemed_code_cannot_be_deleted() {
    let (engine, _pool) = setup().await;
    let admin = UserId::new();
    let user = create_user(&engine).await;
    let code = create_code(&engine, 1, 1).await;
    assert!(redeem(&engine, user, &code).await.is_success());

    let stored = engine.codes.find_by_code(&code).await.unwrap().unwrap();
    let err = engine.codes.delete_code(stored.id, admin).await.unwrap_err();
    assert!(matches!(err, CreditError::IntegrityViolation(_)));
    assert!(engine.codes.get_code(stored.id).await.unwrap().is_some());

    let unused = create_code(&engine, 1, 1).await;
    let unused = engine.codes.find_by_code(&unused).await.unwrap().unwrap();
    engine.codes.delete_code(unused.id, admin).await.unwrap();
    assert!(engine.codes.get_code(unused.id).await.unwrap().is_none());
}

#[tokio::test]
#[ignore] // Requires database
async fn test_max_redemptions_cannot_drop_below_redeemed() {
    let (engine, _pool) = setup().await;
    let admin = UserId::new();
    let code = create_code(&engine, 1, 3).await;
    for _ in 0..2 {
        let user = create_user(&engine).await;
        assert!(redeem(&engine, user, &code).await.is_success());
    }
    let stored = engine.codes.find_by_code(&code).await.unwrap().unwrap();

    let lowered = CodeUpdate {
        max_redemptions: Some(1),
        ..CodeUpdate::default()
    };
    let err = engine.codes.update_code(stored.id, lowered, admin).await.unwrap_err();
    assert!(matches!(err, CreditError::IntegrityViolation(_)));

    let unchanged = engine.codes.get_code(stored.id).await.unwrap().unwrap();
    assert_eq!(unchanged.max_redemptions, 3);

    let to_exact = CodeUpdate {
        max_redemptions: Some(2),
        ..CodeUpdate::default()
    };
    let updated = engine.codes.update_code(stored.id, to_exact, admin).await.unwrap();
    assert_eq!(updated.max_redemptions, 2);
    assert!(!engine.codes.validate_code(&code).await.unwrap().valid);
}
