use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use uuid::Uuid;

use super::*;
use crate::error::BoundReason;
use crate::test_support::{venture, Fixture};

/// Owner 35, alice 5, bob 0, reserve 60. Owner floor 20, holder cap 10.
async fn scenario_a() -> Fixture {
    let fx = Fixture::new();
    fx.seed(
        venture("v1", 20.0, 10.0, 60.0),
        &[("owner", 35.0), ("alice", 5.0), ("bob", 0.0), ("reserve", 60.0)],
    )
    .await;
    fx
}

#[tokio::test]
async fn test_adjustments_move_equity_and_keep_sum() {
    let fx = scenario_a().await;
    let period = Uuid::new_v4();

    let outcome = fx
        .ledger
        .apply_adjustments(
            &fx.ctx(),
            "v1",
            period,
            &[
                HolderDelta::new("alice", to_pct(-1.0)),
                HolderDelta::new("bob", to_pct(1.0)),
            ],
        )
        .await
        .unwrap();

    assert_eq!(outcome.transactions.len(), 2);
    assert_eq!(outcome.reserve_delta(), 0);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(fx.pct("v1", "alice").await, to_pct(4.0));
    assert_eq!(fx.pct("v1", "bob").await, to_pct(1.0));
    assert_eq!(fx.pct("v1", "owner").await, to_pct(35.0));
    assert_eq!(fx.pct("v1", "reserve").await, to_pct(60.0));
    assert_eq!(fx.total("v1").await, HUNDRED_PCT);

    let log = fx.repo.transactions("v1", None).await.unwrap();
    assert_eq!(log.iter().map(|t| t.seq).collect::<Vec<_>>(), vec![1, 2]);
    assert!(log.iter().all(|t| t.cause_ref == period.to_string()));
    assert!(log.iter().all(|t| t.kind == crate::models::TransactionKind::Rebalance));
    assert_eq!(fx.events.count("equity_adjusted"), 2);
}

#[tokio::test]
async fn test_reserve_balances_net_change() {
    let fx = scenario_a().await;
    let outcome = fx
        .ledger
        .apply_adjustments(&fx.ctx(), "v1", Uuid::new_v4(), &[HolderDelta::new("bob", to_pct(2.5))])
        .await
        .unwrap();

    assert_eq!(outcome.reserve_delta(), to_pct(-2.5));
    assert_eq!(outcome.applied().count(), 1);
    assert_eq!(fx.pct("v1", "reserve").await, to_pct(57.5));
    assert_eq!(fx.total("v1").await, HUNDRED_PCT);
}

#[tokio::test]
async fn test_new_holder_gets_user_row() {
    let fx = scenario_a().await;
    fx.ledger
        .apply_adjustments(&fx.ctx(), "v1", Uuid::new_v4(), &[HolderDelta::new("carol", to_pct(0.5))])
        .await
        .unwrap();

    let table = fx.ledger.get_cap_table("v1").await.unwrap();
    let carol = table.iter().find(|e| e.holder_id == "carol").unwrap();
    assert_eq!(carol.holder_type, HolderType::User);
    assert_eq!(carol.pct, to_pct(0.5));
    assert_eq!(carol.source, "REBALANCE");
}

#[tokio::test]
async fn test_bound_breaches_are_skipped_not_fatal() {
    let fx = scenario_a().await;
    let outcome = fx
        .ledger
        .apply_adjustments(
            &fx.ctx(),
            "v1",
            Uuid::new_v4(),
            &[
                HolderDelta::new("owner", to_pct(-16.0)),
                HolderDelta::new("alice", to_pct(6.0)),
                HolderDelta::new("bob", to_pct(-0.5)),
                HolderDelta::new("reserve", to_pct(1.0)),
                HolderDelta::new("carol", to_pct(1.0)),
            ],
        )
        .await
        .unwrap();

    let reasons: Vec<(&str, &BoundReason)> = outcome
        .skipped
        .iter()
        .map(|s| (s.holder_id.as_str(), &s.reason))
        .collect();
    assert!(matches!(reasons[..], [
        ("owner", BoundReason::OwnerFloor { .. }),
        ("bob", BoundReason::BelowZero { .. }),
        ("alice", BoundReason::HolderCap { .. }),
        ("reserve", BoundReason::ReserveTarget),
    ]));

    assert_eq!(outcome.applied().count(), 1);
    assert_eq!(fx.pct("v1", "carol").await, to_pct(1.0));
    assert_eq!(fx.pct("v1", "owner").await, to_pct(35.0));
    assert_eq!(fx.pct("v1", "alice").await, to_pct(5.0));
    assert_eq!(fx.total("v1").await, HUNDRED_PCT);
    assert_eq!(fx.events.count("adjustment_skipped"), 4);
}

#[tokio::test]
async fn test_owner_may_grow_and_capped_holder_may_shrink() {
    let fx = Fixture::new();
    fx.seed(
        venture("v1", 20.0, 10.0, 40.0),
        &[("owner", 40.0), ("alice", 20.0), ("reserve", 40.0)],
    )
    .await;

    let outcome = fx
        .ledger
        .apply_adjustments(
            &fx.ctx(),
            "v1",
            Uuid::new_v4(),
            &[
                HolderDelta::new("owner", to_pct(2.0)),
                HolderDelta::new("alice", to_pct(-2.0)),
            ],
        )
        .await
        .unwrap();

    assert!(outcome.skipped.is_empty());
    assert_eq!(fx.pct("v1", "owner").await, to_pct(42.0));
    assert_eq!(fx.pct("v1", "alice").await, to_pct(18.0));
}

#[tokio::test]
async fn test_reductions_fund_increases_in_same_batch() {
    let fx = Fixture::new();
    fx.seed(
        venture("v1", 20.0, 10.0, 0.0),
        &[("owner", 90.0), ("alice", 10.0), ("reserve", 0.0)],
    )
    .await;

    // increase listed first; still funded by the reduction
    let outcome = fx
        .ledger
        .apply_adjustments(
            &fx.ctx(),
            "v1",
            Uuid::new_v4(),
            &[
                HolderDelta::new("bob", to_pct(1.0)),
                HolderDelta::new("alice", to_pct(-1.0)),
            ],
        )
        .await
        .unwrap();

    assert!(outcome.skipped.is_empty());
    assert_eq!(outcome.reserve_delta(), 0);
    assert_eq!(fx.pct("v1", "bob").await, to_pct(1.0));
    assert_eq!(fx.pct("v1", "reserve").await, 0);
}

#[tokio::test]
async fn test_conversion_without_reserve_is_skipped() {
    let fx = Fixture::new();
    fx.seed(
        venture("v1", 20.0, 10.0, 2.0),
        &[("owner", 98.0), ("reserve", 2.0)],
    )
    .await;

    let window = Uuid::new_v4();
    let outcome = fx
        .ledger
        .apply_conversions(&fx.ctx(), "v1", window, &[HolderDelta::new("alice", to_pct(3.0))])
        .await
        .unwrap();

    assert!(outcome.transactions.is_empty());
    assert_eq!(outcome.attempts, 0);
    assert!(outcome.skipped[0].is_reserve_shortfall());
    assert_eq!(fx.repo.transaction_count("v1"), 0);
    assert_eq!(fx.events.count("conversion_skipped"), 1);

    let err = fx
        .ledger
        .apply_conversions(&fx.ctx(), "v1", window, &[HolderDelta::new("alice", -1)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn test_conversion_emits_conversion_events() {
    let fx = scenario_a().await;
    let window = Uuid::new_v4();
    fx.ledger
        .apply_conversions(&fx.ctx(), "v1", window, &[HolderDelta::new("bob", to_pct(1.0))])
        .await
        .unwrap();

    assert_eq!(fx.events.count("conversion_applied"), 1);
    // reserve move is reported as a plain adjustment
    assert_eq!(fx.events.count("equity_adjusted"), 1);
    let log = fx.repo.transactions_for("v1", &window.to_string()).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].holder_type, HolderType::Reserve);
}

#[tokio::test]
async fn test_version_conflicts_are_retried() {
    let fx = scenario_a().await;
    fx.repo.fail_next_appends(2);

    let outcome = fx
        .ledger
        .apply_adjustments(&fx.ctx(), "v1", Uuid::new_v4(), &[HolderDelta::new("bob", to_pct(1.0))])
        .await
        .unwrap();

    assert_eq!(outcome.attempts, 3);
    assert_eq!(fx.pct("v1", "bob").await, to_pct(1.0));
    assert_eq!(fx.repo.transaction_count("v1"), 2);
}

#[tokio::test]
async fn test_conflicts_past_retry_budget_fail() {
    let fx = scenario_a().await;
    fx.repo.fail_next_appends(10);

    let err = fx
        .ledger
        .apply_adjustments(&fx.ctx(), "v1", Uuid::new_v4(), &[HolderDelta::new("bob", to_pct(1.0))])
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::ConcurrencyConflict { attempts: 4, .. }));
    assert_eq!(fx.repo.transaction_count("v1"), 0);
    assert_eq!(fx.pct("v1", "bob").await, 0);
}

#[tokio::test]
async fn test_unbalanced_table_flags_venture() {
    let fx = scenario_a().await;
    fx.repo.force_set_pct("v1", "owner", to_pct(36.0));

    let err = fx
        .ledger
        .apply_adjustments(&fx.ctx(), "v1", Uuid::new_v4(), &[HolderDelta::new("bob", to_pct(1.0))])
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvariantViolation { .. }));
    assert!(err.requires_manual_review());
    assert_eq!(fx.repo.transaction_count("v1"), 0);

    let flagged = fx.repo.venture("v1").await.unwrap().unwrap();
    assert!(flagged.flagged_for_review);
    assert_eq!(fx.events.count("venture_flagged"), 1);

    // every later mutation is refused
    let err = fx
        .ledger
        .manual_adjustment(&fx.ctx(), "v1", "bob", to_pct(1.0), "fix")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::VentureFlagged { .. }));

    // and the flag stays while the live table disagrees with the log
    assert!(fx.ledger.clear_review_flag(&fx.ctx(), "v1").await.is_err());
    fx.repo.force_set_pct("v1", "owner", to_pct(35.0));
    fx.ledger.clear_review_flag(&fx.ctx(), "v1").await.unwrap();
    assert!(!fx.repo.venture("v1").await.unwrap().unwrap().flagged_for_review);
}

#[tokio::test]
async fn test_manual_adjustment() {
    let fx = scenario_a().await;
    let outcome = fx
        .ledger
        .manual_adjustment(&fx.ctx(), "v1", "alice", to_pct(2.0), "board resolution 7")
        .await
        .unwrap();
    assert_eq!(outcome.transactions[0].cause_ref, "manual:board resolution 7");
    assert_eq!(fx.pct("v1", "alice").await, to_pct(7.0));

    let err = fx
        .ledger
        .manual_adjustment(&fx.ctx(), "v1", "alice", to_pct(5.0), "too much")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::BoundViolation {
            reason: BoundReason::HolderCap { .. },
            ..
        }
    ));

    assert!(fx
        .ledger
        .manual_adjustment(&fx.ctx(), "v1", "alice", to_pct(1.0), "  ")
        .await
        .is_err());
}

#[tokio::test]
async fn test_create_venture_validation() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let alloc = |holder: &str, holder_type, pct: f64| GenesisAllocation {
        holder_id: holder.to_string(),
        holder_type,
        pct: to_pct(pct),
    };

    // sum off
    let err = fx
        .ledger
        .create_venture(
            &ctx,
            venture("v1", 20.0, 10.0, 40.0),
            &[alloc("owner", HolderType::Owner, 50.0), alloc("reserve", HolderType::Reserve, 40.0)],
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");

    // owner below floor
    assert!(fx
        .ledger
        .create_venture(
            &ctx,
            venture("v1", 20.0, 10.0, 90.0),
            &[alloc("owner", HolderType::Owner, 10.0), alloc("reserve", HolderType::Reserve, 90.0)],
        )
        .await
        .is_err());

    // reserve must match reserve_pct
    assert!(fx
        .ledger
        .create_venture(
            &ctx,
            venture("v1", 20.0, 10.0, 30.0),
            &[alloc("owner", HolderType::Owner, 60.0), alloc("reserve", HolderType::Reserve, 40.0)],
        )
        .await
        .is_err());

    let ok = [alloc("owner", HolderType::Owner, 60.0), alloc("reserve", HolderType::Reserve, 40.0)];
    fx.ledger
        .create_venture(&ctx, venture("v1", 20.0, 10.0, 40.0), &ok)
        .await
        .unwrap();
    let err = fx
        .ledger
        .create_venture(&ctx, venture("v1", 20.0, 10.0, 40.0), &ok)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");

    assert!(matches!(
        fx.ledger.get_cap_table("nope").await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_random_batches_preserve_invariants() {
    let fx = Fixture::new();
    fx.seed(
        venture("v1", 20.0, 10.0, 40.0),
        &[("owner", 30.0), ("h0", 5.0), ("h1", 5.0), ("h2", 10.0), ("h3", 10.0), ("reserve", 40.0)],
    )
    .await;
    let v = fx.repo.venture("v1").await.unwrap().unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let holders = ["owner", "h0", "h1", "h2", "h3", "h4", "h5"];
    for _ in 0..200 {
        let n = rng.gen_range(1..=holders.len());
        let mut batch = Vec::new();
        for holder in holders.iter().take(n) {
            let delta = to_pct(rng.gen_range(-3.0..3.0));
            batch.push(HolderDelta::new(*holder, delta));
        }
        let is_conversion = rng.gen_bool(0.2);
        if is_conversion {
            batch.iter_mut().for_each(|d| d.delta = d.delta.abs());
            fx.ledger
                .apply_conversions(&fx.ctx(), "v1", Uuid::new_v4(), &batch)
                .await
                .unwrap();
        } else {
            fx.ledger
                .apply_adjustments(&fx.ctx(), "v1", Uuid::new_v4(), &batch)
                .await
                .unwrap();
        }

        let state = fx.repo.read_state("v1").await.unwrap().state;
        assert_eq!(state.total(), HUNDRED_PCT);
        for entry in state.entries.values() {
            assert!(entry.pct >= 0, "{} went negative", entry.holder_id);
            match entry.holder_type {
                HolderType::Owner => assert!(entry.pct >= v.owner_min_pct),
                HolderType::Reserve => {}
                _ => assert!(entry.pct <= v.alice_cap_pct),
            }
        }
    }

    let report = fx.ledger.auditor().check("v1").await.unwrap();
    assert!(report.is_consistent());
}
