//! Contract tests run against both repository backends.

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use super::*;
use crate::models::{
    AdjustmentOutcome, ContributionStatus, ConversionOutcome, HolderType, PeriodStatus,
    TransactionKind, WindowStatus,
};
use crate::scoring::rules::{CompareOp, Metric};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

fn venture(id: &str) -> Venture {
    Venture {
        id: id.to_string(),
        owner_id: "owner".to_string(),
        owner_min_pct: 200_000,
        alice_cap_pct: 100_000,
        reserve_pct: 400_000,
        flagged_for_review: false,
        flag_reason: None,
        created_at: t0(),
    }
}

fn genesis(venture_id: &str) -> Vec<CapTableEntry> {
    [
        ("owner", HolderType::Owner, 600_000),
        ("reserve", HolderType::Reserve, 400_000),
    ]
    .into_iter()
    .map(|(holder, holder_type, pct)| CapTableEntry {
        venture_id: venture_id.to_string(),
        holder_id: holder.to_string(),
        holder_type,
        pct,
        source: "GENESIS".to_string(),
        updated_at: t0(),
    })
    .collect()
}

fn txn(venture_id: &str, seq: u64, holder: &str, holder_type: HolderType, before: i64, after: i64, cause: &str) -> LedgerTransaction {
    LedgerTransaction {
        id: Uuid::new_v4(),
        venture_id: venture_id.to_string(),
        seq,
        holder_id: holder.to_string(),
        holder_type,
        kind: TransactionKind::Manual,
        before_pct: before,
        after_pct: after,
        timestamp: t0() + Duration::hours(seq as i64),
        cause_ref: cause.to_string(),
    }
}

async fn exercise_ventures_and_append(repo: &dyn LedgerRepository) {
    repo.create_venture(&venture("v1"), &genesis("v1")).await.unwrap();
    assert!(matches!(
        repo.create_venture(&venture("v1"), &genesis("v1")).await,
        Err(RepositoryError::AlreadyExists { .. })
    ));

    let snapshot = repo.read_state("v1").await.unwrap();
    assert_eq!(snapshot.version, 0);
    assert_eq!(snapshot.last_seq, 0);
    assert_eq!(snapshot.state.total(), 1_000_000);

    let batch = vec![
        txn("v1", 1, "alice", HolderType::User, 0, 10_000, "c1"),
        txn("v1", 2, "reserve", HolderType::Reserve, 400_000, 390_000, "c1"),
    ];
    assert_eq!(repo.append("v1", 0, &batch).await.unwrap(), 1);

    // stale version is rejected and nothing changes
    let stale = vec![txn("v1", 3, "alice", HolderType::User, 10_000, 20_000, "c2")];
    assert!(matches!(
        repo.append("v1", 0, &stale).await,
        Err(RepositoryError::VersionConflict { expected: 0, actual: 1, .. })
    ));

    // seq gap is rejected
    let gap = vec![txn("v1", 5, "alice", HolderType::User, 10_000, 20_000, "c2")];
    assert!(matches!(
        repo.append("v1", 1, &gap).await,
        Err(RepositoryError::Corrupt(_))
    ));

    let snapshot = repo.read_state("v1").await.unwrap();
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.last_seq, 2);
    assert_eq!(snapshot.state.pct_of("alice"), 10_000);
    assert_eq!(snapshot.state.entries["alice"].holder_type, HolderType::User);
    assert_eq!(snapshot.state.entries["alice"].source, "MANUAL");
    assert_eq!(snapshot.state.pct_of("reserve"), 390_000);

    // genesis is untouched by appends
    let g = repo.genesis("v1").await.unwrap();
    assert_eq!(g.len(), 2);
    assert!(g.iter().all(|e| e.holder_id != "alice"));

    let all = repo.transactions("v1", None).await.unwrap();
    assert_eq!(all.iter().map(|t| t.seq).collect::<Vec<_>>(), vec![1, 2]);
    let upto = repo
        .transactions("v1", Some(t0() + Duration::hours(1)))
        .await
        .unwrap();
    assert_eq!(upto.len(), 1);

    assert!(repo.has_transactions_for("v1", "c1").await.unwrap());
    assert!(!repo.has_transactions_for("v1", "c2").await.unwrap());
    assert_eq!(repo.transactions_for("v1", "c1").await.unwrap().len(), 2);

    repo.set_review_flag("v1", Some("test")).await.unwrap();
    let flagged = repo.venture("v1").await.unwrap().unwrap();
    assert!(flagged.flagged_for_review);
    assert_eq!(flagged.flag_reason.as_deref(), Some("test"));
    repo.set_review_flag("v1", None).await.unwrap();
    assert!(!repo.venture("v1").await.unwrap().unwrap().flagged_for_review);

    assert!(matches!(
        repo.read_state("missing").await,
        Err(RepositoryError::NotFound { .. })
    ));
}

async fn exercise_contributions(repo: &dyn LedgerRepository) {
    let mk = |id: &str, status: ContributionStatus, hours: i64| Contribution {
        id: id.to_string(),
        contributor_id: "alice".to_string(),
        venture_id: "v1".to_string(),
        effort: 1.0,
        impact: 2.0,
        quality: 3.0,
        status,
        accepted_at: Some(t0() + Duration::hours(hours)),
    };
    repo.insert_contribution(&mk("a", ContributionStatus::Approved, 1)).await.unwrap();
    repo.insert_contribution(&mk("b", ContributionStatus::Pending, 1)).await.unwrap();
    repo.insert_contribution(&mk("c", ContributionStatus::Approved, 24)).await.unwrap();
    assert!(repo
        .insert_contribution(&mk("a", ContributionStatus::Approved, 1))
        .await
        .is_err());

    let rows = repo
        .approved_contributions("v1", t0(), t0() + Duration::hours(24))
        .await
        .unwrap();
    assert_eq!(rows.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(), vec!["a"]);
    assert_eq!(rows[0].weight(), 6.0);
}

async fn exercise_periods(repo: &dyn LedgerRepository) {
    let start = t0();
    let end = t0() + Duration::days(90);
    let mut p1 = RebalancingPeriod::scheduled("v1", start, end);
    p1.status = PeriodStatus::Running;
    p1.started_at = Some(start);
    assert_eq!(repo.try_begin_period(&p1).await.unwrap(), None);
    // a second runner of the same period is refused too
    assert_eq!(repo.try_begin_period(&p1).await.unwrap(), Some(p1.id));

    let mut p2 = RebalancingPeriod::scheduled("v1", end, end + Duration::days(90));
    p2.status = PeriodStatus::Running;
    assert_eq!(repo.try_begin_period(&p2).await.unwrap(), Some(p1.id));
    assert!(repo.period(p2.id).await.unwrap().is_none());

    assert_eq!(repo.running_periods(Some("v1")).await.unwrap().len(), 1);
    assert!(repo.running_periods(Some("v2")).await.unwrap().is_empty());

    p1.status = PeriodStatus::Failed;
    p1.failure_reason = Some("timeout".to_string());
    p1.finished_at = Some(start + Duration::seconds(30));
    repo.save_period(&p1).await.unwrap();
    let loaded = repo.period(p1.id).await.unwrap().unwrap();
    assert_eq!(loaded, p1);
    assert!(repo.running_periods(None).await.unwrap().is_empty());

    repo.record_adjustments(&[
        Adjustment {
            period_id: p1.id,
            holder_id: "alice".to_string(),
            delta: -10_000,
            applied_at: start,
            outcome: AdjustmentOutcome::Applied,
        },
        Adjustment {
            period_id: p1.id,
            holder_id: "bob".to_string(),
            delta: 10_000,
            applied_at: start,
            outcome: AdjustmentOutcome::SkippedTimeout,
        },
    ])
    .await
    .unwrap();
    let adjustments = repo.adjustments(p1.id).await.unwrap();
    assert_eq!(adjustments.len(), 2);
    assert_eq!(adjustments[1].outcome, AdjustmentOutcome::SkippedTimeout);
}

async fn exercise_windows(repo: &dyn LedgerRepository) {
    let w = ConversionWindow::new("v1", t0(), t0() + Duration::days(7), 100).with_eligibility(
        crate::scoring::rules::Rule::Threshold {
            metric: Metric::TokenBalance,
            op: CompareOp::Gte,
            value: 1000.0,
        },
    );
    repo.save_window(&w).await.unwrap();

    let mut opened = w.clone();
    opened.status = WindowStatus::Open;
    repo.save_window(&opened).await.unwrap();
    assert_eq!(repo.window(w.id).await.unwrap(), Some(opened));
    assert_eq!(repo.windows(Some("v1")).await.unwrap().len(), 1);
    assert!(repo.windows(Some("v2")).await.unwrap().is_empty());

    repo.record_conversions(&[ConversionRecord {
        window_id: w.id,
        venture_id: "v1".to_string(),
        holder_id: "alice".to_string(),
        token_balance: 10_000,
        equity_delta: 10_000,
        outcome: ConversionOutcome::Applied,
        recorded_at: t0(),
    }])
    .await
    .unwrap();
    assert_eq!(repo.conversion_records(w.id).await.unwrap().len(), 1);

    for (holder, balance) in [("zed", 5), ("alice", 10), ("alice", 20)] {
        repo.upsert_token_balance(&TokenBalance {
            venture_id: "v1".to_string(),
            holder_id: holder.to_string(),
            balance,
            as_of: t0(),
        })
        .await
        .unwrap();
    }
    let balances = repo.token_balances("v1").await.unwrap();
    assert_eq!(
        balances
            .iter()
            .map(|b| (b.holder_id.as_str(), b.balance))
            .collect::<Vec<_>>(),
        vec![("alice", 20), ("zed", 5)]
    );
}

async fn exercise_all(repo: &dyn LedgerRepository) {
    exercise_ventures_and_append(repo).await;
    exercise_contributions(repo).await;
    exercise_periods(repo).await;
    exercise_windows(repo).await;
}

#[tokio::test]
async fn test_memory_repository_contract() {
    exercise_all(&InMemoryLedgerRepository::new()).await;
}

#[tokio::test]
async fn test_sqlite_repository_contract() {
    exercise_all(&SqliteLedgerRepository::open_in_memory().unwrap()).await;
}

#[tokio::test]
async fn test_sqlite_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    {
        let repo = SqliteLedgerRepository::open(&path).unwrap();
        exercise_ventures_and_append(&repo).await;
    }
    let repo = SqliteLedgerRepository::open(&path).unwrap();
    let snapshot = repo.read_state("v1").await.unwrap();
    assert_eq!(snapshot.version, 1);
    assert_eq!(snapshot.state.pct_of("alice"), 10_000);
    assert_eq!(repo.transactions("v1", None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_memory_forced_conflicts() {
    let repo = InMemoryLedgerRepository::new();
    repo.create_venture(&venture("v1"), &genesis("v1")).await.unwrap();
    repo.fail_next_appends(1);
    let batch = vec![txn("v1", 1, "alice", HolderType::User, 0, 10_000, "c1")];
    assert!(repo.append("v1", 0, &batch).await.is_err());
    assert_eq!(repo.append("v1", 0, &batch).await.unwrap(), 1);
}
