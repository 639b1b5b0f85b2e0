use chrono::Duration as ChronoDuration;
use std::time::Duration;

use super::*;
use crate::config::EngineConfig;
use crate::ledger::to_pct;
use crate::models::{Contribution, ContributionStatus, ConversionWindow, PeriodStatus, WindowStatus};
use crate::test_support::{quarter, t0, test_config, venture, Fixture};

fn scheduler(fx: &Fixture, clock: Arc<FakeClock>, cfg: &EngineConfig) -> Scheduler {
    Scheduler::new(clock, fx.engine.clone(), fx.windows.clone(), fx.events.clone(), cfg)
}

/// Ventures with two contributors each, so every run applies two deltas.
async fn seed_ventures(fx: &Fixture, ids: &[&str]) {
    for id in ids {
        fx.seed(
            venture(id, 20.0, 10.0, 60.0),
            &[("owner", 35.0), ("alice", 5.0), ("reserve", 60.0)],
        )
        .await;
        fx.contribute(id, &format!("{}-a", id), "alice", 100.0, 1).await;
        fx.contribute(id, &format!("{}-b", id), "bob", 300.0, 2).await;
    }
}

#[tokio::test]
async fn test_batch_isolates_failing_venture() {
    let fx = Fixture::new();
    seed_ventures(&fx, &["v1", "v2", "v3"]).await;
    fx.repo
        .insert_contribution(&Contribution {
            id: "v2-bad".to_string(),
            contributor_id: "carol".to_string(),
            venture_id: "v2".to_string(),
            effort: -5.0,
            impact: 1.0,
            quality: 1.0,
            status: ContributionStatus::Approved,
            accepted_at: Some(t0() + ChronoDuration::days(4)),
        })
        .await
        .unwrap();

    let cfg = test_config();
    let sched = scheduler(&fx, Arc::new(FakeClock::new(t0())), &cfg);
    let (_tx, rx) = watch::channel(false);
    let (start, end) = quarter();

    let report = sched.run_rebalancing_batch(start, end, rx).await.unwrap();
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.completed(), 2);
    assert_eq!(report.failed(), 1);
    assert!(matches!(
        &report.outcomes["v2"],
        VentureOutcome::Failed { kind, .. } if kind == "validation"
    ));
    assert!(report.reconciliation_mismatches.is_empty());

    assert_eq!(fx.pct("v1", "bob").await, to_pct(1.0));
    assert_eq!(fx.pct("v3", "bob").await, to_pct(1.0));
    assert_eq!(fx.pct("v2", "bob").await, 0);
    assert_eq!(fx.events.count("rebalancing_failed"), 1);

    // second pass only redoes nothing for the completed ventures
    let (_tx, rx) = watch::channel(false);
    let again = sched.run_rebalancing_batch(start, end, rx).await.unwrap();
    assert_eq!(again.outcomes["v1"], VentureOutcome::AlreadyCompleted);
    assert_eq!(again.outcomes["v3"], VentureOutcome::AlreadyCompleted);
}

#[tokio::test]
async fn test_cancelled_batch_starts_nothing() {
    let fx = Fixture::new();
    seed_ventures(&fx, &["v1", "v2"]).await;
    let cfg = test_config();
    let sched = scheduler(&fx, Arc::new(FakeClock::new(t0())), &cfg);
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let (start, end) = quarter();

    let report = sched.run_rebalancing_batch(start, end, rx).await.unwrap();
    assert_eq!(report.cancelled(), 2);
    assert!(fx.repo.running_periods(None).await.unwrap().is_empty());
    assert_eq!(fx.repo.transaction_count("v1"), 0);
}

#[tokio::test]
async fn test_cancel_lets_running_venture_finish() {
    let fx = Fixture::new();
    seed_ventures(&fx, &["v1", "v2", "v3"]).await;
    fx.repo.set_contribution_delay(Some(Duration::from_millis(150)));

    let mut cfg = test_config();
    cfg.batch.workers = 1;
    let sched = scheduler(&fx, Arc::new(FakeClock::new(t0())), &cfg);
    let (tx, rx) = watch::channel(false);
    let (start, end) = quarter();

    let batch = {
        let sched = sched.clone();
        tokio::spawn(async move { sched.run_rebalancing_batch(start, end, rx).await })
    };
    tokio::time::sleep(Duration::from_millis(40)).await;
    tx.send(true).unwrap();

    let report = batch.await.unwrap().unwrap();
    assert!(matches!(report.outcomes["v1"], VentureOutcome::Completed { applied: 2, .. }));
    assert_eq!(report.outcomes["v2"], VentureOutcome::Cancelled);
    assert_eq!(report.outcomes["v3"], VentureOutcome::Cancelled);
    assert_eq!(fx.pct("v1", "bob").await, to_pct(1.0));
    assert_eq!(fx.repo.transaction_count("v2"), 0);
}

#[tokio::test]
async fn test_slow_venture_times_out() {
    let mut cfg = test_config();
    cfg.batch.venture_timeout_ms = 50;
    let fx = Fixture::with_config(cfg.clone());
    seed_ventures(&fx, &["v1"]).await;
    fx.repo.set_contribution_delay(Some(Duration::from_millis(400)));

    let sched = scheduler(&fx, Arc::new(FakeClock::new(t0())), &cfg);
    let (_tx, rx) = watch::channel(false);
    let (start, end) = quarter();

    let report = sched.run_rebalancing_batch(start, end, rx).await.unwrap();
    assert_eq!(report.outcomes["v1"], VentureOutcome::TimedOut { committed: false });

    let period = fx
        .repo
        .period(RebalancingPeriod::id_for("v1", start, end))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(period.status, PeriodStatus::Failed);
    assert_eq!(period.failure_reason.as_deref(), Some("timeout"));
    assert_eq!(fx.repo.transaction_count("v1"), 0);
    assert_eq!(fx.events.count("rebalancing_failed"), 1);
}

#[tokio::test]
async fn test_tick_follows_the_clock() {
    let fx = Fixture::new();
    fx.seed(venture("v1", 20.0, 10.0, 40.0), &[("owner", 60.0), ("reserve", 40.0)])
        .await;
    fx.balance("v1", "alice", 10_000).await;
    let opens = t0() + ChronoDuration::days(1);
    let window = fx
        .windows
        .schedule_window(
            &fx.ctx(),
            ConversionWindow::new("v1", opens, opens + ChronoDuration::days(7), 100),
        )
        .await
        .unwrap();

    let clock = Arc::new(FakeClock::new(t0()));
    let sched = scheduler(&fx, clock.clone(), &test_config());

    assert!(sched.tick_windows().await.unwrap().is_empty());

    clock.advance(ChronoDuration::days(1));
    assert_eq!(sched.tick_windows().await.unwrap().opened, vec![window.id]);
    assert_eq!(fx.pct("v1", "alice").await, to_pct(1.0));

    clock.advance(ChronoDuration::days(7));
    assert_eq!(sched.tick_windows().await.unwrap().closed, vec![window.id]);
    assert_eq!(fx.windows.window(window.id).await.unwrap().status, WindowStatus::Closed);
}

#[tokio::test]
async fn test_daemon_ticks_until_cancelled() {
    let fx = Fixture::new();
    fx.seed(venture("v1", 20.0, 10.0, 40.0), &[("owner", 60.0), ("reserve", 40.0)])
        .await;
    fx.balance("v1", "alice", 10_000).await;
    let window = fx
        .windows
        .schedule_window(
            &fx.ctx(),
            ConversionWindow::new("v1", t0(), t0() + ChronoDuration::days(7), 100),
        )
        .await
        .unwrap();

    // left over from a crashed process
    let mut stale = RebalancingPeriod::scheduled("v1", t0(), t0() + ChronoDuration::days(90));
    stale.status = PeriodStatus::Running;
    fx.repo.save_period(&stale).await.unwrap();

    let sched = scheduler(&fx, Arc::new(FakeClock::new(t0() + ChronoDuration::days(1))), &test_config());
    let (tx, rx) = watch::channel(false);
    let daemon = {
        let sched = sched.clone();
        tokio::spawn(async move { sched.run_daemon(Duration::from_millis(10), rx).await })
    };

    tokio::time::sleep(Duration::from_millis(60)).await;
    tx.send(true).unwrap();
    daemon.await.unwrap().unwrap();

    assert_eq!(fx.windows.window(window.id).await.unwrap().status, WindowStatus::Open);
    assert_eq!(
        fx.repo.period(stale.id).await.unwrap().unwrap().status,
        PeriodStatus::Failed
    );
}
