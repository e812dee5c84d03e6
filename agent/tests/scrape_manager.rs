mod support;

use std::collections::HashSet;
use std::sync::Arc;

use agent::scrape::{LoopState, TargetHealth};

use crate::support::{sets, sleep_secs, url, FakeFactory, FakeScraper, Harness};

const NODE: &str = r#"
scrape_configs:
  - job_name: node
    scrape_interval: 1s
    scrape_timeout: 500ms
"#;

fn identities(h: &Harness, job: &str) -> HashSet<String> {
    h.manager
        .scrape_pool(job)
        .map(|p| p.loops().iter().map(|l| l.target().identity().to_string()).collect())
        .unwrap_or_default()
}

fn want(addrs: &[&str]) -> HashSet<String> {
    addrs.iter().map(|a| url(a)).collect()
}

#[tokio::test(start_paused = true)]
async fn loops_follow_target_sets() {
    let h = Harness::start(NODE);
    h.send(sets(&[("node", &["a:1", "b:1"])])).await;
    sleep_secs(7).await;
    assert_eq!(identities(&h, "node"), want(&["a:1", "b:1"]));

    let pool = h.manager.scrape_pool("node").unwrap();
    let a = pool.scrape_loop(&url("a:1")).unwrap();
    let b = pool.scrape_loop(&url("b:1")).unwrap();
    assert_eq!(a.state(), LoopState::Running);

    h.send(sets(&[("node", &["b:1", "c:1"])])).await;
    sleep_secs(5).await;
    assert_eq!(identities(&h, "node"), want(&["b:1", "c:1"]));
    assert_eq!(a.state(), LoopState::Stopped);
    let b_after = pool.scrape_loop(&url("b:1")).unwrap();
    assert!(Arc::ptr_eq(&b, &b_after));
    assert_eq!(b.created_at(), b_after.created_at());

    let calls = h.scraper.calls("a:1");
    sleep_secs(3).await;
    assert_eq!(h.scraper.calls("a:1"), calls);
    assert!(h.scraper.calls("c:1") > 0);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn same_target_set_is_a_no_op() {
    let h = Harness::start(NODE);
    h.send(sets(&[("node", &["a:1"])])).await;
    sleep_secs(6).await;
    let before = h.manager.scrape_pool("node").unwrap().loops();

    h.send(sets(&[("node", &["a:1"])])).await;
    sleep_secs(5).await;
    let after = h.manager.scrape_pool("node").unwrap().loops();
    assert_eq!(before.len(), 1);
    assert_eq!(after.len(), 1);
    assert!(Arc::ptr_eq(&before[0], &after[0]));
    assert_eq!(h.factory.builds(), 1);
    assert_eq!(h.manager.metrics().reloads.get(), 2.0);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failing_target_does_not_affect_others() {
    let h = Harness::start(NODE);
    h.scraper.fail("a:1");
    h.send(sets(&[("node", &["a:1", "b:1"])])).await;
    sleep_secs(12).await;

    let pool = h.manager.scrape_pool("node").unwrap();
    let a = pool.scrape_loop(&url("a:1")).unwrap();
    let b = pool.scrape_loop(&url("b:1")).unwrap();
    assert_eq!(a.target().health(), TargetHealth::Down);
    assert!(a
        .target()
        .status()
        .last_error
        .unwrap()
        .contains("connection refused"));
    assert_eq!(b.target().health(), TargetHealth::Up);
    assert_eq!(a.state(), LoopState::Running);

    let metrics = h.manager.metrics();
    assert!(metrics.scrapes("node", "a:1", "failure") >= 5);
    assert_eq!(metrics.scrapes("node", "a:1", "success"), 0);
    assert!(metrics.scrapes("node", "b:1", "success") >= 5);

    assert_eq!(h.recorder.count_for("a:1"), 0);
    assert!(h.recorder.count_for("b:1") >= 5);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn target_limit_fails_every_loop_until_respected() {
    let h = Harness::start(
        r#"
scrape_configs:
  - job_name: node
    scrape_interval: 1s
    scrape_timeout: 500ms
    target_limit: 2
"#,
    );
    h.send(sets(&[("node", &["a:1", "b:1", "c:1"])])).await;
    sleep_secs(8).await;

    let pool = h.manager.scrape_pool("node").unwrap();
    assert_eq!(pool.loops().len(), 3);
    for l in pool.loops() {
        let err = l.forced_error().unwrap();
        assert!(err.starts_with("target_limit exceeded"), "{err}");
        assert_eq!(l.target().health(), TargetHealth::Down);
    }
    assert_eq!(h.scraper.total_calls(), 0);

    h.send(sets(&[("node", &["a:1", "b:1"])])).await;
    sleep_secs(5).await;
    assert_eq!(pool.loops().len(), 2);
    assert!(pool.loops().iter().all(|l| l.forced_error().is_none()));
    sleep_secs(2).await;
    assert!(h.scraper.calls("a:1") > 0);
    assert!(h.scraper.calls("b:1") > 0);
    assert_eq!(h.scraper.calls("c:1"), 0);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reload_requests_between_ticks_coalesce() {
    let h = Harness::start(NODE);
    h.send(sets(&[("node", &["a:1"])])).await;
    h.send(sets(&[("node", &["a:1", "b:1"])])).await;
    h.send(sets(&[("node", &["b:1"])])).await;
    h.send(sets(&[("node", &["b:1", "c:1"])])).await;

    sleep_secs(6).await;
    assert_eq!(h.manager.metrics().reloads.get(), 1.0);
    assert_eq!(identities(&h, "node"), want(&["b:1", "c:1"]));

    sleep_secs(10).await;
    assert_eq!(h.manager.metrics().reloads.get(), 1.0);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unknown_job_is_skipped() {
    let h = Harness::start(NODE);
    h.send(sets(&[("node", &["a:1"]), ("ghost", &["x:1"])])).await;
    sleep_secs(6).await;

    assert!(h.manager.scrape_pool("ghost").is_none());
    assert_eq!(identities(&h, "node"), want(&["a:1"]));
    assert_eq!(h.manager.metrics().reload_errors.get(), 1.0);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn pool_that_fails_to_build_is_retried() {
    let scraper = Arc::new(FakeScraper::default());
    let factory = Arc::new(FakeFactory::new(scraper.clone()));
    factory.fail_job("node", true);
    let h = Harness::start_with(NODE, scraper, factory);
    h.send(sets(&[("node", &["a:1"])])).await;

    sleep_secs(6).await;
    assert!(h.manager.scrape_pool("node").is_none());
    assert_eq!(h.manager.metrics().pools_failed.get(), 1.0);

    h.factory.fail_job("node", false);
    sleep_secs(5).await;
    assert_eq!(identities(&h, "node"), want(&["a:1"]));
    assert_eq!(h.manager.metrics().pools_total.get(), 1.0);
    assert_eq!(h.factory.builds(), 2);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn removed_job_is_torn_down() {
    let h = Harness::start(
        r#"
scrape_configs:
  - job_name: node
    scrape_interval: 1s
    scrape_timeout: 500ms
  - job_name: db
    scrape_interval: 1s
    scrape_timeout: 500ms
"#,
    );
    h.send(sets(&[("node", &["a:1"]), ("db", &["d:1"])])).await;
    sleep_secs(6).await;
    let db = h.manager.scrape_pool("db").unwrap();
    let d = db.scrape_loop(&url("d:1")).unwrap();

    h.manager
        .apply_config(&agent::config::Config::load(NODE).unwrap());
    sleep_secs(5).await;
    assert!(h.manager.scrape_pool("db").is_none());
    assert_eq!(d.state(), LoopState::Stopped);
    assert_eq!(identities(&h, "node"), want(&["a:1"]));
    assert!(h.manager.targets_active().get("db").is_none());

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn changed_job_config_restarts_loops() {
    let h = Harness::start(NODE);
    h.send(sets(&[("node", &["a:1"])])).await;
    sleep_secs(6).await;
    let pool = h.manager.scrape_pool("node").unwrap();
    let old = pool.scrape_loop(&url("a:1")).unwrap();

    h.manager.apply_config(
        &agent::config::Config::load(
            r#"
scrape_configs:
  - job_name: node
    scrape_interval: 2s
    scrape_timeout: 1s
"#,
        )
        .unwrap(),
    );
    sleep_secs(5).await;

    let same_pool = h.manager.scrape_pool("node").unwrap();
    assert!(Arc::ptr_eq(&pool, &same_pool));
    let new = pool.scrape_loop(&url("a:1")).unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(old.state(), LoopState::Stopped);
    assert_eq!(new.interval(), std::time::Duration::from_secs(2));
    assert_eq!(h.factory.builds(), 2);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent_and_waits_for_loops() {
    let h = Harness::start(NODE);
    h.send(sets(&[("node", &["a:1", "b:1"])])).await;
    sleep_secs(7).await;
    let loops = h.manager.scrape_pool("node").unwrap().loops();

    let m = h.manager.clone();
    tokio::join!(m.stop(), m.stop(), m.stop());
    assert!(loops.iter().all(|l| l.state() == LoopState::Stopped));
    assert!(h.manager.scrape_pool("node").is_none());

    let calls = h.scraper.total_calls();
    sleep_secs(5).await;
    assert_eq!(h.scraper.total_calls(), calls);

    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn process_shutdown_ends_run_and_loops() {
    let h = Harness::start(NODE);
    h.send(sets(&[("node", &["a:1"])])).await;
    sleep_secs(7).await;
    let a = h
        .manager
        .scrape_pool("node")
        .unwrap()
        .scrape_loop(&url("a:1"))
        .unwrap();

    h.shutdown.cancel();
    let Harness { manager, runner, .. } = h;
    runner.await.unwrap().unwrap();
    sleep_secs(1).await;
    assert_eq!(a.state(), LoopState::Stopped);
    manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn second_run_is_rejected() {
    let h = Harness::start(NODE);
    sleep_secs(1).await;
    let (_tx, rx) = tokio::sync::mpsc::channel(1);
    let res = h.manager.clone().run(rx).await;
    assert!(matches!(res, Err(common::error::Error::AlreadyRunning)));
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_targets_are_dropped() {
    let h = Harness::start(NODE);
    h.send(sets(&[("node", &["a:1", "ftp://b:1", "a:1"])])).await;
    sleep_secs(6).await;

    assert_eq!(identities(&h, "node"), want(&["a:1"]));
    let dropped = h.manager.targets_dropped();
    assert_eq!(dropped["node"].len(), 1);
    assert_eq!(dropped["node"][0].address, "ftp://b:1");

    h.shutdown().await;
}
