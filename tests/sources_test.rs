//! Lamp bank integration tests
//!
//! Runs the sources actor against the simulated PDU with short timings.

use dcb_actor::actors::SourcesHandle;
use dcb_actor::adapters::PduSimulator;
use dcb_actor::config::SourcesConfig;
use dcb_actor::error::DcbError;
use dcb_actor::fsm::{Activity, Substate};
use dcb_actor::sink::{drain, ChannelSink, CommandSink};
use dcb_actor::status::LampPower;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn fast_config() -> SourcesConfig {
    SourcesConfig {
        command_timeout_ms: 500,
        switch_on_timeout_ms: 300,
        switch_off_timeout_ms: 300,
        poll_interval_ms: 10,
        ..SourcesConfig::default()
    }
}

async fn connected() -> (SourcesHandle, PduSimulator) {
    let config = fast_config();
    let pdu = PduSimulator::from_config(&config)
        .with_latency(Duration::from_millis(1))
        .with_settle_time(Duration::from_millis(20));
    let sources = SourcesHandle::spawn(config, Box::new(pdu.clone()));
    sources.connect(sink()).await.unwrap();
    (sources, pdu)
}

fn sink() -> Arc<dyn CommandSink> {
    let (sink, _rx) = ChannelSink::new();
    Arc::new(sink)
}

fn lamps(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn power(sources: &SourcesHandle, lamp: &str) -> LampPower {
    sources
        .snapshot()
        .lamps
        .into_iter()
        .find(|l| l.name == lamp)
        .map(|l| l.power)
        .unwrap_or(LampPower::Unknown)
}

fn switch_commands(pdu: &PduSimulator) -> Vec<String> {
    pdu.call_log()
        .into_iter()
        .filter(|c| c.starts_with("sw "))
        .collect()
}

#[tokio::test]
async fn test_connect_reads_every_outlet() {
    let (sources, pdu) = connected().await;

    let reads = pdu
        .call_log()
        .iter()
        .filter(|c| c.starts_with("read status"))
        .count();
    assert_eq!(reads, 5);
    assert_eq!(power(&sources, "neon"), LampPower::Off);

    sources.stop().await;
}

#[tokio::test]
async fn test_switch_on_waits_for_warmup() {
    let (sources, pdu) = connected().await;

    let start = Instant::now();
    sources
        .switch_on(lamps(&["neon"]), Some(0.3), false, sink())
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_millis(300));

    assert!(pdu.is_on("04"));
    assert_eq!(power(&sources, "neon"), LampPower::On);
    assert_eq!(sources.state().substate, Substate::Idle);

    sources.stop().await;
}

#[tokio::test]
async fn test_warm_lamp_is_not_switched_again() {
    let (sources, pdu) = connected().await;

    sources
        .switch_on(lamps(&["neon"]), None, true, sink())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;

    // Already on for longer than the requested warm-up.
    let start = Instant::now();
    sources
        .switch_on(lamps(&["neon"]), Some(0.2), false, sink())
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(150));
    assert_eq!(switch_commands(&pdu), vec!["sw o04 on imme"]);

    sources.stop().await;
}

#[tokio::test]
async fn test_stuck_outlet_rolls_back_batch() {
    let (sources, pdu) = connected().await;
    pdu.stick_outlet("03");

    let result = sources
        .switch_on(lamps(&["argon", "hgar", "neon"]), None, true, sink())
        .await;
    match result {
        Err(DcbError::LampSwitch {
            lamp, rolled_back, ..
        }) => {
            assert_eq!(lamp, "hgar");
            assert!(rolled_back);
        }
        other => panic!("expected LampSwitch, got {other:?}"),
    }

    assert!(!pdu.is_on("02"));
    assert!(!pdu.is_on("03"));
    assert!(!pdu.is_on("04"));
    // neon was never attempted.
    assert!(!switch_commands(&pdu).iter().any(|c| c.starts_with("sw o04")));
    assert_eq!(power(&sources, "argon"), LampPower::Off);

    let state = sources.state();
    assert_eq!(state.substate.as_str(), "FAILED");
    assert!(state.hard_fault().is_none());

    // Soft failure: the next batch is accepted.
    pdu.release_outlet("03");
    sources
        .switch_on(lamps(&["hgar"]), None, true, sink())
        .await
        .unwrap();
    assert!(pdu.is_on("03"));

    sources.stop().await;
}

#[tokio::test]
async fn test_abort_ends_warmup_early() {
    let (sources, pdu) = connected().await;

    // Halogen warms up for a minute by default.
    let warming = {
        let sources = sources.clone();
        tokio::spawn(async move { sources.switch_on(lamps(&["halogen"]), None, false, sink()).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sources.state().substate, Substate::Busy(Activity::Warming));

    sources.abort();
    let result = tokio::time::timeout(Duration::from_secs(1), warming)
        .await
        .expect("abort did not end the warm-up")
        .unwrap();
    assert!(matches!(result, Err(DcbError::UserAborted(_))));

    // The lamp stays on and the device is usable.
    assert!(pdu.is_on("01"));
    assert_eq!(sources.state().substate, Substate::Idle);

    sources.stop().await;
}

#[tokio::test]
async fn test_stale_abort_does_not_cancel_next_warmup() {
    let (sources, _pdu) = connected().await;
    sources.abort();

    let start = Instant::now();
    sources
        .switch_on(lamps(&["krypton"]), Some(0.2), false, sink())
        .await
        .unwrap();
    assert!(start.elapsed() >= Duration::from_millis(200));

    sources.stop().await;
}

#[tokio::test]
async fn test_switch_off() {
    let (sources, pdu) = connected().await;
    sources
        .switch_on(lamps(&["argon", "neon"]), None, true, sink())
        .await
        .unwrap();

    sources
        .switch_off(lamps(&["argon"]), sink())
        .await
        .unwrap();
    assert!(!pdu.is_on("02"));
    assert!(pdu.is_on("04"));
    assert_eq!(power(&sources, "argon"), LampPower::Off);

    let empty = sources.switch_off(Vec::new(), sink()).await;
    assert!(matches!(empty, Err(DcbError::Precondition(_))));

    sources.stop().await;
}

#[tokio::test]
async fn test_unknown_lamp_is_rejected_before_io() {
    let (sources, pdu) = connected().await;
    pdu.clear_log();

    let result = sources
        .switch_on(lamps(&["neon", "xenon"]), None, true, sink())
        .await;
    assert!(matches!(result, Err(DcbError::Precondition(_))));
    assert!(pdu.call_log().is_empty());
    assert_eq!(sources.state().substate, Substate::Idle);

    sources.stop().await;
}

#[tokio::test]
async fn test_prepared_sequence_switches_off_in_order() {
    let (sources, pdu) = connected().await;

    sources
        .prepare(
            vec![("argon".to_string(), 0.4), ("neon".to_string(), 0.2)],
            sink(),
        )
        .await
        .unwrap();

    let start = Instant::now();
    sources.go(sink()).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(400));

    let offs: Vec<String> = switch_commands(&pdu)
        .into_iter()
        .filter(|c| c.ends_with("off imme"))
        .collect();
    assert_eq!(offs, vec!["sw o04 off imme", "sw o02 off imme"]);
    assert!(!pdu.is_on("02"));
    assert!(!pdu.is_on("04"));

    // The sequence is consumed.
    let again = sources.go(sink()).await;
    assert!(matches!(again, Err(DcbError::Precondition(_))));

    sources.stop().await;
}

#[tokio::test]
async fn test_aborted_sequence_switches_remaining_lamps_off() {
    let (sources, pdu) = connected().await;
    sources
        .prepare(vec![("hgar".to_string(), 30.0)], sink())
        .await
        .unwrap();

    let running = {
        let sources = sources.clone();
        tokio::spawn(async move { sources.go(sink()).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(pdu.is_on("03"));

    sources.abort();
    let result = tokio::time::timeout(Duration::from_secs(2), running)
        .await
        .expect("abort did not end the sequence")
        .unwrap();
    assert!(matches!(result, Err(DcbError::UserAborted(_))));
    assert!(!pdu.is_on("03"));

    sources.stop().await;
}

#[tokio::test]
async fn test_shutdown_switches_everything_off() {
    let (sources, pdu) = connected().await;
    sources
        .switch_on(lamps(&["halogen", "krypton"]), None, true, sink())
        .await
        .unwrap();

    let (reply_sink, mut rx) = ChannelSink::new();
    sources.shutdown(Arc::new(reply_sink)).await.unwrap();

    for outlet in ["01", "02", "03", "04", "05"] {
        assert!(!pdu.is_on(outlet), "outlet {outlet} still on");
    }
    let replies: Vec<String> = drain(&mut rx).into_iter().map(|l| l.text).collect();
    assert!(replies.iter().any(|t| t == "halogen=off,0"));

    sources.stop().await;
}

#[tokio::test]
async fn test_status_reports_lamp_keywords() {
    let (sources, _pdu) = connected().await;
    sources
        .switch_on(lamps(&["neon"]), None, true, sink())
        .await
        .unwrap();

    let (reply_sink, mut rx) = ChannelSink::new();
    let snapshot = sources
        .status(Vec::new(), Arc::new(reply_sink))
        .await
        .unwrap();
    assert_eq!(snapshot.lamps.len(), 5);

    let replies: Vec<String> = drain(&mut rx).into_iter().map(|l| l.text).collect();
    assert!(replies.iter().any(|t| t == "sourcesFSM=ONLINE,IDLE"));
    assert!(replies.iter().any(|t| t == "sourcesMode=simulation"));
    assert!(replies.iter().any(|t| t == "neon=on,0"));
    assert!(replies.iter().any(|t| t == "argon=off,0"));

    sources.stop().await;
}
