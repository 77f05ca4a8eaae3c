//! Interface lifecycle: link notifications through the monitor into the
//! listener supervisor.

mod common;

use async_trait::async_trait;
use common::{link, BrokenLinks, ScriptedLinks};
use dhcpd_unnumbered::{
    DhcpdError, LinkEvent, LinkReadiness, ListenerFactory, ListenerHandle, ListenerSupervisor,
    NetlinkMonitor, OperState, Result,
};
use pretty_assertions::assert_eq;
use regex::Regex;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn vrf_pattern() -> Regex {
    Regex::new("^vrf-").unwrap()
}

#[derive(Default, Clone)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn record(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

struct RecordingHandle {
    interface: String,
    journal: Journal,
}

#[async_trait]
impl ListenerHandle for RecordingHandle {
    async fn close(self) {
        self.journal.record(format!("close {}", self.interface));
    }
}

/// Every interface named `vrf-plain*` is treated as not being a VRF.
struct RecordingFactory {
    journal: Journal,
}

impl ListenerFactory for RecordingFactory {
    type Handle = RecordingHandle;

    fn create(&mut self, interface: &str) -> Result<RecordingHandle> {
        if interface.starts_with("vrf-plain") {
            return Err(DhcpdError::not_vrf(interface));
        }
        self.journal.record(format!("open {interface}"));
        Ok(RecordingHandle {
            interface: interface.to_string(),
            journal: self.journal.clone(),
        })
    }
}

async fn drain(rx: &mut tokio::sync::mpsc::Receiver<LinkEvent>, n: usize) -> Vec<LinkEvent> {
    let mut events = Vec::new();
    for _ in 0..n {
        let event = timeout(WAIT, rx.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_repeated_up_emits_single_event() {
    let up = link("vrf-blue", OperState::Up, true);
    let source = ScriptedLinks::new(vec![up.clone()], vec![vec![up.clone(), up.clone()], vec![up]]);
    let (monitor, mut rx) = NetlinkMonitor::new(vrf_pattern(), LinkReadiness::OperStateOnly);
    let close = monitor.close_handle();
    let task = tokio::spawn(monitor.listen(source));

    assert_eq!(drain(&mut rx, 1).await, vec![LinkEvent::Up("vrf-blue".into())]);

    close.cancel();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    // Nothing further was queued and the channel is closed.
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn test_snapshot_then_live_events() {
    let snapshot = vec![
        link("vrf-red", OperState::Up, true),
        link("vrf-green", OperState::Down, true),
        link("eth0", OperState::Up, true),
    ];
    let batches = vec![
        vec![link("vrf-green", OperState::Up, true)],
        vec![
            link("vrf-red", OperState::Down, false),
            link("vrf-unknown", OperState::NotPresent, false),
        ],
    ];
    let (monitor, mut rx) = NetlinkMonitor::new(vrf_pattern(), LinkReadiness::OperStateOnly);
    let close = monitor.close_handle();
    let task = tokio::spawn(monitor.listen(ScriptedLinks::new(snapshot, batches)));

    assert_eq!(
        drain(&mut rx, 3).await,
        vec![
            LinkEvent::Up("vrf-red".into()),
            LinkEvent::Up("vrf-green".into()),
            LinkEvent::Down("vrf-red".into()),
        ]
    );

    close.cancel();
    timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_source_error_ends_monitor_and_channel() {
    let (monitor, mut rx) = NetlinkMonitor::new(vrf_pattern(), LinkReadiness::OperStateOnly);
    let result = timeout(WAIT, monitor.listen(BrokenLinks)).await.unwrap();

    assert!(matches!(result, Err(DhcpdError::Netlink { .. })));
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn test_monitor_drives_supervisor() {
    let snapshot = vec![
        link("vrf-red", OperState::Up, true),
        link("vrf-plain", OperState::Up, true),
    ];
    let batches = vec![
        vec![link("vrf-plain", OperState::Down, true)],
        vec![link("vrf-blue", OperState::Up, true)],
        vec![link("vrf-red", OperState::NotPresent, false)],
    ];
    let journal = Journal::default();
    let (monitor, rx) = NetlinkMonitor::new(vrf_pattern(), LinkReadiness::OperStateOnly);
    let close = monitor.close_handle();
    let monitor_task = tokio::spawn(monitor.listen(ScriptedLinks::new(snapshot, batches)));
    let supervisor_task = tokio::spawn(
        ListenerSupervisor::new(RecordingFactory {
            journal: journal.clone(),
        })
        .run(rx),
    );

    // Wait for the last scripted transition to reach the supervisor.
    timeout(WAIT, async {
        while !journal.entries().contains(&"close vrf-red".to_string()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("vrf-red closed");

    close.cancel();
    timeout(WAIT, monitor_task).await.unwrap().unwrap().unwrap();
    timeout(WAIT, supervisor_task).await.unwrap().unwrap();

    assert_eq!(
        journal.entries(),
        vec![
            "open vrf-red",
            "open vrf-blue",
            "close vrf-red",
            // Still open at shutdown.
            "close vrf-blue",
        ]
    );
}
