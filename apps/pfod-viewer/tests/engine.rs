use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pfod_transport::{ScriptedTransport, TransportError};
use pfod_viewer_core::engine::{Engine, EngineHandle};
use pfod_viewer_core::error::{SyncError, ViewerError};
use pfod_viewer_core::model::DrawingItem;
use pfod_viewer_core::protocol::{DiagnosticView, TouchCommand, TouchFilter};
use pfod_viewer_core::sync::SyncCore;
use pfod_viewer_core::view::{Alert, DisplayMode, ViewSink, VisibleModel};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Redraw {
        drawings: Vec<String>,
        texts: Vec<String>,
    },
    Diagnostic(DiagnosticView),
    Alert(ViewerError),
}

#[derive(Clone, Default)]
struct RecordingSink {
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl RecordingSink {
    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    fn redraws(&self) -> Vec<Vec<String>> {
        self.seen()
            .into_iter()
            .filter_map(|seen| match seen {
                Seen::Redraw { texts, .. } => Some(texts),
                _ => None,
            })
            .collect()
    }
}

impl ViewSink for RecordingSink {
    fn redraw(&mut self, model: &VisibleModel) {
        let texts = model
            .merged()
            .indexed
            .values()
            .filter_map(|item| item.props["text"].as_str().map(str::to_string))
            .collect();
        self.seen.lock().push(Seen::Redraw {
            drawings: model.drawings().list_drawings().to_vec(),
            texts,
        });
    }

    fn show_diagnostic(&mut self, view: &DiagnosticView) {
        self.seen.lock().push(Seen::Diagnostic(view.clone()));
    }

    fn alert(&mut self, alert: &Alert) {
        self.seen.lock().push(Seen::Alert(alert.error.clone()));
    }
}

struct Harness {
    transport: Arc<ScriptedTransport>,
    sink: RecordingSink,
    handle: EngineHandle,
    task: JoinHandle<SyncCore>,
}

impl Harness {
    fn start(transport: ScriptedTransport) -> Self {
        let transport = Arc::new(transport);
        let sink = RecordingSink::default();
        let (engine, handle) = Engine::new(
            SyncCore::new("pfodWeb"),
            transport.clone(),
            Box::new(sink.clone()),
        );
        let task = tokio::spawn(engine.run());
        Self {
            transport,
            sink,
            handle,
            task,
        }
    }

    async fn wait_for(&self, done: impl Fn(&[Seen]) -> bool) {
        while !done(&self.sink.seen()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn wait_for_sent(&self, count: usize) {
        while self.transport.sent().len() < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Lets the engine drain commands already sent to it.
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    async fn stop(self) -> (SyncCore, Vec<String>, RecordingSink) {
        self.handle.shutdown().unwrap();
        let core = self.task.await.unwrap();
        (core, self.transport.sent(), self.sink)
    }
}

fn snapshot(version: &str, refresh: u64, items: &str) -> String {
    format!(
        r#"{{"pfodDrawing":"start","version":"{version}","refresh":{refresh},"items":[{items}]}}"#
    )
}

fn update(items: &str) -> String {
    format!(r#"{{"pfodDrawing":"update","items":[{items}]}}"#)
}

fn label(idx: u32, text: &str) -> String {
    format!(r#"{{"type":"label","idx":{idx},"text":"{text}"}}"#)
}

fn drag(col: i32) -> TouchCommand {
    TouchCommand::new("pfodWeb", "k", col, 0, TouchFilter::Drag)
}

#[test_timeout::tokio_timeout_test(paused)]
async fn direct_drawing_request_is_displayed() {
    let transport = ScriptedTransport::new();
    transport.push_text(snapshot("V3", 0, &label(1, "hello")));
    let harness = Harness::start(transport);

    harness.handle.open_drawing("gauge").unwrap();
    harness
        .wait_for(|seen| seen.iter().any(|s| matches!(s, Seen::Redraw { .. })))
        .await;
    let (core, sent, sink) = harness.stop().await;

    assert_eq!(sent, ["{gauge}"]);
    assert_eq!(core.visible().drawings().version("gauge"), Some("V3"));
    assert_eq!(core.visible().mode(), DisplayMode::Drawing);
    assert_eq!(sink.redraws()[0], ["hello"]);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn menu_drawing_and_sub_drawing_arrive_as_one_redraw() {
    let transport = ScriptedTransport::new();
    transport.push_text("{,|+A~gauge}");
    transport.push_text(snapshot(
        "V1",
        0,
        &format!(
            r#"{},{{"type":"insertDwg","drawingName":"sub1","xOffset":10,"yOffset":5}}"#,
            label(1, "root")
        ),
    ));
    transport.push_text(snapshot("S1", 0, &label(2, "inner")));
    let harness = Harness::start(transport);

    harness.handle.connect().unwrap();
    harness
        .wait_for(|seen| seen.iter().any(|s| matches!(s, Seen::Redraw { .. })))
        .await;
    let (core, sent, sink) = harness.stop().await;

    assert_eq!(sent, ["{.}", "{gauge}", "{sub1}"]);
    assert_eq!(
        sink.seen()[0],
        Seen::Redraw {
            drawings: vec!["gauge".into(), "sub1".into()],
            texts: vec!["root".into(), "inner".into()],
        }
    );
    assert_eq!(core.visible().identifier(), "A");
}

#[test_timeout::tokio_timeout_test(paused)]
async fn touch_during_refresh_discards_the_refresh_reply() {
    let transport = ScriptedTransport::new();
    transport.push_text(snapshot("V1", 100, &label(1, "initial")));
    let refresh_reply = transport.push_held();
    transport.push_text(update(&label(1, "touched")));
    let harness = Harness::start(transport);

    harness.handle.open_drawing("gauge").unwrap();
    harness.wait_for_sent(2).await;
    assert_eq!(harness.transport.sent()[1], "{V1:gauge}");

    harness
        .handle
        .touch(TouchCommand::new("pfodWeb", "k", 3, 4, TouchFilter::Down))
        .unwrap();
    harness.settle().await;
    refresh_reply.send(Ok(update(&label(1, "stale")))).unwrap();

    harness
        .wait_for(|seen| {
            seen.iter()
                .any(|s| matches!(s, Seen::Redraw { texts, .. } if texts == &["touched"]))
        })
        .await;
    let (core, sent, sink) = harness.stop().await;

    assert_eq!(sent[2], "{pfodWeb~k`3`4`1}");
    assert!(sink.redraws().iter().all(|texts| texts != &["stale"]));
    assert_eq!(
        core.visible().merged().indexed[&1].props["text"],
        "touched"
    );
}

#[test_timeout::tokio_timeout_test(paused)]
async fn queued_drags_collapse_to_the_latest() {
    let transport = ScriptedTransport::new();
    transport.push_text(snapshot("V1", 0, &label(1, "start")));
    let first_drag = transport.push_held();
    transport.push_text(update(&label(1, "col4")));
    let harness = Harness::start(transport);

    harness.handle.open_drawing("gauge").unwrap();
    harness.handle.touch(drag(1)).unwrap();
    harness.wait_for_sent(2).await;
    for col in 2..=4 {
        harness.handle.touch(drag(col)).unwrap();
    }
    harness.settle().await;
    first_drag.send(Ok(update(&label(1, "col1")))).unwrap();

    harness
        .wait_for(|seen| {
            seen.iter()
                .any(|s| matches!(s, Seen::Redraw { texts, .. } if texts == &["col4"]))
        })
        .await;
    let (_core, sent, sink) = harness.stop().await;

    assert_eq!(sent, ["{gauge}", "{pfodWeb~k`1`0`2}", "{pfodWeb~k`4`0`2}"]);
    assert!(sink.redraws().iter().all(|texts| texts != &["col1"]));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn unreachable_device_shows_empty_chart() {
    let transport = ScriptedTransport::new();
    transport.push_error(TransportError::RetriesExhausted {
        attempts: 3,
        last: "connection refused".into(),
    });
    let harness = Harness::start(transport);

    harness.handle.connect().unwrap();
    harness
        .wait_for(|seen| seen.iter().any(|s| matches!(s, Seen::Diagnostic(_))))
        .await;
    let (core, _sent, sink) = harness.stop().await;

    assert_eq!(
        sink.seen(),
        [Seen::Diagnostic(DiagnosticView::Chart {
            title: "Chart".into(),
            labels: Vec::new(),
            limit: 500,
        })]
    );
    assert_eq!(core.visible().mode(), DisplayMode::Chart);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn later_failures_raise_an_alert() {
    let transport = ScriptedTransport::new();
    transport.push_text(snapshot("V1", 0, &label(1, "a")));
    transport.push_error(TransportError::Status(404));
    let harness = Harness::start(transport);

    harness.handle.open_drawing("gauge").unwrap();
    harness
        .handle
        .touch(TouchCommand::new("pfodWeb", "k", 0, 0, TouchFilter::Up))
        .unwrap();
    harness
        .wait_for(|seen| seen.iter().any(|s| matches!(s, Seen::Alert(_))))
        .await;
    let (core, _sent, sink) = harness.stop().await;

    assert!(sink
        .seen()
        .contains(&Seen::Alert(ViewerError::Transport(TransportError::Status(404)))));
    assert_eq!(core.visible().mode(), DisplayMode::Drawing);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn refresh_polls_with_the_held_version() {
    let transport = ScriptedTransport::new();
    transport.push_text(snapshot("V7", 50, &label(1, "tick0")));
    transport.push_text(update(&label(1, "tick1")));
    let harness = Harness::start(transport);

    harness.handle.open_drawing("gauge").unwrap();
    harness
        .wait_for(|seen| {
            seen.iter()
                .any(|s| matches!(s, Seen::Redraw { texts, .. } if texts == &["tick1"]))
        })
        .await;
    let (core, sent, _sink) = harness.stop().await;

    assert_eq!(sent[..2], ["{gauge}", "{V7:gauge}"]);
    assert!(core.updates_enabled());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn replies_are_held_until_the_pointer_lifts() {
    let transport = ScriptedTransport::new();
    transport.push_text(snapshot("V1", 0, &label(1, "before")));
    transport.push_text(update(&label(1, "after")));
    let harness = Harness::start(transport);

    harness.handle.open_drawing("gauge").unwrap();
    harness
        .wait_for(|seen| seen.iter().any(|s| matches!(s, Seen::Redraw { .. })))
        .await;
    harness.handle.gesture_start().unwrap();
    harness
        .handle
        .touch(TouchCommand::new("pfodWeb", "k", 1, 1, TouchFilter::Down))
        .unwrap();
    harness.wait_for_sent(2).await;
    harness.settle().await;
    assert!(harness
        .sink
        .redraws()
        .iter()
        .all(|texts| texts != &["after"]));

    harness.handle.gesture_end().unwrap();
    harness
        .wait_for(|seen| {
            seen.iter()
                .any(|s| matches!(s, Seen::Redraw { texts, .. } if texts == &["after"]))
        })
        .await;
    let (core, _sent, _sink) = harness.stop().await;
    assert_eq!(core.pending_len(), 0);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn touch_action_is_drawn_over_the_drawing() {
    let transport = ScriptedTransport::new();
    transport.push_text(snapshot("V1", 0, &label(1, "idle")));
    let harness = Harness::start(transport);

    harness.handle.open_drawing("gauge").unwrap();
    harness
        .wait_for(|seen| seen.iter().any(|s| matches!(s, Seen::Redraw { .. })))
        .await;
    let pressed = DrawingItem::from_value(&serde_json::json!(
        {"type": "label", "idx": 1, "text": "pressed"}
    ))
    .unwrap();
    harness.handle.show_touch_action(vec![pressed]).unwrap();
    harness
        .wait_for(|seen| {
            seen.iter()
                .any(|s| matches!(s, Seen::Redraw { texts, .. } if texts == &["pressed"]))
        })
        .await;
    let (_core, sent, sink) = harness.stop().await;

    assert_eq!(sent, ["{gauge}"]);
    let redraws = sink.redraws();
    assert_eq!(redraws[0], ["idle"]);
    assert_eq!(redraws.last().unwrap(), &["pressed"]);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn handle_reports_a_stopped_engine() {
    let harness = Harness::start(ScriptedTransport::new());
    let handle = harness.handle.clone();
    let _ = harness.stop().await;
    assert_eq!(handle.connect(), Err(SyncError::EngineClosed));
}
