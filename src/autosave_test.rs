use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use canvas::doc::{EntityId, Node, NodeKind};
use serde_json::json;
use tracing_test::traced_test;

use super::*;
use crate::scheduler::ManualScheduler;

// =============================================================================
// Mock persistence
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Create(EntityKind, Payload),
    Update(EntityKind, EntityId, Payload),
    Delete(EntityKind, EntityId),
}

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct MockApi {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<EntityId>>,
    during_write: Mutex<Option<Hook>>,
}

impl MockApi {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn fail(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_owned());
    }

    fn heal(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
    }

    fn on_next_write(&self, hook: impl FnOnce() + Send + 'static) {
        *self.during_write.lock().unwrap() = Some(Box::new(hook));
    }

    fn record(&self, id: &str, call: Call) -> Result<(), PersistenceError> {
        self.calls.lock().unwrap().push(call);
        let hook = self.during_write.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        if self.failing.lock().unwrap().contains(id) {
            return Err(PersistenceError::Network(format!("{id} unreachable")));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceApi for MockApi {
    async fn create_entity(&self, kind: EntityKind, payload: &Payload) -> Result<EntityId, PersistenceError> {
        let id = payload["id"].as_str().unwrap_or_default().to_owned();
        self.record(&id, Call::Create(kind, payload.clone()))?;
        Ok(id)
    }

    async fn update_entity(&self, kind: EntityKind, id: &str, payload: &Payload) -> Result<(), PersistenceError> {
        self.record(id, Call::Update(kind, id.to_owned(), payload.clone()))
    }

    async fn delete_entity(&self, kind: EntityKind, id: &str) -> Result<(), PersistenceError> {
        self.record(id, Call::Delete(kind, id.to_owned()))
    }
}

const DEBOUNCE: Duration = Duration::from_millis(2000);

fn setup() -> (AutoSaveController, Arc<MockApi>, Arc<ManualScheduler>) {
    let api = Arc::new(MockApi::default());
    let scheduler = Arc::new(ManualScheduler::starting_at(1_700_000_000_000));
    let controller = AutoSaveController::new(api.clone(), scheduler.clone(), DEBOUNCE);
    controller.hydrate();
    (controller, api, scheduler)
}

fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().unwrap_or_default()
}

// =============================================================================
// Debounce
// =============================================================================

#[tokio::test]
async fn rapid_updates_flush_once_with_final_position() {
    let (controller, api, scheduler) = setup();

    for step in 0..5 {
        let x = f64::from(step) * 10.0;
        controller.enqueue("n1", EntityKind::Node, ChangeOp::Update, payload(json!({"x": x, "y": 5.0})));
        scheduler.advance(Duration::from_millis(40)).await;
    }
    assert!(api.calls().is_empty());

    // Last enqueue was 40ms ago; the timer is due 2000ms after it.
    scheduler.advance(Duration::from_millis(1_959)).await;
    assert!(api.calls().is_empty());
    scheduler.advance(Duration::from_millis(1)).await;

    assert_eq!(
        api.calls(),
        vec![Call::Update(EntityKind::Node, "n1".into(), payload(json!({"x": 40.0, "y": 5.0})))]
    );
    assert_eq!(controller.pending_count(), 0);
    assert_eq!(scheduler.pending_count(), 0);
}

#[tokio::test]
async fn each_enqueue_restarts_the_timer() {
    let (controller, api, scheduler) = setup();

    controller.enqueue("n1", EntityKind::Node, ChangeOp::Update, payload(json!({"x": 1.0})));
    scheduler.advance(Duration::from_millis(1_500)).await;
    controller.enqueue("n2", EntityKind::Node, ChangeOp::Update, payload(json!({"x": 2.0})));
    scheduler.advance(Duration::from_millis(1_500)).await;
    assert!(api.calls().is_empty());

    scheduler.advance(Duration::from_millis(500)).await;
    assert_eq!(api.calls().len(), 2);
}

#[tokio::test]
#[traced_test]
async fn changes_before_hydration_are_ignored() {
    let api = Arc::new(MockApi::default());
    let scheduler = Arc::new(ManualScheduler::new());
    let controller = AutoSaveController::new(api.clone(), scheduler.clone(), DEBOUNCE);

    assert!(!controller.enqueue("n1", EntityKind::Node, ChangeOp::Create, payload(json!({"x": 1.0}))));
    assert!(!controller.has_pending_changes());
    assert_eq!(scheduler.pending_count(), 0);
    assert!(logs_contain("change reported before hydration; not queued"));

    controller.hydrate();
    assert!(controller.enqueue("n1", EntityKind::Node, ChangeOp::Update, payload(json!({"x": 2.0}))));
    assert_eq!(controller.pending_count(), 1);
}

#[tokio::test]
async fn dispose_cancels_pending_timer() {
    let (controller, api, scheduler) = setup();
    controller.enqueue("n1", EntityKind::Node, ChangeOp::Update, payload(json!({"x": 1.0})));
    controller.dispose();

    scheduler.advance(DEBOUNCE * 2).await;
    assert!(api.calls().is_empty());
    assert!(controller.has_pending_changes());
}

#[tokio::test]
async fn timer_does_not_keep_controller_alive() {
    let (controller, api, scheduler) = setup();
    controller.enqueue("n1", EntityKind::Node, ChangeOp::Update, payload(json!({"x": 1.0})));
    drop(controller);

    scheduler.advance(DEBOUNCE).await;
    assert!(api.calls().is_empty());
}

// =============================================================================
// save_now / flush_all
// =============================================================================

#[tokio::test]
async fn save_now_flushes_immediately_and_cancels_timer() {
    let (controller, api, scheduler) = setup();
    controller.enqueue("n1", EntityKind::Node, ChangeOp::Update, payload(json!({"x": 1.0})));

    let report = controller.save_now().await;
    assert_eq!(report, FlushReport { attempted: 1, saved: 1, failed: 0 });
    assert_eq!(controller.pending_count(), 0);
    assert!(!controller.is_saving());
    assert_eq!(controller.last_saved(), Some(scheduler.now_ms()));
    assert_eq!(scheduler.pending_count(), 0);

    scheduler.advance(DEBOUNCE).await;
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn failed_entries_remain_with_verbatim_error() {
    let (controller, api, _scheduler) = setup();
    api.fail("bad");
    controller.enqueue("good", EntityKind::Node, ChangeOp::Update, payload(json!({"x": 1.0})));
    controller.enqueue("bad", EntityKind::Edge, ChangeOp::Update, payload(json!({"label": "x"})));

    let report = controller.save_now().await;
    assert_eq!(report, FlushReport { attempted: 2, saved: 1, failed: 1 });

    let status = controller.status();
    assert_eq!(status.pending_count, 1);
    assert!(!status.is_saving);
    assert_eq!(status.last_error.as_deref(), Some("network error: bad unreachable"));
    assert!(controller.pending("bad").is_some());
    assert!(controller.pending("good").is_none());
}

#[tokio::test]
async fn successful_retry_clears_last_error() {
    let (controller, api, _scheduler) = setup();
    api.fail("n1");
    controller.enqueue("n1", EntityKind::Node, ChangeOp::Update, payload(json!({"x": 1.0})));
    controller.save_now().await;
    assert!(controller.last_error().is_some());

    api.heal("n1");
    let report = controller.save_now().await;
    assert_eq!(report.saved, 1);
    assert_eq!(controller.last_error(), None);
    assert!(!controller.has_pending_changes());
}

#[tokio::test]
async fn flush_with_nothing_queued_is_a_noop() {
    let (controller, api, _scheduler) = setup();
    assert_eq!(controller.flush_all().await, FlushReport::default());
    assert!(api.calls().is_empty());
    assert_eq!(controller.last_saved(), None);
}

#[tokio::test]
async fn concurrent_flushes_do_not_duplicate_writes() {
    let (controller, api, _scheduler) = setup();
    controller.enqueue("n1", EntityKind::Node, ChangeOp::Update, payload(json!({"x": 1.0})));

    let (first, second) = tokio::join!(controller.flush_all(), controller.flush_all());
    assert_eq!(first.attempted + second.attempted, 1);
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn edit_during_flush_lands_in_next_flush() {
    let (controller, api, _scheduler) = setup();
    controller.enqueue("n1", EntityKind::Node, ChangeOp::Update, payload(json!({"x": 1.0})));

    let during = controller.clone();
    let observed_saving = Arc::new(Mutex::new(false));
    let observed = observed_saving.clone();
    api.on_next_write(move || {
        *observed.lock().unwrap() = during.is_saving();
        during.enqueue("n1", EntityKind::Node, ChangeOp::Update, payload(json!({"x": 2.0})));
    });

    controller.save_now().await;
    assert!(*observed_saving.lock().unwrap());
    assert_eq!(controller.pending_count(), 1);

    controller.save_now().await;
    assert_eq!(
        api.calls(),
        vec![
            Call::Update(EntityKind::Node, "n1".into(), payload(json!({"x": 1.0}))),
            Call::Update(EntityKind::Node, "n1".into(), payload(json!({"x": 2.0}))),
        ]
    );
    assert!(!controller.has_pending_changes());
}

// =============================================================================
// Op mapping
// =============================================================================

#[tokio::test]
async fn create_payload_carries_entity_id() {
    let (controller, api, _scheduler) = setup();
    controller.enqueue("n9", EntityKind::Node, ChangeOp::Create, payload(json!({"label": "Churn"})));
    controller.save_now().await;

    assert_eq!(
        api.calls(),
        vec![Call::Create(EntityKind::Node, payload(json!({"id": "n9", "label": "Churn"})))]
    );
}

#[tokio::test]
async fn delete_maps_to_delete_call() {
    let (controller, api, _scheduler) = setup();
    controller.enqueue("e1", EntityKind::Edge, ChangeOp::Update, payload(json!({"label": "x"})));
    controller.enqueue("e1", EntityKind::Edge, ChangeOp::Delete, Payload::new());
    controller.save_now().await;

    assert_eq!(api.calls(), vec![Call::Delete(EntityKind::Edge, "e1".into())]);
}

#[tokio::test]
async fn discard_drops_unsaved_create() {
    let (controller, api, _scheduler) = setup();
    controller.enqueue("n1", EntityKind::Node, ChangeOp::Create, Payload::new());
    assert!(controller.discard("n1"));
    assert!(!controller.discard("n1"));

    controller.save_now().await;
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn enqueue_entity_sends_full_typed_state() {
    let (controller, api, _scheduler) = setup();
    let mut node = Node::new(NodeKind::Driver, "Ad spend", 3.0, 4.0);
    node.id = "n1".into();

    assert!(controller.enqueue_entity(&node, ChangeOp::Create).unwrap());
    controller.save_now().await;

    let calls = api.calls();
    let Call::Create(kind, sent) = &calls[0] else {
        panic!("expected create call");
    };
    assert_eq!(*kind, EntityKind::Node);
    assert_eq!(sent["label"], json!("Ad spend"));
    assert_eq!(sent["width"], serde_json::Value::Null);
}

#[test]
fn status_serializes_for_ui() {
    let status = AutoSaveStatus { pending_count: 2, ..AutoSaveStatus::default() };
    let value = serde_json::to_value(&status).unwrap();
    assert_eq!(value["pending_count"], json!(2));
    assert_eq!(value["last_error"], serde_json::Value::Null);
}
