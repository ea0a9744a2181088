use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use plexus_ai::{
    AdmissionGate, BatchScheduler, BlockingTextStream, Conversation, Message, PlexusError,
    PlexusErrorCode, PredictOptions, ProviderAdapter, Role, TextStream,
};
use tokio::time::Instant;

/// Answers every conversation after a fixed delay and records how many calls
/// overlapped.
struct SleepyAdapter {
    delay: Duration,
    started: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SleepyAdapter {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            started: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn reply(conversation: &Conversation) -> Result<String, PlexusError> {
        let prompt = conversation.last_content(Role::Human).unwrap_or_default();
        if prompt == "boom" {
            return Err(PlexusError::new(PlexusErrorCode::ProviderHttp, "boom"));
        }
        Ok(format!("done: {prompt}"))
    }
}

#[async_trait]
impl ProviderAdapter for SleepyAdapter {
    fn provider(&self) -> &str {
        "sleepy"
    }

    fn model(&self) -> &str {
        "sleepy-1"
    }

    fn predict(
        &self,
        conversation: &mut Conversation,
        _options: &PredictOptions,
    ) -> Result<(), PlexusError> {
        let reply = Self::reply(conversation)?;
        conversation.append(Message::assistant(reply));
        Ok(())
    }

    async fn apredict(
        &self,
        conversation: &mut Conversation,
        _options: &PredictOptions,
    ) -> Result<(), PlexusError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let reply = Self::reply(conversation)?;
        conversation.append(Message::assistant(reply));
        Ok(())
    }

    fn stream<'a>(
        &'a self,
        conversation: &'a mut Conversation,
        _options: &PredictOptions,
    ) -> Result<BlockingTextStream<'a>, PlexusError> {
        let reply = Self::reply(conversation)?;
        Ok(BlockingTextStream::ready(vec![reply], None, conversation))
    }

    async fn astream<'a>(
        &'a self,
        conversation: &'a mut Conversation,
        _options: &'a PredictOptions,
    ) -> Result<TextStream<'a>, PlexusError> {
        let reply = Self::reply(conversation)?;
        Ok(TextStream::ready(vec![reply], None, conversation))
    }
}

fn conversations(prompts: &[&str]) -> Vec<Conversation> {
    prompts
        .iter()
        .map(|prompt| {
            let mut conversation = Conversation::new();
            conversation.append(Message::human(*prompt));
            conversation
        })
        .collect()
}

fn replies(conversations: &[Conversation]) -> Vec<String> {
    conversations
        .iter()
        .map(|conversation| {
            conversation
                .last_content(Role::Assistant)
                .unwrap_or_default()
                .to_string()
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn five_items_with_two_slots_finish_in_three_rounds() {
    let adapter = SleepyAdapter::new(Duration::from_secs(1));
    let started = Instant::now();

    let results = adapter
        .abatch(
            conversations(&["a", "b", "c", "d", "e"]),
            &PredictOptions::default(),
            2,
        )
        .await
        .expect("batch should succeed");

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(3500), "elapsed {elapsed:?}");
    assert_eq!(adapter.peak.load(Ordering::SeqCst), 2);
    assert_eq!(
        replies(&results),
        vec!["done: a", "done: b", "done: c", "done: d", "done: e"]
    );
}

#[tokio::test(start_paused = true)]
async fn in_flight_count_never_exceeds_ceiling() {
    let scheduler = BatchScheduler::new(3);
    let in_flight = AtomicUsize::new(0);
    let peak = AtomicUsize::new(0);

    let results = scheduler
        .run_all((0..10).collect::<Vec<u64>>(), |index| {
            let in_flight = &in_flight;
            let peak = &peak;
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10 * (10 - index))).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, PlexusError>(index * 2)
            }
        })
        .await;

    assert_eq!(peak.load(Ordering::SeqCst), 3);
    let values = results
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .expect("all items succeed");
    assert_eq!(values, (0..10).map(|index| index * 2).collect::<Vec<_>>());
    assert_eq!(scheduler.gate().available(), 3);
}

#[tokio::test(start_paused = true)]
async fn one_failure_does_not_cancel_siblings() {
    let adapter = SleepyAdapter::new(Duration::from_millis(100));

    let outcomes = adapter
        .abatch_outcomes(
            conversations(&["a", "boom", "c", "d"]),
            &PredictOptions::default(),
            2,
        )
        .await;

    assert_eq!(adapter.started.load(Ordering::SeqCst), 4);
    assert!(outcomes[0].is_ok());
    assert_eq!(outcomes[1].as_ref().err().map(|e| e.message.as_str()), Some("boom"));
    assert!(outcomes[2].is_ok());
    assert!(outcomes[3].is_ok());
}

#[tokio::test(start_paused = true)]
async fn strict_batch_returns_first_error_in_input_order() {
    let adapter = SleepyAdapter::new(Duration::from_millis(10));

    let error = adapter
        .abatch(conversations(&["a", "boom", "c"]), &PredictOptions::default(), 3)
        .await
        .expect_err("batch should fail");

    assert_eq!(error.code, PlexusErrorCode::ProviderHttp);
    assert_eq!(adapter.started.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_batch_releases_every_slot() {
    let scheduler = BatchScheduler::new(2);

    let result = tokio::time::timeout(
        Duration::from_millis(50),
        scheduler.run_all(vec![1, 2, 3, 4], |_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, PlexusError>(())
        }),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(scheduler.gate().available(), 2);
}

#[tokio::test]
async fn zero_ceiling_still_makes_progress() {
    let scheduler = BatchScheduler::new(0);
    assert_eq!(scheduler.max_concurrent(), 1);

    let values = scheduler
        .try_run_all(vec!["x", "y"], |item| async move { Ok::<_, PlexusError>(item.len()) })
        .await
        .expect("batch should succeed");
    assert_eq!(values, vec![1, 1]);
}

#[tokio::test]
async fn cloned_gates_share_capacity() {
    let gate = AdmissionGate::new(1);
    let clone = gate.clone();

    let permit = gate.admit().await.expect("permit");
    assert_eq!(clone.available(), 0);
    drop(permit);
    assert_eq!(clone.available(), 1);
}

#[test]
fn sequential_batch_keeps_order_and_stops_on_failure() {
    let adapter = SleepyAdapter::new(Duration::ZERO);

    let results = adapter
        .batch(conversations(&["x", "y"]), &PredictOptions::default())
        .expect("batch should succeed");
    assert_eq!(replies(&results), vec!["done: x", "done: y"]);

    let error = adapter
        .batch(conversations(&["x", "boom", "z"]), &PredictOptions::default())
        .expect_err("batch should fail");
    assert_eq!(error.message, "boom");
}
