//! The distillation scheduler: producer, worker pool, writer, committer.
//!
//! The pipeline is a single stream: input records are expanded into
//! per-fan-out jobs, each job becomes a future that submits itself to a
//! bounded worker pool and awaits the result, and those futures are
//! resolved through `buffered` (ordered mode) or `buffer_unordered`
//! (unordered mode). The bounded pool channel plus the buffering window
//! cap live work at `2 × workers × inflight_multiplier` items, and the
//! stream's demand is the backpressure: nothing reads ahead of what the
//! resolver is willing to hold.
//!
//! The write loop at the bottom of the stream owns the output file and
//! the checkpoint. It tracks fan-out arrivals per input index, commits
//! indices when every fan-out has arrived, and periodically fsyncs the
//! output before atomically rewriting the checkpoint, in that order.
//!
//! Two cancellation scopes control a run: cancelling `intake` (pause)
//! stops record admission and lets running calls drain; cancelling the
//! parent `hard` token (stop) also aborts in-flight model calls, sleeps,
//! and rate-limit waits.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use futures::{
    FutureExt as _, SinkExt as _, StreamExt as _,
    channel::{mpsc, oneshot},
    future::BoxFuture,
    stream,
};
use tokio_util::sync::CancellationToken;

use crate::{
    checkpoint::{Checkpoint, CheckpointStore},
    error::DistillError,
    gateway::{GenerationRequest, ModelError, ModelGateway},
    input::{IndexedRecord, RecordPayload, open_records},
    output::{OutputWriter, build_output_record},
    params::DistillParams,
    prelude::*,
    rate_limit::RequestGate,
    retry::RetryPolicy,
    strategy::PromptBuilder,
};

/// How many consecutive leading records may be malformed before the
/// task gives up on the input file.
const MALFORMED_PREFIX_LIMIT: u64 = 100;

/// Cancellation scopes for one run.
#[derive(Clone)]
pub struct RunControl {
    hard: CancellationToken,
    intake: CancellationToken,
}

impl RunControl {
    pub fn new() -> Self {
        let hard = CancellationToken::new();
        let intake = hard.child_token();
        Self { hard, intake }
    }

    /// Stop admitting new work; running jobs drain, queued jobs are
    /// dropped and will be redone on resume.
    pub fn pause(&self) {
        self.intake.cancel();
    }

    /// Abort everything, including in-flight model calls.
    pub fn stop(&self) {
        self.hard.cancel();
    }

    pub fn pause_requested(&self) -> bool {
        self.intake.is_cancelled()
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters describing a run, sent to the state task on every commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub input_total: u64,
    pub input_processed: u64,
    pub outputs_written: u64,
    pub failures: u64,
    pub quality_failures: u64,
    pub input_errors: u64,
}

/// How a run ended, short of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Paused,
}

/// Final accounting for a run.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub snapshot: ProgressSnapshot,
}

/// Where a run starts from: a fresh task, or a checkpointed one with
/// counters carried over from the task state.
#[derive(Debug, Default)]
pub struct RunStart {
    pub checkpoint: Option<Checkpoint>,
    pub failures: u64,
    pub quality_failures: u64,
    pub input_errors: u64,
}

/// One unit of work: a single fan-out of a single record.
struct Job {
    index: u64,
    seq: u32,
    total: u32,
    record: Arc<JsonObject>,
}

/// A job plus the channel its result travels back on.
struct JobSlot {
    job: Job,
    tx: oneshot::Sender<JobResult>,
}

/// Stream items between the producer and the resolver.
enum WorkItem {
    Generate(Job),
    /// A record that consumes its index without reaching a worker.
    Skip { index: u64, reason: String },
}

/// The result of one job, as a value. Errors on the job path never
/// unwind; only I/O on the output path does.
struct JobResult {
    index: u64,
    seq: u32,
    total: u32,
    outcome: JobOutcome,
}

enum JobOutcome {
    /// A finished output record, ready to write.
    Output(Box<JsonObject>),
    /// Fatal model error; counted, no output.
    Failed(String),
    /// Output produced but rejected by validation; counted, no output.
    QualityFail(String),
    /// Malformed input record; counted separately, no output.
    InputError(String),
    /// Scope cancelled; not an error, the index stays uncommitted.
    Cancelled,
}

/// Everything a worker needs, shared across the pool.
struct WorkerContext {
    gateway: Arc<dyn ModelGateway>,
    gate: RequestGate,
    policy: RetryPolicy,
    builder: PromptBuilder,
    control: RunControl,
    model_id: String,
    temperature: Option<f32>,
    top_p: Option<f32>,
    top_k: Option<u32>,
    max_tokens: Option<u32>,
    timeout: std::time::Duration,
}

/// Run one distillation pass over the input.
#[instrument(level = "debug", skip_all, fields(input = %params.input_path.display()))]
pub async fn run(
    params: &DistillParams,
    gateway: Arc<dyn ModelGateway>,
    control: RunControl,
    progress: mpsc::UnboundedSender<ProgressSnapshot>,
    start: RunStart,
) -> Result<RunSummary> {
    let result = run_inner(params, gateway, control.clone(), progress, start).await;
    if result.is_err() {
        // Release any workers still blocked on the model or the gate.
        control.stop();
    }
    result
}

async fn run_inner(
    params: &DistillParams,
    gateway: Arc<dyn ModelGateway>,
    control: RunControl,
    progress: mpsc::UnboundedSender<ProgressSnapshot>,
    start: RunStart,
) -> Result<RunSummary> {
    let builder = PromptBuilder::new(params)?;
    let checkpoint_store = CheckpointStore::for_output(&params.output_path);
    let resuming = start.checkpoint.is_some();
    let checkpoint = start.checkpoint.unwrap_or_default();

    // The writer trusts the checkpoint: everything past the line count
    // recorded at the last commit is regenerated, never replayed.
    let mut writer = if resuming {
        OutputWriter::resume(
            &params.output_path,
            params.fsync_interval,
            checkpoint.outputs_written,
        )
        .await?
    } else {
        OutputWriter::create(&params.output_path, params.fsync_interval).await?
    };

    let input = open_records(&params.input_path).await?;
    let input_total = input.total;

    let mut committer = Committer {
        checkpoint,
        arrivals: BTreeMap::new(),
        lines_at_last_commit: writer.outputs_written(),
        committed_since_save: 0,
        checkpoint_interval: params.checkpoint_interval,
        snapshot: ProgressSnapshot {
            input_total,
            input_processed: 0,
            outputs_written: writer.outputs_written(),
            failures: start.failures,
            quality_failures: start.quality_failures,
            input_errors: start.input_errors,
        },
    };
    committer.snapshot.input_processed = committer.checkpoint.completed_count();
    let _ = progress.unbounded_send(committer.snapshot);

    // Worker pool: a bounded queue drained with bounded concurrency.
    let inflight_cap = params.inflight_cap();
    let (job_tx, job_rx) = mpsc::channel::<JobSlot>(inflight_cap);
    let context = Arc::new(WorkerContext {
        gateway,
        gate: RequestGate::new(params.rate_limit_rps),
        policy: RetryPolicy::new(params.max_backoff),
        builder,
        control: control.clone(),
        model_id: params.model_id.clone(),
        temperature: params.temperature,
        top_p: params.top_p,
        top_k: params.top_k,
        max_tokens: params.max_tokens,
        timeout: std::time::Duration::from_millis(params.timeout_ms),
    });
    let pool_context = context.clone();
    let workers = params.workers;
    let pool = tokio::spawn(async move {
        job_rx
            .for_each_concurrent(workers, |slot: JobSlot| {
                let context = pool_context.clone();
                async move {
                    let result = process_job(&context, slot.job).await;
                    if slot.tx.send(result).is_err() {
                        debug!("job result receiver dropped");
                    }
                }
            })
            .await;
    });

    // Producer: admit records until pause, expand fan-out, skip what the
    // checkpoint already covers.
    let intake = control.intake.clone();
    let completed = committer.checkpoint.clone();
    let fanout_total = params.fanout_total();
    let records_seen = Arc::new(AtomicU64::new(0));
    let records_valid = Arc::new(AtomicU64::new(0));
    let work_items = input
        .stream
        .take_while(move |_| futures::future::ready(!intake.is_cancelled()))
        .flat_map(move |record| {
            let items: Vec<Result<WorkItem>> = match record {
                Err(err) => vec![Err(err)],
                Ok(IndexedRecord { index, payload }) => {
                    if completed.is_completed(index) {
                        records_seen.fetch_add(1, Ordering::Relaxed);
                        records_valid.fetch_add(1, Ordering::Relaxed);
                        vec![]
                    } else {
                        match payload {
                            RecordPayload::Object(map) => {
                                records_seen.fetch_add(1, Ordering::Relaxed);
                                records_valid.fetch_add(1, Ordering::Relaxed);
                                let record = Arc::new(map);
                                (0..fanout_total)
                                    .map(|seq| {
                                        Ok(WorkItem::Generate(Job {
                                            index,
                                            seq,
                                            total: fanout_total,
                                            record: record.clone(),
                                        }))
                                    })
                                    .collect()
                            }
                            RecordPayload::Malformed(reason) => {
                                let seen =
                                    records_seen.fetch_add(1, Ordering::Relaxed) + 1;
                                let valid = records_valid.load(Ordering::Relaxed);
                                if seen >= MALFORMED_PREFIX_LIMIT && valid == 0 {
                                    vec![Err(DistillError::Input(format!(
                                        "first {MALFORMED_PREFIX_LIMIT} records are \
                                         all malformed; giving up on this input"
                                    ))
                                    .into())]
                                } else {
                                    vec![Ok(WorkItem::Skip { index, reason })]
                                }
                            }
                        }
                    }
                }
            };
            stream::iter(items)
        });

    // Resolver: each work item becomes a future; `buffered` keeps the
    // output in `(index, seq)` order, `buffer_unordered` trades that for
    // throughput.
    let submissions = work_items.map(move |item| -> BoxFuture<'static, Result<JobResult>> {
        let mut job_tx = job_tx.clone();
        async move {
            match item? {
                WorkItem::Skip { index, reason } => Ok(JobResult {
                    index,
                    seq: 0,
                    total: 1,
                    outcome: JobOutcome::InputError(reason),
                }),
                WorkItem::Generate(job) => {
                    let (index, seq, total) = (job.index, job.seq, job.total);
                    let (tx, rx) = oneshot::channel();
                    if job_tx.send(JobSlot { job, tx }).await.is_err() {
                        // Pool gone mid-shutdown; treat as cancelled.
                        return Ok(JobResult {
                            index,
                            seq,
                            total,
                            outcome: JobOutcome::Cancelled,
                        });
                    }
                    match rx.await {
                        Ok(result) => Ok(result),
                        Err(_) => Ok(JobResult {
                            index,
                            seq,
                            total,
                            outcome: JobOutcome::Cancelled,
                        }),
                    }
                }
            }
        }
        .boxed()
    });
    let mut resolved = if params.unordered_write {
        submissions.buffer_unordered(inflight_cap).boxed()
    } else {
        submissions.buffered(inflight_cap).boxed()
    };

    // Write loop. In ordered mode a cancelled result is a gap: emitting
    // anything past it would break the strict line order across resume
    // cycles, so everything after the gap is drained and redone later.
    let ordered = !params.unordered_write;
    let mut halted = false;
    while let Some(result) = resolved.next().await {
        let result = result?;
        if halted {
            continue;
        }
        let kind = match result.outcome {
            JobOutcome::Output(record) => {
                writer.write_record(&record).await?;
                committer.snapshot.outputs_written = writer.outputs_written();
                Arrival::Output
            }
            JobOutcome::Failed(reason) => {
                warn!(
                    index = result.index,
                    seq = result.seq,
                    "Generation failed: {reason}"
                );
                Arrival::Failed
            }
            JobOutcome::QualityFail(reason) => {
                warn!(
                    index = result.index,
                    seq = result.seq,
                    "Output failed validation: {reason}"
                );
                Arrival::QualityFail
            }
            JobOutcome::InputError(reason) => {
                warn!(index = result.index, "Skipping malformed record: {reason}");
                Arrival::InputError
            }
            JobOutcome::Cancelled => {
                if ordered {
                    halted = true;
                }
                continue;
            }
        };
        committer
            .arrived(result.index, result.total, kind, &mut writer, &checkpoint_store)
            .await?;
        let _ = progress.unbounded_send(committer.snapshot);
    }

    // Dropping the resolver releases the last queue sender, which lets
    // the pool wind down.
    drop(resolved);
    pool.await.context("worker pool panicked")?;

    // Final flush and checkpoint, whatever the outcome.
    writer.sync().await?;
    committer
        .save_checkpoint(&mut writer, &checkpoint_store)
        .await?;

    let outcome = if control.pause_requested() {
        RunOutcome::Paused
    } else {
        RunOutcome::Completed
    };
    let _ = progress.unbounded_send(committer.snapshot);
    info!(
        outcome = ?outcome,
        processed = committer.snapshot.input_processed,
        written = committer.snapshot.outputs_written,
        failures = committer.snapshot.failures,
        "Run finished"
    );
    Ok(RunSummary {
        outcome,
        snapshot: committer.snapshot,
    })
}

/// How one fan-out of an index resolved.
enum Arrival {
    Output,
    Failed,
    QualityFail,
    InputError,
}

/// Per-index arrival bookkeeping for indices not yet complete.
#[derive(Default)]
struct PendingIndex {
    arrived: u32,
    failures: u32,
    quality_failures: u32,
    input_errors: u32,
}

/// Commit bookkeeping for the write loop.
struct Committer {
    checkpoint: Checkpoint,
    arrivals: BTreeMap<u64, PendingIndex>,
    /// Writer line count at the most recent index commit. Lines past
    /// this belong to incomplete indices only, so resume can truncate
    /// to here and regenerate without duplicating anything.
    lines_at_last_commit: u64,
    committed_since_save: u64,
    checkpoint_interval: u64,
    snapshot: ProgressSnapshot,
}

impl Committer {
    /// Record one fan-out arrival for `index`; commit the index when
    /// all of them have arrived. Failure counters fold into the
    /// snapshot only at commit, so an index interrupted part-way is
    /// redone on resume without double counting.
    async fn arrived(
        &mut self,
        index: u64,
        total: u32,
        kind: Arrival,
        writer: &mut OutputWriter,
        store: &CheckpointStore,
    ) -> Result<()> {
        let pending = self.arrivals.entry(index).or_default();
        pending.arrived += 1;
        match kind {
            Arrival::Output => {}
            Arrival::Failed => pending.failures += 1,
            Arrival::QualityFail => {
                pending.failures += 1;
                pending.quality_failures += 1;
            }
            Arrival::InputError => pending.input_errors += 1,
        }
        if pending.arrived < total {
            return Ok(());
        }
        let pending = self.arrivals.remove(&index).expect("pending index exists");
        self.snapshot.failures += u64::from(pending.failures);
        self.snapshot.quality_failures += u64::from(pending.quality_failures);
        self.snapshot.input_errors += u64::from(pending.input_errors);
        self.checkpoint.mark_completed(index);
        self.lines_at_last_commit = writer.outputs_written();
        self.snapshot.input_processed = self.checkpoint.completed_count();
        self.committed_since_save += 1;
        if self.committed_since_save >= self.checkpoint_interval {
            self.save_checkpoint(writer, store).await?;
        }
        Ok(())
    }

    /// Fsync the output, then atomically rewrite the checkpoint. The
    /// order is the durability invariant: a checkpoint never claims a
    /// line that isn't on disk.
    async fn save_checkpoint(
        &mut self,
        writer: &mut OutputWriter,
        store: &CheckpointStore,
    ) -> Result<()> {
        writer.sync().await?;
        self.checkpoint.outputs_written = self.lines_at_last_commit;
        store.save(&self.checkpoint).await?;
        self.committed_since_save = 0;
        Ok(())
    }
}

/// Run one job: admission, model call, retries, post-processing.
async fn process_job(context: &WorkerContext, job: Job) -> JobResult {
    let cancelled = |index, seq, total| JobResult {
        index,
        seq,
        total,
        outcome: JobOutcome::Cancelled,
    };
    let started = Instant::now();

    // Queued jobs admitted before a pause are dropped, not drained.
    if context.control.pause_requested() {
        return cancelled(job.index, job.seq, job.total);
    }

    let rendered = match context.builder.build(&job.record) {
        Ok(rendered) => rendered,
        Err(err) => {
            return JobResult {
                index: job.index,
                seq: job.seq,
                total: job.total,
                outcome: JobOutcome::Failed(err.to_string()),
            };
        }
    };
    let request = GenerationRequest {
        prompt: rendered.prompt,
        system_prompt: rendered.system_prompt,
        temperature: context.temperature,
        top_p: context.top_p,
        top_k: context.top_k,
        max_tokens: context.max_tokens,
        timeout: context.timeout,
    };

    let mut attempt = 0u32;
    let raw = loop {
        if context
            .gate
            .acquire(&context.control.hard)
            .await
            .is_err()
        {
            return cancelled(job.index, job.seq, job.total);
        }
        let result = tokio::select! {
            result = context.gateway.generate(&request) => result,
            _ = context.control.hard.cancelled() => Err(ModelError::Cancelled),
        };
        match result {
            Ok(text) => break text,
            Err(ModelError::Cancelled) => {
                return cancelled(job.index, job.seq, job.total);
            }
            Err(err) => match context.policy.next_delay(attempt, &err) {
                Some(delay) => {
                    debug!(
                        index = job.index,
                        seq = job.seq,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient model error, will retry: {err}"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = context.control.hard.cancelled() => {
                            return cancelled(job.index, job.seq, job.total);
                        }
                    }
                    attempt += 1;
                }
                None => {
                    return JobResult {
                        index: job.index,
                        seq: job.seq,
                        total: job.total,
                        outcome: JobOutcome::Failed(err.to_string()),
                    };
                }
            },
        }
    };

    match context.builder.finalize(&raw) {
        Ok(text) => {
            let question = rendered
                .question
                .map(|question| (context.builder.q_field_name(), question));
            let record = build_output_record(
                &job.record,
                text,
                question,
                context.builder.target_field(),
                context.builder.strategy(),
                &context.model_id,
                job.index,
                job.seq,
                started.elapsed().as_millis() as u64,
            );
            JobResult {
                index: job.index,
                seq: job.seq,
                total: job.total,
                outcome: JobOutcome::Output(Box::new(record)),
            }
        }
        Err(reason) => JobResult {
            index: job.index,
            seq: job.seq,
            total: job.total,
            outcome: JobOutcome::QualityFail(reason),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::Mutex,
        time::Duration,
    };

    use async_trait::async_trait;
    use futures::StreamExt as _;

    use super::*;
    use crate::{
        gateway::FnGateway,
        params::test_params,
        strategy::StrategyKind,
    };

    /// Pull the question text back out of a rendered q_to_a prompt.
    fn question_of(prompt: &str) -> String {
        let after = prompt
            .split("Question:\n")
            .nth(1)
            .expect("prompt has a question section");
        after
            .split("\n\n")
            .next()
            .expect("question ends at a blank line")
            .to_string()
    }

    /// Answers `ans(<question>)` after an optional delay.
    #[derive(Debug)]
    struct SlowAnswer {
        delay: Duration,
    }

    #[async_trait]
    impl ModelGateway for SlowAnswer {
        async fn generate(
            &self,
            request: &GenerationRequest,
        ) -> Result<String, ModelError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(format!("ans({})", question_of(&request.prompt)))
        }
    }

    fn write_question_input(dir: &Path, count: usize) -> PathBuf {
        let path = dir.join("input.jsonl");
        let mut data = String::new();
        for record in 0..count {
            data.push_str(&format!("{{\"instruction\":\"q{record}\"}}\n"));
        }
        std::fs::write(&path, data).unwrap();
        path
    }

    fn run_params(dir: &Path, input: PathBuf) -> DistillParams {
        let mut params = test_params();
        params.input_path = input;
        params.output_path = dir.join("out.jsonl");
        params
    }

    fn output_lines(path: &Path) -> Vec<JsonObject> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn index_seq(line: &JsonObject) -> (u64, u64) {
        (
            line.get("_gen_index").and_then(Value::as_u64).unwrap(),
            line.get("_gen_seq").and_then(Value::as_u64).unwrap(),
        )
    }

    async fn run_to_end(
        params: &DistillParams,
        gateway: Arc<dyn ModelGateway>,
        start: RunStart,
    ) -> RunSummary {
        let (tx, _rx) = mpsc::unbounded();
        run(params, gateway, RunControl::new(), tx, start)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ordered_q_to_a_preserves_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.jsonl");
        std::fs::write(&path, "{\"q\":\"A\"}\n{\"q\":\"B\"}\n{\"q\":\"C\"}\n").unwrap();
        let mut params = run_params(dir.path(), path);
        params.q_field_name = "q".into();

        let gateway = Arc::new(FnGateway(|request: &GenerationRequest| {
            Ok(format!("ans({})", question_of(&request.prompt)))
        }));
        let summary = run_to_end(&params, gateway, RunStart::default()).await;
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.snapshot.input_total, 3);
        assert_eq!(summary.snapshot.input_processed, 3);
        assert_eq!(summary.snapshot.outputs_written, 3);
        assert_eq!(summary.snapshot.failures, 0);

        let lines = output_lines(&params.output_path);
        assert_eq!(lines.len(), 3);
        for (index, expected) in ["A", "B", "C"].iter().enumerate() {
            assert_eq!(lines[index].get("q"), Some(&json!(expected)));
            assert_eq!(
                lines[index].get("output"),
                Some(&json!(format!("ans({expected})")))
            );
            assert_eq!(index_seq(&lines[index]), (index as u64, 0));
        }
    }

    #[tokio::test]
    async fn test_ordered_fanout_groups_by_index_and_seq() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_question_input(dir.path(), 10);
        let mut params = run_params(dir.path(), input);
        params.strategy = StrategyKind::Expand;
        params.generation_count = 3;
        params.workers = 4;

        let gateway = Arc::new(FnGateway(|_request: &GenerationRequest| {
            Ok("fresh record".to_string())
        }));
        let summary = run_to_end(&params, gateway, RunStart::default()).await;
        assert_eq!(summary.snapshot.outputs_written, 30);

        let lines = output_lines(&params.output_path);
        assert_eq!(lines.len(), 30);
        let pairs: Vec<(u64, u64)> = lines.iter().map(index_seq).collect();
        let mut expected = Vec::new();
        for index in 0..10 {
            for seq in 0..3 {
                expected.push((index, seq));
            }
        }
        assert_eq!(pairs, expected, "lines must ascend by (index, seq)");
    }

    #[tokio::test]
    async fn test_unordered_mode_is_reorderable_offline() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_question_input(dir.path(), 12);
        let mut params = run_params(dir.path(), input);
        params.unordered_write = true;
        params.workers = 4;

        let gateway = Arc::new(SlowAnswer {
            delay: Duration::from_millis(1),
        });
        let summary = run_to_end(&params, gateway, RunStart::default()).await;
        assert_eq!(summary.outcome, RunOutcome::Completed);

        let mut pairs: Vec<(u64, u64)> =
            output_lines(&params.output_path).iter().map(index_seq).collect();
        pairs.sort_unstable();
        let expected: Vec<(u64, u64)> = (0..12).map(|index| (index, 0)).collect();
        assert_eq!(pairs, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_and_respects_the_attempt_budget() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_question_input(dir.path(), 6);
        let params = run_params(dir.path(), input);

        // Every job fails twice with a 500 before succeeding.
        let calls: Arc<Mutex<HashMap<String, u32>>> = Arc::new(Mutex::new(HashMap::new()));
        let calls_in_gateway = calls.clone();
        let gateway = Arc::new(FnGateway(move |request: &GenerationRequest| {
            let question = question_of(&request.prompt);
            let mut calls = calls_in_gateway.lock().unwrap();
            let seen = calls.entry(question.clone()).or_insert(0);
            *seen += 1;
            if *seen <= 2 {
                Err(ModelError::Transient {
                    status: Some(500),
                    retry_after: None,
                    message: "flaky".into(),
                })
            } else {
                Ok(format!("ans({question})"))
            }
        }));

        let summary = run_to_end(&params, gateway, RunStart::default()).await;
        assert_eq!(summary.snapshot.outputs_written, 6);
        assert_eq!(summary.snapshot.failures, 0);
        for (_question, count) in calls.lock().unwrap().iter() {
            assert!(*count <= 3, "no job may make more than 3 calls");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistently_failing_job_counts_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_question_input(dir.path(), 4);
        let params = run_params(dir.path(), input);

        // q1 always 500s; everything else succeeds.
        let gateway = Arc::new(FnGateway(|request: &GenerationRequest| {
            let question = question_of(&request.prompt);
            if question == "q1" {
                Err(ModelError::Transient {
                    status: Some(500),
                    retry_after: None,
                    message: "down".into(),
                })
            } else {
                Ok(format!("ans({question})"))
            }
        }));

        let summary = run_to_end(&params, gateway, RunStart::default()).await;
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.snapshot.input_processed, 4);
        assert_eq!(summary.snapshot.outputs_written, 3);
        assert_eq!(summary.snapshot.failures, 1);

        // The failed record is committed, so a resume has nothing to redo.
        let store = CheckpointStore::for_output(&params.output_path);
        let checkpoint = store.load().await.unwrap().unwrap();
        assert_eq!(checkpoint.last_committed_index, 4);
    }

    #[tokio::test]
    async fn test_classify_label_snaps_and_counts_quality_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.jsonl");
        std::fs::write(
            &path,
            "{\"output\":\"great stuff\"}\n{\"output\":\"unclear\"}\n{\"output\":\"awful\"}\n",
        )
        .unwrap();
        let mut params = run_params(dir.path(), path);
        params.strategy = StrategyKind::ClassifyLabel;
        params.label_set = vec!["pos".into(), "neg".into()];

        let gateway = Arc::new(FnGateway(|request: &GenerationRequest| {
            if request.prompt.contains("great stuff") {
                Ok("POS".to_string())
            } else if request.prompt.contains("awful") {
                Ok("Neg".to_string())
            } else {
                Ok("maybe".to_string())
            }
        }));
        let summary = run_to_end(&params, gateway, RunStart::default()).await;
        assert_eq!(summary.snapshot.outputs_written, 2);
        assert_eq!(summary.snapshot.failures, 1);
        assert_eq!(summary.snapshot.quality_failures, 1);

        let lines = output_lines(&params.output_path);
        assert_eq!(lines[0].get("output"), Some(&json!("pos")));
        assert_eq!(lines[1].get("output"), Some(&json!("neg")));
    }

    #[tokio::test]
    async fn test_malformed_records_are_skipped_and_committed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.jsonl");
        std::fs::write(
            &path,
            "{\"instruction\":\"q0\"}\nnot json at all\n{\"instruction\":\"q2\"}\n",
        )
        .unwrap();
        let params = run_params(dir.path(), path);

        let gateway = Arc::new(FnGateway(|request: &GenerationRequest| {
            Ok(format!("ans({})", question_of(&request.prompt)))
        }));
        let summary = run_to_end(&params, gateway, RunStart::default()).await;
        assert_eq!(summary.snapshot.input_processed, 3);
        assert_eq!(summary.snapshot.outputs_written, 2);
        assert_eq!(summary.snapshot.input_errors, 1);
        assert_eq!(summary.snapshot.failures, 0);

        let store = CheckpointStore::for_output(&params.output_path);
        let checkpoint = store.load().await.unwrap().unwrap();
        assert_eq!(checkpoint.last_committed_index, 3);
    }

    #[tokio::test]
    async fn test_all_malformed_prefix_fails_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.jsonl");
        let mut data = String::new();
        for _record in 0..120 {
            data.push_str("broken line\n");
        }
        std::fs::write(&path, data).unwrap();
        let params = run_params(dir.path(), path);

        let gateway = Arc::new(FnGateway(|_request: &GenerationRequest| {
            Ok("unused".to_string())
        }));
        let (tx, _rx) = mpsc::unbounded();
        let err = run(&params, gateway, RunControl::new(), tx, RunStart::default())
            .await
            .unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_paces_model_calls() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_question_input(dir.path(), 20);
        let mut params = run_params(dir.path(), input);
        params.rate_limit_rps = Some(2.0);
        params.workers = 8;

        let gateway = Arc::new(SlowAnswer {
            delay: Duration::from_millis(10),
        });
        let started = tokio::time::Instant::now();
        let summary = run_to_end(&params, gateway, RunStart::default()).await;
        assert_eq!(summary.snapshot.outputs_written, 20);
        // One permit up front, then one every 500ms: 20 calls need 9.5s.
        assert!(
            started.elapsed() >= Duration::from_millis(9_500),
            "elapsed {:?}",
            started.elapsed()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_then_resume_equals_a_clean_run() {
        let clean_dir = tempfile::tempdir().unwrap();
        let input = write_question_input(clean_dir.path(), 20);
        let clean_params = run_params(clean_dir.path(), input.clone());
        let gateway: Arc<dyn ModelGateway> = Arc::new(SlowAnswer {
            delay: Duration::from_millis(20),
        });
        run_to_end(&clean_params, gateway.clone(), RunStart::default()).await;
        let clean: Vec<(u64, u64, Value)> = output_lines(&clean_params.output_path)
            .iter()
            .map(|line| {
                let (index, seq) = index_seq(line);
                (index, seq, line.get("output").unwrap().clone())
            })
            .collect();

        // Pass 1: pause once some records have committed.
        let dir = tempfile::tempdir().unwrap();
        let mut params = run_params(dir.path(), input);
        params.workers = 2;
        let control = RunControl::new();
        let (tx, mut rx) = mpsc::unbounded::<ProgressSnapshot>();
        let pauser = control.clone();
        let monitor = tokio::spawn(async move {
            while let Some(snapshot) = rx.next().await {
                if snapshot.input_processed >= 7 {
                    pauser.pause();
                    break;
                }
            }
        });
        let summary = run(&params, gateway.clone(), control, tx, RunStart::default())
            .await
            .unwrap();
        monitor.await.unwrap();
        assert_eq!(summary.outcome, RunOutcome::Paused);
        assert!(summary.snapshot.input_processed >= 7);
        assert!(summary.snapshot.input_processed < 20);

        // Simulate a torn write landing after the pause checkpoint.
        {
            use std::io::Write as _;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&params.output_path)
                .unwrap();
            file.write_all(b"{\"_gen_index\": 99, \"torn").unwrap();
        }

        // Pass 2: resume from the checkpoint.
        let store = CheckpointStore::for_output(&params.output_path);
        let checkpoint = store.load().await.unwrap().unwrap();
        let resumed = run_to_end(
            &params,
            gateway,
            RunStart {
                checkpoint: Some(checkpoint),
                failures: summary.snapshot.failures,
                quality_failures: summary.snapshot.quality_failures,
                input_errors: summary.snapshot.input_errors,
            },
        )
        .await;
        assert_eq!(resumed.outcome, RunOutcome::Completed);
        assert_eq!(resumed.snapshot.input_processed, 20);
        assert_eq!(resumed.snapshot.outputs_written, 20);

        let final_lines: Vec<(u64, u64, Value)> = output_lines(&params.output_path)
            .iter()
            .map(|line| {
                let (index, seq) = index_seq(line);
                (index, seq, line.get("output").unwrap().clone())
            })
            .collect();
        // Ordered mode: still strictly ascending across the resume.
        let mut sorted = final_lines.clone();
        sorted.sort_by_key(|(index, seq, _)| (*index, *seq));
        assert_eq!(final_lines, sorted);
        assert_eq!(final_lines, clean);
    }

    #[tokio::test]
    async fn test_resume_skips_completed_indices_without_calling_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_question_input(dir.path(), 5);
        let params = run_params(dir.path(), input);

        let gateway = Arc::new(FnGateway(|request: &GenerationRequest| {
            Ok(format!("ans({})", question_of(&request.prompt)))
        }));
        run_to_end(&params, gateway, RunStart::default()).await;

        let store = CheckpointStore::for_output(&params.output_path);
        let checkpoint = store.load().await.unwrap().unwrap();
        assert_eq!(checkpoint.last_committed_index, 5);

        // Resume over a finished task: the model must never be called.
        let strict = Arc::new(FnGateway(
            |_request: &GenerationRequest| -> Result<String, ModelError> {
                panic!("resume must not re-run completed records")
            },
        ));
        let resumed = run_to_end(
            &params,
            strict,
            RunStart {
                checkpoint: Some(checkpoint),
                ..RunStart::default()
            },
        )
        .await;
        assert_eq!(resumed.outcome, RunOutcome::Completed);
        assert_eq!(resumed.snapshot.outputs_written, 5);
        assert_eq!(output_lines(&params.output_path).len(), 5);
    }
}
