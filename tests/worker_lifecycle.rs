//! Download worker lifecycle against a scripted fill source.

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc, Weekday};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

use fill_download::app::{download, AppError};
use fill_download::columns::ColumnRegistry;
use fill_download::schedule::{ActiveDays, ScheduleWindow};
use fill_download::session::{AuthStatus, FetchError, FillSource};
use fill_download::sink::CsvSink;
use fill_download::worker::{DownloadWorker, WorkerConfig, WorkerError, WorkerState};
use fill_download::FillRecord;

enum Step {
    Fills(Vec<FillRecord>),
    Network,
    Expired,
    /// Authorization is revoked while this fetch is in flight; the fetch
    /// itself still succeeds.
    LoseDuring(Vec<FillRecord>),
    Hang,
}

struct ScriptedSource {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<DateTime<Utc>>>,
    status: watch::Sender<AuthStatus>,
}

impl ScriptedSource {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        let (status, _rx) = watch::channel(AuthStatus::Authorized);
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
            status,
        })
    }

    fn unauthorized() -> Arc<Self> {
        let s = Self::new(vec![]);
        s.status.send_replace(AuthStatus::Unauthorized);
        s
    }

    fn revoke(&self, reason: &str) {
        self.status.send_replace(AuthStatus::Lost(reason.to_string()));
    }

    fn calls(&self) -> Vec<DateTime<Utc>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl FillSource for ScriptedSource {
    async fn fetch_fills_since(&self, since: DateTime<Utc>) -> Result<Vec<FillRecord>, FetchError> {
        self.calls.lock().unwrap().push(since);
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            None => Ok(vec![]),
            Some(Step::Fills(f)) => Ok(f),
            Some(Step::Network) => Err(FetchError::Network("connection reset".into())),
            Some(Step::Expired) => Err(FetchError::AuthExpired("HTTP 401".into())),
            Some(Step::LoseDuring(f)) => {
                self.revoke("revoked mid-fetch");
                Ok(f)
            }
            Some(Step::Hang) => std::future::pending().await,
        }
    }

    fn auth_status(&self) -> watch::Receiver<AuthStatus> {
        self.status.subscribe()
    }
}

fn base() -> DateTime<Utc> {
    Utc::now() + chrono::Duration::hours(1)
}

fn fill(id: &str, at: DateTime<Utc>) -> FillRecord {
    FillRecord::new(id, at)
}

fn always_open(days: ActiveDays) -> ScheduleWindow {
    let end = NaiveTime::from_hms_nano_opt(23, 59, 59, 999_999_999).unwrap();
    ScheduleWindow::new(NaiveTime::MIN, end, days, None).unwrap()
}

fn fast(window: ScheduleWindow) -> WorkerConfig {
    WorkerConfig::new(window, Duration::from_millis(10)).unwrap()
}

fn ids(batch: &[FillRecord]) -> Vec<&str> {
    batch.iter().map(|f| f.record_id.as_str()).collect()
}

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn batches_arrive_in_fetch_order() {
    let t = base();
    let source = ScriptedSource::new(vec![
        Step::Fills(vec![fill("1", t), fill("2", t + chrono::Duration::seconds(1))]),
        Step::Fills(vec![fill("3", t + chrono::Duration::seconds(2))]),
    ]);
    let worker = DownloadWorker::new(Arc::clone(&source));
    let mut events = worker.start(fast(always_open(ActiveDays::all()))).await.unwrap();
    assert_eq!(worker.state(), WorkerState::Running);

    let first = timeout(WAIT, events.batches.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, events.batches.recv()).await.unwrap().unwrap();
    assert_eq!(ids(&first), ["1", "2"]);
    assert_eq!(ids(&second), ["3"]);

    worker.stop().await;
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(events.fatal.await.is_err(), "clean stop reports no fatal error");

    // the second fetch resumed from the newest delivered record
    let calls = source.calls();
    assert_eq!(calls[1], t + chrono::Duration::seconds(1));
}

#[tokio::test]
async fn fills_from_earlier_today_are_downloaded() {
    let midnight = chrono::Local::now()
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_local_timezone(chrono::Local)
        .earliest()
        .unwrap()
        .with_timezone(&Utc);
    let earlier = (Utc::now() - chrono::Duration::seconds(30)).max(midnight);
    let source = ScriptedSource::new(vec![Step::Fills(vec![fill("early", earlier)])]);
    let worker = DownloadWorker::new(Arc::clone(&source));
    let mut events = worker.start(fast(always_open(ActiveDays::all()))).await.unwrap();

    let batch = timeout(WAIT, events.batches.recv()).await.unwrap().unwrap();
    assert_eq!(ids(&batch), ["early"]);
    assert_eq!(source.calls()[0], midnight);
    worker.stop().await;
}

#[tokio::test]
async fn boundary_repeats_are_not_forwarded_twice() {
    let t = base();
    let b = t + chrono::Duration::seconds(1);
    let source = ScriptedSource::new(vec![
        Step::Fills(vec![fill("A", t), fill("B", b)]),
        Step::Fills(vec![fill("B", b), fill("C", b), fill("D", b + chrono::Duration::seconds(1))]),
    ]);
    let worker = DownloadWorker::new(source);
    let mut events = worker.start(fast(always_open(ActiveDays::all()))).await.unwrap();

    let first = timeout(WAIT, events.batches.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, events.batches.recv()).await.unwrap().unwrap();
    assert_eq!(ids(&first), ["A", "B"]);
    assert_eq!(ids(&second), ["C", "D"]);
    worker.stop().await;
}

#[tokio::test]
async fn loss_racing_an_inflight_fetch_wins() {
    let t = base();
    let source = ScriptedSource::new(vec![
        Step::Fills(vec![fill("1", t)]),
        Step::LoseDuring(vec![fill("2", t + chrono::Duration::seconds(1))]),
        Step::Fills(vec![fill("3", t + chrono::Duration::seconds(2))]),
    ]);
    let worker = DownloadWorker::new(source);
    let mut state = worker.subscribe_state();
    let mut events = worker.start(fast(always_open(ActiveDays::all()))).await.unwrap();

    let first = timeout(WAIT, events.batches.recv()).await.unwrap().unwrap();
    assert_eq!(ids(&first), ["1"]);
    // nothing after the loss, then the channel closes
    assert!(timeout(WAIT, events.batches.recv()).await.unwrap().is_none());

    let fatal = timeout(WAIT, events.fatal).await.unwrap().unwrap();
    assert_eq!(fatal, WorkerError::AuthLost("revoked mid-fetch".into()));
    assert_eq!(*state.borrow_and_update(), WorkerState::Stopped);
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn loss_signal_interrupts_a_hanging_fetch() {
    let source = ScriptedSource::new(vec![Step::Hang]);
    let worker = DownloadWorker::new(Arc::clone(&source));
    let mut events = worker.start(fast(always_open(ActiveDays::all()))).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    source.revoke("session invalidated by venue");

    assert!(timeout(WAIT, events.batches.recv()).await.unwrap().is_none());
    let fatal = timeout(WAIT, events.fatal).await.unwrap().unwrap();
    assert_eq!(fatal, WorkerError::AuthLost("session invalidated by venue".into()));
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn expired_authorization_is_fatal() {
    let source = ScriptedSource::new(vec![Step::Expired, Step::Fills(vec![fill("x", base())])]);
    let worker = DownloadWorker::new(source);
    let mut events = worker.start(fast(always_open(ActiveDays::all()))).await.unwrap();

    assert!(timeout(WAIT, events.batches.recv()).await.unwrap().is_none());
    assert_eq!(
        timeout(WAIT, events.fatal).await.unwrap().unwrap(),
        WorkerError::AuthLost("HTTP 401".into())
    );
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn network_errors_are_retried_on_the_next_tick() {
    let source = ScriptedSource::new(vec![
        Step::Network,
        Step::Network,
        Step::Fills(vec![fill("1", base())]),
    ]);
    let worker = DownloadWorker::new(Arc::clone(&source));
    let mut events = worker.start(fast(always_open(ActiveDays::all()))).await.unwrap();

    let batch = timeout(WAIT, events.batches.recv()).await.unwrap().unwrap();
    assert_eq!(ids(&batch), ["1"]);
    assert!(source.calls().len() >= 3);
    assert_eq!(worker.state(), WorkerState::Running);
    worker.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent() {
    let worker = DownloadWorker::new(ScriptedSource::new(vec![]));
    let _events = worker.start(fast(always_open(ActiveDays::all()))).await.unwrap();

    worker.stop().await;
    assert_eq!(worker.state(), WorkerState::Stopped);
    worker.stop().await;
    worker.stop().await;
    assert_eq!(worker.state(), WorkerState::Stopped);
}

#[tokio::test]
async fn concurrent_stops_all_return_stopped() {
    let worker = Arc::new(DownloadWorker::new(ScriptedSource::new(vec![Step::Hang])));
    let _events = worker.start(fast(always_open(ActiveDays::all()))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let a = tokio::spawn({
        let w = Arc::clone(&worker);
        async move {
            w.stop().await;
            w.state()
        }
    });
    let b = tokio::spawn({
        let w = Arc::clone(&worker);
        async move {
            w.stop().await;
            w.state()
        }
    });
    assert_eq!(timeout(WAIT, a).await.unwrap().unwrap(), WorkerState::Stopped);
    assert_eq!(timeout(WAIT, b).await.unwrap().unwrap(), WorkerState::Stopped);
}

#[tokio::test]
async fn stop_before_start_is_terminal() {
    let worker = DownloadWorker::new(ScriptedSource::new(vec![]));
    worker.stop().await;
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert_eq!(
        worker.start(fast(always_open(ActiveDays::all()))).await.err(),
        Some(WorkerError::AlreadyStarted)
    );
}

#[tokio::test]
async fn second_start_is_rejected() {
    let worker = DownloadWorker::new(ScriptedSource::new(vec![]));
    let _events = worker.start(fast(always_open(ActiveDays::all()))).await.unwrap();
    assert_eq!(
        worker.start(fast(always_open(ActiveDays::all()))).await.err(),
        Some(WorkerError::AlreadyStarted)
    );
    worker.stop().await;
}

#[tokio::test]
async fn unauthorized_source_never_starts() {
    let worker = DownloadWorker::new(ScriptedSource::unauthorized());
    assert_eq!(
        worker.start(fast(always_open(ActiveDays::all()))).await.err(),
        Some(WorkerError::NotAuthorized)
    );
    assert_eq!(worker.state(), WorkerState::Idle);
}

#[tokio::test]
async fn stop_interrupts_a_closed_gate() {
    // active only on a day that is not today
    let today = chrono::Local::now().date_naive();
    let other: Weekday = chrono::Datelike::weekday(&today).succ().succ();
    let source = ScriptedSource::new(vec![]);
    let worker = DownloadWorker::new(Arc::clone(&source));
    let _events = worker
        .start(fast(always_open(ActiveDays::default().with(other))))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    timeout(Duration::from_secs(1), worker.stop()).await.unwrap();
    assert_eq!(worker.state(), WorkerState::Stopped);
    assert!(source.calls().is_empty(), "no fetch while the gate is closed");
}

#[tokio::test]
async fn controller_writes_batches_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fills.csv");
    let t = base();
    let source = ScriptedSource::new(vec![
        Step::Fills(vec![fill("1", t), fill("2", t + chrono::Duration::seconds(1))]),
        Step::Fills(vec![fill("3", t + chrono::Duration::seconds(2))]),
    ]);
    let columns = ColumnRegistry::global().select(&["RecordID"]).unwrap();
    let mut sink = CsvSink::create(&path, columns).await.unwrap();

    let shutdown = tokio::time::sleep(Duration::from_millis(200));
    let summary = timeout(
        WAIT,
        download(source, fast(always_open(ActiveDays::all())), &mut sink, shutdown),
    )
    .await
    .unwrap()
    .unwrap();
    sink.close().await.unwrap();

    assert_eq!(summary.batches, 2);
    assert_eq!(summary.rows, 3);
    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<_> = text.lines().collect();
    assert_eq!(lines, ["RecordID,", "1,", "2,", "3,"]);
}

#[tokio::test]
async fn controller_surfaces_auth_loss_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fills.csv");
    let source = ScriptedSource::new(vec![Step::Fills(vec![fill("1", base())]), Step::Expired]);
    let columns = ColumnRegistry::global().select(&["RecordID"]).unwrap();
    let mut sink = CsvSink::create(&path, columns).await.unwrap();

    let result = timeout(
        WAIT,
        download(
            source,
            fast(always_open(ActiveDays::all())),
            &mut sink,
            std::future::pending::<()>(),
        ),
    )
    .await
    .unwrap();
    sink.close().await.unwrap();

    assert!(matches!(result, Err(AppError::Worker(WorkerError::AuthLost(_)))));
    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().collect::<Vec<_>>(), ["RecordID,", "1,"]);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn controller_stops_the_worker_when_the_output_fails() {
    // every write to /dev/full fails with ENOSPC
    let source = ScriptedSource::new(vec![Step::Fills(vec![fill("1", base())])]);
    let columns = ColumnRegistry::global().select(&["RecordID"]).unwrap();
    let mut sink = CsvSink::create("/dev/full", columns).await.unwrap();

    let result = timeout(
        WAIT,
        download(
            Arc::clone(&source),
            fast(always_open(ActiveDays::all())),
            &mut sink,
            std::future::pending::<()>(),
        ),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(AppError::Sink(_))), "{result:?}");

    // the worker is gone: no more polling after download returned
    let polls = source.calls().len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(source.calls().len(), polls);
}
