//! Send jobs: caller-side handles on one submitted package.
//!
//! A [`SendJob`] tracks two independent halves:
//!
//! ```text
//! send:     SendPended ──► Success | Fail          (or SendQueueIsFull at submit)
//! response: NoResponse ──► Success | Fail
//! ```
//!
//! Any number of tasks may wait on the same job. Only one of them gets the
//! response out of [`SendJob::take_response`]; the swap happens under a
//! single lock, so concurrent takers can never both see it.
//!
//! # Example
//!
//! ```ignore
//! let job = client.send_package(request);
//! if job.wait_for_response(Some(Duration::from_secs(2))).await == ResponseResult::Success {
//!     let response = job.take_response();
//!     println!("{} packages", response.packages.len());
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::config::SendRetryPolicy;
use crate::protocol::Package;
use crate::sender::SenderHandle;

/// Outcome of the send half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    Success,
    SendPended,
    /// Submission was refused because the outbound queue was full.
    /// Resubmit the package; waiting on this job will not change it.
    SendQueueIsFull,
    Fail,
}

/// Outcome of the response half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseResult {
    Success,
    NoResponse,
    Fail,
}

/// Responses claimed by [`SendJob::take_response`].
#[derive(Debug, Clone)]
pub struct Response {
    pub result: ResponseResult,
    pub packages: Vec<Arc<Package>>,
    /// Connection the responses arrived on.
    pub sender: Option<SenderHandle>,
}

impl Response {
    fn none() -> Self {
        Self {
            result: ResponseResult::NoResponse,
            packages: Vec::new(),
            sender: None,
        }
    }
}

#[derive(Debug)]
struct ResponseSlot {
    result: ResponseResult,
    packages: Vec<Arc<Package>>,
    sender: Option<SenderHandle>,
}

#[derive(Debug)]
pub(crate) struct JobInner {
    package: Arc<Package>,
    send: watch::Sender<SendResult>,
    arrived: watch::Sender<ResponseResult>,
    slot: Mutex<ResponseSlot>,
    send_waiters: AtomicUsize,
    response_waiters: AtomicUsize,
}

/// Handle on one submitted package.
///
/// Cheap to clone; all clones observe the same job.
#[derive(Debug, Clone)]
pub struct SendJob {
    inner: Arc<JobInner>,
}

impl SendJob {
    pub(crate) fn new(package: Arc<Package>) -> Self {
        let (send, _) = watch::channel(SendResult::SendPended);
        let (arrived, _) = watch::channel(ResponseResult::NoResponse);
        Self {
            inner: Arc::new(JobInner {
                package,
                send,
                arrived,
                slot: Mutex::new(ResponseSlot {
                    result: ResponseResult::NoResponse,
                    packages: Vec::new(),
                    sender: None,
                }),
                send_waiters: AtomicUsize::new(0),
                response_waiters: AtomicUsize::new(0),
            }),
        }
    }

    /// A job that failed before reaching any link.
    pub(crate) fn failed(package: Arc<Package>) -> Self {
        let job = Self::new(package);
        job.fail();
        job
    }

    /// Correlation uuid, equal to the package uuid.
    pub fn job_uuid(&self) -> Uuid {
        self.inner.package.uuid()
    }

    /// The package this job sends.
    pub fn package(&self) -> &Arc<Package> {
        &self.inner.package
    }

    /// Non-blocking snapshot of the send half.
    pub fn send_result(&self) -> SendResult {
        *self.inner.send.borrow()
    }

    /// Wait until the send half leaves `SendPended`.
    ///
    /// On timeout the pending state is returned unchanged.
    pub async fn wait_for_send(&self, timeout: Option<Duration>) -> SendResult {
        let _guard = WaiterGuard::enter(&self.inner.send_waiters);
        let mut rx = self.inner.send.subscribe();
        let wait = rx.wait_for(|r| *r != SendResult::SendPended);
        let outcome = match timeout {
            Some(t) => tokio::time::timeout(t, wait).await.ok(),
            None => Some(wait.await),
        };
        match outcome {
            Some(Ok(result)) => *result,
            _ => self.send_result(),
        }
    }

    /// Wait until a response arrives or the link dies.
    ///
    /// Returns `NoResponse` on timeout.
    pub async fn wait_for_response(&self, timeout: Option<Duration>) -> ResponseResult {
        let _guard = WaiterGuard::enter(&self.inner.response_waiters);
        let mut rx = self.inner.arrived.subscribe();
        let wait = rx.wait_for(|r| *r != ResponseResult::NoResponse);
        let outcome = match timeout {
            Some(t) => tokio::time::timeout(t, wait).await.ok(),
            None => Some(wait.await),
        };
        match outcome {
            Some(Ok(result)) => *result,
            _ => ResponseResult::NoResponse,
        }
    }

    /// Claim accumulated responses. Later callers get `NoResponse` until
    /// another response arrives.
    pub fn take_response(&self) -> Response {
        let mut slot = self.lock_slot();
        match slot.result {
            ResponseResult::NoResponse => Response::none(),
            ResponseResult::Fail => Response {
                result: ResponseResult::Fail,
                packages: Vec::new(),
                sender: slot.sender.clone(),
            },
            ResponseResult::Success => {
                slot.result = ResponseResult::NoResponse;
                Response {
                    result: ResponseResult::Success,
                    packages: std::mem::take(&mut slot.packages),
                    sender: slot.sender.take(),
                }
            }
        }
    }

    /// Number of tasks currently inside [`SendJob::wait_for_response`].
    pub fn response_waiters(&self) -> usize {
        self.inner.response_waiters.load(Ordering::Acquire)
    }

    /// Number of tasks currently inside [`SendJob::wait_for_send`].
    pub fn send_waiters(&self) -> usize {
        self.inner.send_waiters.load(Ordering::Acquire)
    }

    pub(crate) fn set_send_result(&self, result: SendResult) {
        self.inner.send.send_if_modified(|current| {
            if *current == SendResult::SendPended {
                *current = result;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn complete_response(&self, package: Arc<Package>, sender: SenderHandle) {
        {
            let mut slot = self.lock_slot();
            slot.result = ResponseResult::Success;
            slot.packages.push(package);
            slot.sender = Some(sender);
        }
        self.inner.arrived.send_replace(ResponseResult::Success);
    }

    /// Resolve every half that is still open to `Fail`.
    ///
    /// A job that already got its response keeps it, taken or not.
    pub(crate) fn fail(&self) {
        self.set_send_result(SendResult::Fail);
        {
            let mut slot = self.lock_slot();
            let arrived = *self.inner.arrived.borrow() != ResponseResult::NoResponse;
            if !arrived && slot.result == ResponseResult::NoResponse && slot.packages.is_empty() {
                slot.result = ResponseResult::Fail;
            }
        }
        self.inner.arrived.send_if_modified(|current| {
            if *current == ResponseResult::NoResponse {
                *current = ResponseResult::Fail;
                true
            } else {
                false
            }
        });
    }

    fn lock_slot(&self) -> MutexGuard<'_, ResponseSlot> {
        self.inner.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn downgrade(&self) -> Weak<JobInner> {
        Arc::downgrade(&self.inner)
    }
}

/// Resubmit `package` while the queue refuses it, as `policy` allows.
///
/// Returns the job of the last attempt.
pub(crate) async fn submit_with_retry<F>(
    package: Package,
    policy: SendRetryPolicy,
    mut submit: F,
) -> SendJob
where
    F: FnMut(Package) -> SendJob,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let job = submit(package.clone());
        if job.send_result() != SendResult::SendQueueIsFull || attempt >= attempts {
            return job;
        }
        tracing::debug!(
            "Send queue full for {}, attempt {}/{}",
            package.uuid(),
            attempt,
            attempts
        );
        attempt += 1;
        tokio::time::sleep(policy.interval).await;
    }
}

/// Counts a waiter for as long as it is alive.
struct WaiterGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> WaiterGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Jobs of one link, keyed by package uuid.
///
/// Holds weak references only: once every caller dropped a job, a late
/// response is no longer correlated and reaches the observer as a plain
/// package.
#[derive(Debug, Default)]
pub(crate) struct JobTable {
    jobs: Mutex<HashMap<Uuid, Weak<JobInner>>>,
}

/// Prune dead entries once the table grows past this size.
const PRUNE_THRESHOLD: usize = 256;

impl JobTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Weak<JobInner>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, job: &SendJob) {
        let mut jobs = self.lock();
        if jobs.len() >= PRUNE_THRESHOLD {
            jobs.retain(|_, weak| weak.strong_count() > 0);
        }
        jobs.insert(job.job_uuid(), job.downgrade());
    }

    /// Job waiting for a response to `request_uuid`.
    pub(crate) fn find(&self, request_uuid: &Uuid) -> Option<SendJob> {
        if request_uuid.is_nil() {
            return None;
        }
        let mut jobs = self.lock();
        match jobs.get(request_uuid).and_then(Weak::upgrade) {
            Some(inner) => Some(SendJob { inner }),
            None => {
                jobs.remove(request_uuid);
                None
            }
        }
    }

    /// Fail every live job and empty the table.
    pub(crate) fn fail_all(&self) {
        let drained: Vec<Weak<JobInner>> = self.lock().drain().map(|(_, w)| w).collect();
        for weak in drained {
            if let Some(inner) = weak.upgrade() {
                SendJob { inner }.fail();
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> SendJob {
        SendJob::new(Arc::new(Package::create_instance(1, 0)))
    }

    fn response_to(job: &SendJob) -> Arc<Package> {
        Arc::new(Package::create_response(2, 0, job.package()))
    }

    #[test]
    fn test_job_uuid_matches_package() {
        let job = job();
        assert_eq!(job.job_uuid(), job.package().uuid());
        assert_eq!(job.send_result(), SendResult::SendPended);
    }

    #[tokio::test]
    async fn test_wait_for_send_timeout_stays_pended() {
        let job = job();
        let result = job.wait_for_send(Some(Duration::from_millis(20))).await;
        assert_eq!(result, SendResult::SendPended);
    }

    #[tokio::test]
    async fn test_wait_for_send_wakes_on_result() {
        let job = job();
        let waiter = job.clone();
        let task = tokio::spawn(async move { waiter.wait_for_send(None).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        job.set_send_result(SendResult::Success);

        assert_eq!(task.await.unwrap(), SendResult::Success);
    }

    #[test]
    fn test_send_result_is_set_once() {
        let job = job();
        job.set_send_result(SendResult::SendQueueIsFull);
        job.set_send_result(SendResult::Success);
        assert_eq!(job.send_result(), SendResult::SendQueueIsFull);
    }

    #[tokio::test]
    async fn test_wait_for_response_timeout() {
        let job = job();
        let result = job.wait_for_response(Some(Duration::from_millis(20))).await;
        assert_eq!(result, ResponseResult::NoResponse);
        assert_eq!(job.response_waiters(), 0);
    }

    #[tokio::test]
    async fn test_take_response_once() {
        let job = job();
        let handle = SenderHandle::generate();
        job.complete_response(response_to(&job), handle.clone());

        assert_eq!(
            job.wait_for_response(Some(Duration::from_secs(1))).await,
            ResponseResult::Success
        );

        let first = job.take_response();
        assert_eq!(first.result, ResponseResult::Success);
        assert_eq!(first.packages.len(), 1);
        assert_eq!(first.sender, Some(handle));

        let second = job.take_response();
        assert_eq!(second.result, ResponseResult::NoResponse);
        assert!(second.packages.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_takers_single_winner() {
        let job = job();
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let job = job.clone();
            tasks.push(tokio::spawn(async move {
                let arrived = job.wait_for_response(Some(Duration::from_secs(5))).await;
                (arrived, job.take_response().result)
            }));
        }

        while job.response_waiters() < 10 {
            tokio::task::yield_now().await;
        }
        job.complete_response(response_to(&job), SenderHandle::generate());

        let mut winners = 0;
        for task in tasks {
            let (arrived, taken) = task.await.unwrap();
            assert_eq!(arrived, ResponseResult::Success);
            if taken == ResponseResult::Success {
                winners += 1;
            } else {
                assert_eq!(taken, ResponseResult::NoResponse);
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_fail_resolves_both_halves() {
        let job = job();
        job.fail();
        assert_eq!(job.send_result(), SendResult::Fail);
        assert_eq!(job.wait_for_response(None).await, ResponseResult::Fail);
        assert_eq!(job.take_response().result, ResponseResult::Fail);
    }

    #[tokio::test]
    async fn test_fail_after_taken_response_stays_no_response() {
        let job = job();
        job.complete_response(response_to(&job), SenderHandle::generate());
        assert_eq!(job.take_response().result, ResponseResult::Success);

        // Link dies after the response was claimed
        job.fail();

        assert_eq!(job.wait_for_response(None).await, ResponseResult::Success);
        let late = job.take_response();
        assert_eq!(late.result, ResponseResult::NoResponse);
        assert!(late.packages.is_empty());
    }

    #[test]
    fn test_fail_keeps_untaken_response() {
        let job = job();
        job.complete_response(response_to(&job), SenderHandle::generate());
        job.fail();
        assert_eq!(job.take_response().result, ResponseResult::Success);
    }

    #[test]
    fn test_fail_keeps_successful_send() {
        let job = job();
        job.set_send_result(SendResult::Success);
        job.fail();
        assert_eq!(job.send_result(), SendResult::Success);
    }

    #[test]
    fn test_table_finds_live_jobs_only() {
        let table = JobTable::new();
        let kept = job();
        let dropped = job();
        table.register(&kept);
        table.register(&dropped);
        let dropped_uuid = dropped.job_uuid();
        drop(dropped);

        assert!(table.find(&kept.job_uuid()).is_some());
        assert!(table.find(&dropped_uuid).is_none());
        assert!(table.find(&Uuid::nil()).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_table_fail_all() {
        let table = JobTable::new();
        let job = job();
        table.register(&job);

        table.fail_all();

        assert_eq!(job.send_result(), SendResult::Fail);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn test_submit_with_retry_until_accepted() {
        let policy = SendRetryPolicy {
            max_attempts: 5,
            interval: Duration::from_millis(1),
        };
        let mut calls = 0;
        let job = submit_with_retry(Package::create_instance(1, 0), policy, |package| {
            calls += 1;
            let job = SendJob::new(Arc::new(package));
            if calls < 3 {
                job.set_send_result(SendResult::SendQueueIsFull);
            }
            job
        })
        .await;

        assert_eq!(calls, 3);
        assert_eq!(job.send_result(), SendResult::SendPended);
    }

    #[tokio::test]
    async fn test_submit_with_retry_gives_up() {
        let policy = SendRetryPolicy {
            max_attempts: 4,
            interval: Duration::from_millis(1),
        };
        let mut calls = 0;
        let job = submit_with_retry(Package::create_instance(1, 0), policy, |package| {
            calls += 1;
            let job = SendJob::new(Arc::new(package));
            job.set_send_result(SendResult::SendQueueIsFull);
            job
        })
        .await;

        assert_eq!(calls, 4);
        assert_eq!(job.send_result(), SendResult::SendQueueIsFull);
    }
}
