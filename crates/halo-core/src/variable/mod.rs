//! Reactive value cells fed by external producers.
//!
//! A [`Variable`] holds one value and a list of subscribers. Two kinds of
//! producer can drive it, alone or together:
//!
//! - **poll**: run a command or async callback now and then every interval
//! - **listen**: spawn a long-running command and map each stdout line
//!
//! Both write into the same cell. Every update notifies every subscriber
//! synchronously, outside the internal lock, so a subscriber may call back
//! into the variable (including `dispose`).
//!
//! # Lifecycle
//!
//! Producer tasks only hold a weak reference. Dropping the last `Variable`
//! handle, or calling [`Variable::dispose`], stops both producers and kills
//! any listener subprocess.

mod listen;
mod poll;

pub use listen::ListenConfig;
pub use poll::{PollConfig, PollFn, PollProducer, Transform};

use crate::platform::{kill_process, kill_process_group};
use crate::{HaloError, Result};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Which producer a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProducerKind {
    Poll,
    Listen,
}

impl fmt::Display for ProducerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProducerKind::Poll => f.write_str("poll"),
            ProducerKind::Listen => f.write_str("listen"),
        }
    }
}

/// What a subscriber is told.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification<T> {
    /// The value was replaced. Sent even when the new value equals the old.
    Changed(T),
    /// A producer tick or the listener failed. The value is unchanged.
    ProducerFailed {
        producer: ProducerKind,
        message: String,
    },
}

/// Handle returned by [`Variable::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Subscriber<T> = Arc<dyn Fn(&Notification<T>) + Send + Sync>;

/// A running producer. Dropping it signals the task to stop.
struct ProducerTask {
    generation: u64,
    stop: watch::Sender<bool>,
    pid: Option<u32>,
    _handle: JoinHandle<()>,
}

impl ProducerTask {
    /// Forget the child PID once the task has reaped it itself.
    fn detach(mut self) {
        self.pid = None;
    }
}

impl Drop for ProducerTask {
    fn drop(&mut self) {
        self.stop.send_replace(true);
        if let Some(pid) = self.pid.take() {
            // The task reaps the child; killing here makes teardown immediate.
            // The listener leads its own group, so this also takes its children.
            if !kill_process_group(pid) {
                kill_process(pid);
            }
        }
    }
}

pub(crate) struct Inner<T> {
    value: T,
    subscribers: Vec<(SubscriptionId, Subscriber<T>)>,
    next_subscription: u64,
    next_generation: u64,
    poll: Option<PollConfig<T>>,
    poll_task: Option<ProducerTask>,
    listen: Option<ListenConfig<T>>,
    listen_task: Option<ProducerTask>,
    disposed: bool,
}

impl<T> Inner<T> {
    fn task(&self, kind: ProducerKind) -> Option<&ProducerTask> {
        match kind {
            ProducerKind::Poll => self.poll_task.as_ref(),
            ProducerKind::Listen => self.listen_task.as_ref(),
        }
    }

    fn is_current(&self, kind: ProducerKind, generation: u64) -> bool {
        !self.disposed && self.task(kind).map(|t| t.generation) == Some(generation)
    }
}

/// Lock the cell, recovering from a subscriber that panicked elsewhere.
fn lock<T>(inner: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Deliver `notification` to a snapshot of the subscribers.
///
/// Runs without the lock held. Delivery stops early if a subscriber
/// disposes the variable, and skips anyone unsubscribed along the way.
fn notify<T>(inner: &Mutex<Inner<T>>, notification: &Notification<T>) {
    let subscribers: Vec<(SubscriptionId, Subscriber<T>)> = lock(inner).subscribers.clone();

    for (id, subscriber) in subscribers {
        {
            let guard = lock(inner);
            if guard.disposed {
                break;
            }
            if !guard.subscribers.iter().any(|(sid, _)| *sid == id) {
                continue;
            }
        }
        subscriber(notification);
    }
}

/// Current value, if the producer is still the live one.
pub(crate) fn snapshot<T: Clone>(
    weak: &Weak<Mutex<Inner<T>>>,
    kind: ProducerKind,
    generation: u64,
) -> Option<T> {
    let inner = weak.upgrade()?;
    let guard = lock(&inner);
    guard
        .is_current(kind, generation)
        .then(|| guard.value.clone())
}

/// Store a produced value and notify. Returns `false` once the producer
/// should stop.
pub(crate) fn apply<T: Clone>(
    weak: &Weak<Mutex<Inner<T>>>,
    kind: ProducerKind,
    generation: u64,
    value: T,
) -> bool {
    let Some(inner) = weak.upgrade() else {
        return false;
    };
    {
        let mut guard = lock(&inner);
        if !guard.is_current(kind, generation) {
            return false;
        }
        guard.value = value.clone();
    }
    notify(&inner, &Notification::Changed(value));
    true
}

/// Report a producer failure. Returns `false` once the producer should stop.
pub(crate) fn fail<T>(
    weak: &Weak<Mutex<Inner<T>>>,
    kind: ProducerKind,
    generation: u64,
    message: String,
) -> bool {
    let Some(inner) = weak.upgrade() else {
        return false;
    };
    if !lock(&inner).is_current(kind, generation) {
        return false;
    }
    warn!("{} producer failed: {}", kind, message);
    notify(
        &inner,
        &Notification::ProducerFailed {
            producer: kind,
            message,
        },
    );
    true
}

/// Drop the task record after the task ended on its own.
pub(crate) fn finished<T>(weak: &Weak<Mutex<Inner<T>>>, kind: ProducerKind, generation: u64) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let task = {
        let mut guard = lock(&inner);
        if !guard.is_current(kind, generation) {
            return;
        }
        match kind {
            ProducerKind::Poll => guard.poll_task.take(),
            ProducerKind::Listen => guard.listen_task.take(),
        }
    };
    if let Some(task) = task {
        task.detach();
    }
}

/// Resolves once the stop flag is raised or the owning task record is gone.
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn require_runtime() -> Result<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current().map_err(|e| HaloError::Config {
        message: format!("variable producers need a tokio runtime: {}", e),
    })
}

/// An observable value cell.
///
/// Cloning yields another handle to the same cell.
pub struct Variable<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Variable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Variable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = lock(&self.inner);
        f.debug_struct("Variable")
            .field("value", &guard.value)
            .field("polling", &guard.poll_task.is_some())
            .field("listening", &guard.listen_task.is_some())
            .field("disposed", &guard.disposed)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Variable<T> {
    /// A cell with no producers.
    pub fn new(initial: T) -> Self {
        Self::from_parts(initial, None, None)
    }

    pub fn builder(initial: T) -> VariableBuilder<T> {
        VariableBuilder {
            initial,
            poll: None,
            listen: None,
        }
    }

    fn from_parts(initial: T, poll: Option<PollConfig<T>>, listen: Option<ListenConfig<T>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                value: initial,
                subscribers: Vec::new(),
                next_subscription: 0,
                next_generation: 0,
                poll,
                poll_task: None,
                listen,
                listen_task: None,
                disposed: false,
            })),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, Inner<T>>> {
        let guard = lock(&self.inner);
        if guard.disposed {
            return Err(HaloError::UseAfterDispose);
        }
        Ok(guard)
    }

    pub fn get(&self) -> Result<T> {
        Ok(self.guard()?.value.clone())
    }

    /// Replace the value and notify every subscriber.
    pub fn set(&self, value: T) -> Result<()> {
        self.guard()?.value = value.clone();
        notify(&self.inner, &Notification::Changed(value));
        Ok(())
    }

    pub fn subscribe<F>(&self, callback: F) -> Result<SubscriptionId>
    where
        F: Fn(&Notification<T>) + Send + Sync + 'static,
    {
        let mut guard = self.guard()?;
        let id = SubscriptionId(guard.next_subscription);
        guard.next_subscription += 1;
        guard.subscribers.push((id, Arc::new(callback)));
        Ok(id)
    }

    /// Remove a subscriber. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = lock(&self.inner);
        let before = guard.subscribers.len();
        guard.subscribers.retain(|(sid, _)| *sid != id);
        guard.subscribers.len() != before
    }

    /// Start the poll producer. No-op if it is already running.
    pub fn start_poll(&self) -> Result<()> {
        let runtime = require_runtime()?;
        let mut guard = self.guard()?;
        if guard.poll_task.is_some() {
            return Ok(());
        }
        let config = guard.poll.clone().ok_or_else(|| HaloError::Config {
            message: "variable has no poll producer configured".to_string(),
        })?;

        let generation = guard.next_generation;
        guard.next_generation += 1;
        let (stop, stop_rx) = watch::channel(false);
        let weak = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(poll::run(weak, generation, config, stop_rx));

        guard.poll_task = Some(ProducerTask {
            generation,
            stop,
            pid: None,
            _handle: handle,
        });
        debug!("Poll producer started");
        Ok(())
    }

    /// Stop the poll producer. No-op if it is not running.
    pub fn stop_poll(&self) {
        let task = lock(&self.inner).poll_task.take();
        if task.is_some() {
            debug!("Poll producer stopped");
        }
    }

    /// Spawn the listener subprocess. No-op if it is already running.
    pub fn start_listen(&self) -> Result<()> {
        let runtime = require_runtime()?;
        let mut guard = self.guard()?;
        if guard.listen_task.is_some() {
            return Ok(());
        }
        let config = guard.listen.clone().ok_or_else(|| HaloError::Config {
            message: "variable has no listen producer configured".to_string(),
        })?;

        let child = crate::exec::spawn_lines(config.argv.as_slice())?;
        let pid = child.id();

        let generation = guard.next_generation;
        guard.next_generation += 1;
        let (stop, stop_rx) = watch::channel(false);
        let weak = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(listen::run(weak, generation, config, child, stop_rx));

        guard.listen_task = Some(ProducerTask {
            generation,
            stop,
            pid,
            _handle: handle,
        });
        debug!("Listen producer started (PID {:?})", pid);
        Ok(())
    }

    /// Kill the listener subprocess. No-op if it is not running.
    pub fn stop_listen(&self) {
        let task = lock(&self.inner).listen_task.take();
        if task.is_some() {
            debug!("Listen producer stopped");
        }
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.inner).poll_task.is_some()
    }

    pub fn is_listening(&self) -> bool {
        lock(&self.inner).listen_task.is_some()
    }

    /// PID of the running listener subprocess.
    pub fn listen_pid(&self) -> Option<u32> {
        lock(&self.inner).listen_task.as_ref().and_then(|t| t.pid)
    }

    /// Stop both producers for good and drop every subscriber.
    ///
    /// Idempotent. Safe to call from inside a subscriber.
    pub fn dispose(&self) {
        let (poll_task, listen_task, subscribers) = {
            let mut guard = lock(&self.inner);
            if guard.disposed {
                return;
            }
            guard.disposed = true;
            (
                guard.poll_task.take(),
                guard.listen_task.take(),
                std::mem::take(&mut guard.subscribers),
            )
        };
        // Dropped outside the lock: subscriber captures may hold handles.
        drop(poll_task);
        drop(listen_task);
        drop(subscribers);
        debug!("Variable disposed");
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.inner).disposed
    }
}

/// Configures producers before the variable starts.
pub struct VariableBuilder<T> {
    initial: T,
    poll: Option<PollConfig<T>>,
    listen: Option<ListenConfig<T>>,
}

impl<T: Clone + Send + Sync + 'static> VariableBuilder<T> {
    /// Poll by running `argv` and mapping its trimmed stdout.
    pub fn poll_command<F>(mut self, interval: Duration, argv: Vec<String>, transform: F) -> Self
    where
        F: Fn(&str, &T) -> T + Send + Sync + 'static,
    {
        self.poll = Some(PollConfig {
            interval,
            producer: PollProducer::Command {
                argv,
                transform: Arc::new(transform),
            },
        });
        self
    }

    /// Poll by awaiting `callback` with the current value.
    pub fn poll_with<F, Fut, E>(mut self, interval: Duration, callback: F) -> Self
    where
        F: Fn(&T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: fmt::Display + 'static,
    {
        self.poll = Some(PollConfig {
            interval,
            producer: PollProducer::callback(callback),
        });
        self
    }

    /// Listen to `argv`, mapping each stdout line through `transform`.
    pub fn listen<F>(mut self, argv: Vec<String>, transform: F) -> Self
    where
        F: Fn(&str, &T) -> T + Send + Sync + 'static,
    {
        self.listen = Some(ListenConfig {
            argv,
            transform: Arc::new(transform),
        });
        self
    }

    /// Validate, create the variable and start the configured producers.
    pub fn build(self) -> Result<Variable<T>> {
        if let Some(poll) = &self.poll {
            poll.validate()?;
        }
        if let Some(listen) = &self.listen {
            listen.validate()?;
        }

        let start_poll = self.poll.is_some();
        let start_listen = self.listen.is_some();
        let variable = Variable::from_parts(self.initial, self.poll, self.listen);

        if start_poll {
            variable.start_poll()?;
        }
        if start_listen {
            variable.start_listen()?;
        }

        Ok(variable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{is_process_alive, wait_for_exit};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn collect<T: Clone + Send + Sync + 'static>(
        variable: &Variable<T>,
    ) -> Arc<Mutex<Vec<Notification<T>>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        variable
            .subscribe(move |n| sink.lock().unwrap().push(n.clone()))
            .unwrap();
        seen
    }

    fn changed<T: Clone>(seen: &Mutex<Vec<Notification<T>>>) -> Vec<T> {
        seen.lock()
            .unwrap()
            .iter()
            .filter_map(|n| match n {
                Notification::Changed(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_set_notifies_every_subscriber() {
        let variable = Variable::new(0);
        let a = collect(&variable);
        let b = collect(&variable);

        variable.set(1).unwrap();
        variable.set(1).unwrap();

        assert_eq!(variable.get().unwrap(), 1);
        assert_eq!(changed(&a), vec![1, 1]);
        assert_eq!(changed(&b), vec![1, 1]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let variable = Variable::new("a".to_string());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = variable
            .subscribe(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        variable.set("b".into()).unwrap();
        assert!(variable.unsubscribe(id));
        assert!(!variable.unsubscribe(id));
        variable.set("c".into()).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_use_after_dispose() {
        let variable = Variable::new(5);
        variable.dispose();
        variable.dispose();

        assert!(variable.is_disposed());
        assert!(matches!(variable.get(), Err(HaloError::UseAfterDispose)));
        assert!(matches!(variable.set(6), Err(HaloError::UseAfterDispose)));
        assert!(matches!(
            variable.subscribe(|_| {}),
            Err(HaloError::UseAfterDispose)
        ));
    }

    #[test]
    fn test_dispose_from_inside_subscriber() {
        let variable = Variable::new(0);
        let handle = variable.clone();
        variable
            .subscribe(move |_| {
                handle.dispose();
            })
            .unwrap();
        let later = collect(&variable);

        variable.set(1).unwrap();

        assert!(variable.is_disposed());
        assert!(changed(&later).is_empty());
    }

    #[test]
    fn test_unsubscribed_mid_delivery_is_skipped() {
        let variable = Variable::new(0);
        let victim = Arc::new(Mutex::new(None));
        let handle = variable.clone();
        let target = victim.clone();
        variable
            .subscribe(move |_| {
                if let Some(id) = target.lock().unwrap().take() {
                    handle.unsubscribe(id);
                }
            })
            .unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = variable
            .subscribe(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        *victim.lock().unwrap() = Some(id);

        variable.set(1).unwrap();
        variable.set(2).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_set_from_inside_subscriber() {
        let variable = Variable::new(0);
        let handle = variable.clone();
        variable
            .subscribe(move |n| {
                if let Notification::Changed(v) = n {
                    if *v < 3 {
                        handle.set(v + 1).unwrap();
                    }
                }
            })
            .unwrap();

        variable.set(1).unwrap();
        assert_eq!(variable.get().unwrap(), 3);
    }

    #[test]
    fn test_start_without_runtime_is_config_error() {
        let variable = Variable::new(0);
        assert!(matches!(variable.start_poll(), Err(HaloError::Config { .. })));
    }

    #[tokio::test]
    async fn test_start_without_producer_is_config_error() {
        let variable = Variable::new(0);
        assert!(matches!(variable.start_poll(), Err(HaloError::Config { .. })));
        assert!(matches!(variable.start_listen(), Err(HaloError::Config { .. })));
    }

    #[tokio::test]
    async fn test_start_after_dispose_fails() {
        let variable = Variable::builder(0)
            .poll_with(Duration::from_secs(60), |v: &i32| {
                let next = v + 1;
                async move { Ok::<_, String>(next) }
            })
            .build()
            .unwrap();
        variable.dispose();

        assert!(!variable.is_polling());
        assert!(matches!(variable.start_poll(), Err(HaloError::UseAfterDispose)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_listen_after_dispose_fails() {
        let variable = Variable::builder(String::new())
            .listen(vec!["sleep".into(), "30".into()], |line: &str, _: &String| {
                line.to_string()
            })
            .build()
            .unwrap();
        variable.dispose();

        assert!(!variable.is_listening());
        assert!(matches!(
            variable.start_listen(),
            Err(HaloError::UseAfterDispose)
        ));
        assert_eq!(variable.listen_pid(), None);
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let result = Variable::builder(0)
            .poll_with(Duration::ZERO, |v: &i32| {
                let v = *v;
                async move { Ok::<_, String>(v) }
            })
            .build();
        assert!(matches!(result, Err(HaloError::Validation { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_counts_every_interval() {
        let variable = Variable::builder(0u32)
            .poll_with(Duration::from_millis(1000), |v: &u32| {
                let next = v + 1;
                async move { Ok::<_, String>(next) }
            })
            .build()
            .unwrap();
        let seen = collect(&variable);

        tokio::time::sleep(Duration::from_millis(3050)).await;
        variable.stop_poll();

        let values = changed(&seen);
        assert!(values.len() >= 3, "got {:?}", values);
        assert!(variable.get().unwrap() >= 3);
        assert_eq!(values.last().copied(), Some(variable.get().unwrap()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_start_stop_is_idempotent() {
        let variable = Variable::builder(0u32)
            .poll_with(Duration::from_millis(20), |v: &u32| {
                let next = v + 1;
                async move { Ok::<_, String>(next) }
            })
            .build()
            .unwrap();

        variable.start_poll().unwrap();
        assert!(variable.is_polling());
        variable.stop_poll();
        variable.stop_poll();
        assert!(!variable.is_polling());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let frozen = variable.get().unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(variable.get().unwrap(), frozen);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_failure_notifies_and_keeps_polling() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let variable = Variable::builder(0usize)
            .poll_with(Duration::from_millis(30), move |_: &usize| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err("first tick fails".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .build()
            .unwrap();
        let seen = collect(&variable);

        tokio::time::sleep(Duration::from_millis(200)).await;
        variable.dispose();

        let notes = seen.lock().unwrap().clone();
        assert!(notes.iter().any(|n| matches!(
            n,
            Notification::ProducerFailed { producer: ProducerKind::Poll, .. }
        )));
        assert!(notes.iter().any(|n| matches!(n, Notification::Changed(_))));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_command_uses_transform() {
        let variable = Variable::builder(String::new())
            .poll_command(
                Duration::from_secs(60),
                vec!["echo".into(), "42".into()],
                |out: &str, prev: &String| format!("{}{}", prev, out),
            )
            .build()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(variable.get().unwrap(), "42");
        variable.dispose();
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_listen_maps_each_line() {
        let variable = Variable::builder(0i64)
            .listen(
                vec!["printf".into(), "1\\n2\\n3\\n".into()],
                |line: &str, prev: &i64| line.trim().parse().unwrap_or(*prev),
            )
            .build()
            .unwrap();
        let seen = collect(&variable);

        for _ in 0..100 {
            if !variable.is_listening() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(!variable.is_listening());
        assert_eq!(variable.get().unwrap(), 3);
        // The subscription may have missed early lines; order is preserved.
        let values = changed(&seen);
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        assert!(!seen
            .lock()
            .unwrap()
            .iter()
            .any(|n| matches!(n, Notification::ProducerFailed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_listen_nonzero_exit_notifies_failure() {
        let variable = Variable::builder(0i64)
            .listen(
                vec!["sh".into(), "-c".into(), "sleep 0.2; echo 5; exit 2".into()],
                |line: &str, prev: &i64| line.trim().parse().unwrap_or(*prev),
            )
            .build()
            .unwrap();
        let seen = collect(&variable);

        for _ in 0..100 {
            if !variable.is_listening() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(variable.get().unwrap(), 5);
        let notes = seen.lock().unwrap().clone();
        assert!(matches!(
            notes.last(),
            Some(Notification::ProducerFailed { producer: ProducerKind::Listen, .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispose_kills_listener() {
        let variable = Variable::builder(String::new())
            .listen(vec!["sleep".into(), "30".into()], |line: &str, _: &String| {
                line.to_string()
            })
            .build()
            .unwrap();

        let pid = variable.listen_pid().unwrap();
        assert!(is_process_alive(pid));

        variable.dispose();

        assert!(wait_for_exit(pid, Duration::from_secs(1), Duration::from_millis(10)).await);
        assert!(!variable.is_listening());
        assert_eq!(variable.listen_pid(), None);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_listen_twice_keeps_one_child() {
        let variable = Variable::builder(String::new())
            .listen(vec!["sleep".into(), "30".into()], |line: &str, _: &String| {
                line.to_string()
            })
            .build()
            .unwrap();
        let pid = variable.listen_pid().unwrap();

        variable.start_listen().unwrap();
        variable.start_listen().unwrap();

        assert_eq!(variable.listen_pid(), Some(pid));
        assert!(is_process_alive(pid));
        variable.dispose();
        assert!(wait_for_exit(pid, Duration::from_secs(1), Duration::from_millis(10)).await);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispose_kills_listener_descendants() {
        // The shell reports its background child's PID, then waits on it.
        let variable = Variable::builder(0u32)
            .listen(
                vec!["sh".into(), "-c".into(), "sleep 30 & echo $!; wait".into()],
                |line: &str, prev: &u32| line.trim().parse().unwrap_or(*prev),
            )
            .build()
            .unwrap();
        let shell = variable.listen_pid().unwrap();

        for _ in 0..100 {
            if variable.get().unwrap() != 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let grandchild = variable.get().unwrap();
        assert_ne!(grandchild, 0);
        assert!(is_process_alive(grandchild));

        variable.dispose();

        assert!(wait_for_exit(shell, Duration::from_secs(2), Duration::from_millis(10)).await);
        assert!(
            wait_for_exit(grandchild, Duration::from_secs(2), Duration::from_millis(10)).await
        );
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_listen_kills_child_without_failure() {
        let variable = Variable::builder(String::new())
            .listen(vec!["sleep".into(), "30".into()], |line: &str, _: &String| {
                line.to_string()
            })
            .build()
            .unwrap();
        let seen = collect(&variable);
        let pid = variable.listen_pid().unwrap();

        variable.stop_listen();
        variable.stop_listen();

        assert!(wait_for_exit(pid, Duration::from_secs(1), Duration::from_millis(10)).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(seen.lock().unwrap().is_empty());
        assert!(!variable.is_disposed());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_dropping_last_handle_kills_listener() {
        let variable = Variable::builder(String::new())
            .listen(vec!["sleep".into(), "30".into()], |line: &str, _: &String| {
                line.to_string()
            })
            .build()
            .unwrap();
        let pid = variable.listen_pid().unwrap();

        drop(variable);

        assert!(wait_for_exit(pid, Duration::from_secs(1), Duration::from_millis(10)).await);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_poll_and_listen_share_the_cell() {
        let variable = Variable::builder(0i64)
            .poll_with(Duration::from_secs(60), |_: &i64| async {
                Ok::<_, String>(100)
            })
            .listen(
                vec!["sh".into(), "-c".into(), "sleep 0.3; echo 7".into()],
                |line: &str, prev: &i64| line.trim().parse().unwrap_or(*prev),
            )
            .build()
            .unwrap();

        assert!(variable.is_polling());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(variable.get().unwrap(), 100);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(variable.get().unwrap(), 7);
        variable.dispose();
    }
}
