//! Drives scheduled messages through their lifecycle.
//!
//! ```text
//! Queued -> Scheduled -> Transmitting... -> Transmitted
//!    \          \                \-> Failed
//!     \-> Missed \-> Missed
//! ```
//!
//! The store is the source of truth. A poll loop picks up `Queued`
//! messages and hands their deadlines to a single timer thread; when a
//! deadline passes the message is reloaded and fired. A message requeued
//! while armed is scheduled again as soon as its timer elapses. On startup
//! and on shutdown messages left `Scheduled` or `Transmitting...` are put
//! back to `Queued`, or to `Missed` once their grace period has passed.
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{after, bounded, never, select, tick, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::link::{CommandOutcome, LinkError};
use crate::message::{MessageStatus, ScheduledMessage};
use crate::store::{MessageId, MessageStore, StoreError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(90);
pub const DEFAULT_MISFIRE_GRACE: u32 = 30;

/// Sends one frozen beacon frame.
pub trait Transmitter: Send + Sync {
    fn transmit(&self, frame: &[u8]) -> Result<CommandOutcome<()>, LinkError>;
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Seconds after `scheduled_at` a message may still be sent when it
    /// carries no grace of its own.
    pub default_misfire_grace: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            default_misfire_grace: DEFAULT_MISFIRE_GRACE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FireOutcome {
    Transmitted,
    Failed,
    Missed,
    /// Not fired because the stored status did not allow it.
    Skipped(MessageStatus),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub armed: usize,
    pub missed: usize,
    pub already_armed: usize,
    pub errors: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub requeued: usize,
    pub missed: usize,
    pub errors: usize,
}

enum TimerCommand {
    Arm(MessageId, Instant),
    Stop,
}

/// The thread that waits for every armed deadline.
struct TimerThread {
    commands: Sender<TimerCommand>,
    handle: JoinHandle<()>,
}

struct Poller {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn MessageStore>,
    transmitter: Arc<dyn Transmitter>,
    config: SchedulerConfig,
    /// Deadline of every armed message. An entry stays until its timer has
    /// been handled.
    armed: Mutex<HashMap<MessageId, Instant>>,
    timers: Mutex<Option<TimerThread>>,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    poller: Mutex<Option<Poller>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn MessageStore>,
        transmitter: Arc<dyn Transmitter>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                transmitter,
                config,
                armed: Mutex::new(HashMap::new()),
                timers: Mutex::new(None),
            }),
            poller: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Reconcile, arm what is queued and start the poll loop.
    pub fn start(&self) -> Result<ReconcileSummary, StoreError> {
        let mut poller = lock(&self.poller);
        if poller.is_some() {
            warn!("scheduler already running");
            return Ok(ReconcileSummary::default());
        }
        let summary = self.reconcile_on_startup()?;
        self.poll_and_schedule()?;

        let (stop, stop_rx) = bounded::<()>(1);
        let ticker = tick(self.inner.config.poll_interval);
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("scheduler-poll".into())
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        if let Err(e) = inner.poll(Utc::now()) {
                            error!("polling queued messages failed: {}", e);
                        }
                    }
                }
            })?;
        *poller = Some(Poller { stop, handle });
        info!(
            "scheduler started (poll every {:?}, default grace {}s)",
            self.inner.config.poll_interval, self.inner.config.default_misfire_grace
        );
        Ok(summary)
    }

    pub fn reconcile_on_startup(&self) -> Result<ReconcileSummary, StoreError> {
        self.reconcile_at(Utc::now())
    }

    /// Put in-flight messages back to `Queued`, or `Missed` past their grace.
    pub fn reconcile_at(&self, now: DateTime<Utc>) -> Result<ReconcileSummary, StoreError> {
        self.inner.reconcile(now)
    }

    /// Arm a timer for every queued message not armed yet.
    pub fn poll_and_schedule(&self) -> Result<PollSummary, StoreError> {
        self.inner.poll(Utc::now())
    }

    pub fn poll_at(&self, now: DateTime<Utc>) -> Result<PollSummary, StoreError> {
        self.inner.poll(now)
    }

    /// Transmit a `Scheduled` message now, unless it is past its grace.
    pub fn fire(&self, message: ScheduledMessage) -> Result<FireOutcome, StoreError> {
        self.inner.fire(message, Utc::now())
    }

    pub fn armed_count(&self) -> usize {
        lock(&self.inner.armed).len()
    }

    pub fn is_armed(&self, id: MessageId) -> bool {
        lock(&self.inner.armed).contains_key(&id)
    }

    /// Stop polling, cancel every timer and reconcile.
    pub fn shutdown(&self) -> Result<ReconcileSummary, StoreError> {
        if let Some(poller) = lock(&self.poller).take() {
            let _ = poller.stop.send(());
            if poller.handle.join().is_err() {
                error!("poll thread panicked");
            }
        }

        let timers = lock(&self.inner.timers).take();
        if let Some(timers) = timers {
            let _ = timers.commands.send(TimerCommand::Stop);
            if timers.handle.join().is_err() {
                error!("timer thread panicked");
            }
        }
        let cancelled = {
            let mut armed = lock(&self.inner.armed);
            let cancelled = armed.len();
            armed.clear();
            cancelled
        };
        info!("scheduler stopped, {} timers cancelled", cancelled);
        self.reconcile_on_startup()
    }
}

impl Inner {
    fn grace(&self) -> u32 {
        self.config.default_misfire_grace
    }

    fn reconcile(&self, now: DateTime<Utc>) -> Result<ReconcileSummary, StoreError> {
        let mut summary = ReconcileSummary::default();
        for status in [MessageStatus::Scheduled, MessageStatus::Transmitting] {
            for mut message in self.store.find_by_status(status)? {
                let next = message.restart_status(now, self.grace());
                message.status = next;
                match self.store.save(&mut message) {
                    Ok(id) if next == MessageStatus::Missed => {
                        info!("message {} missed its window while the server was down", id);
                        summary.missed += 1;
                    }
                    Ok(id) => {
                        debug!("message {} requeued", id);
                        summary.requeued += 1;
                    }
                    Err(e) => {
                        warn!("could not reconcile message: {}", e);
                        summary.errors += 1;
                    }
                }
            }
        }
        Ok(summary)
    }

    fn poll(self: &Arc<Self>, now: DateTime<Utc>) -> Result<PollSummary, StoreError> {
        let queued = self.store.find_by_status(MessageStatus::Queued)?;
        let mut summary = PollSummary::default();
        let mut armed = lock(&self.armed);
        for message in queued {
            let Some((id, deadline)) = self.schedule(message, now, &mut armed, &mut summary) else {
                continue;
            };
            if let Err(e) = self.arm(id, deadline) {
                error!("could not start timer thread for message {}: {}", id, e);
                armed.remove(&id);
                summary.armed -= 1;
                summary.errors += 1;
                self.requeue(id);
            }
        }
        if summary != PollSummary::default() {
            debug!("poll: {:?}", summary);
        }
        Ok(summary)
    }

    /// Mark one queued message `Scheduled` and record its deadline, or mark
    /// it `Missed` when it is already past its grace period. Returns the
    /// deadline the timer thread still has to be told about.
    fn schedule(
        &self,
        mut message: ScheduledMessage,
        now: DateTime<Utc>,
        armed: &mut HashMap<MessageId, Instant>,
        summary: &mut PollSummary,
    ) -> Option<(MessageId, Instant)> {
        let id = message.id?;
        if armed.contains_key(&id) {
            summary.already_armed += 1;
            return None;
        }
        if message.is_missed_at(now, self.grace()) {
            message.status = MessageStatus::Missed;
            match self.store.save(&mut message) {
                Ok(_) => {
                    info!("message {} is past its grace period, marked missed", id);
                    summary.missed += 1;
                }
                Err(e) => {
                    warn!("could not mark message {} missed: {}", id, e);
                    summary.errors += 1;
                }
            }
            return None;
        }

        message.status = MessageStatus::Scheduled;
        if let Err(e) = self.store.save(&mut message) {
            warn!("could not schedule message {}: {}", id, e);
            summary.errors += 1;
            return None;
        }
        let delay = (message.scheduled_at - now).to_std().unwrap_or(Duration::ZERO);
        let deadline = Instant::now() + delay;
        debug!("message {} armed, fires in {:?}", id, delay);
        armed.insert(id, deadline);
        summary.armed += 1;
        Some((id, deadline))
    }

    fn requeue(&self, id: MessageId) {
        let result = self.store.find_by_id(id).and_then(|mut message| {
            message.status = MessageStatus::Queued;
            self.store.save(&mut message)
        });
        if let Err(e) = result {
            warn!("could not requeue message {}: {}", id, e);
        }
    }

    /// Hand a deadline to the timer thread, starting it on first use.
    fn arm(self: &Arc<Self>, id: MessageId, deadline: Instant) -> std::io::Result<()> {
        let mut timers = lock(&self.timers);
        if let Some(running) = timers.as_ref() {
            if running.commands.send(TimerCommand::Arm(id, deadline)).is_ok() {
                return Ok(());
            }
        }
        let (commands, received) = unbounded();
        let inner = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name("scheduler-timers".into())
            .spawn(move || run_timers(inner, received))?;
        let _ = commands.send(TimerCommand::Arm(id, deadline));
        *timers = Some(TimerThread { commands, handle });
        Ok(())
    }

    /// Handle an elapsed deadline. Returns a new deadline when the message
    /// was requeued while armed and has been scheduled again.
    fn on_deadline(&self, id: MessageId, deadline: Instant) -> Option<(MessageId, Instant)> {
        if lock(&self.armed).get(&id) != Some(&deadline) {
            debug!("timer for message {} cancelled", id);
            return None;
        }
        let message = match self.store.find_by_id(id) {
            Ok(message) => message,
            Err(e) => {
                warn!("cannot fire message {}: {}", id, e);
                lock(&self.armed).remove(&id);
                return None;
            }
        };
        if message.status == MessageStatus::Queued {
            info!("message {} was requeued while armed, scheduling it again", id);
            let mut armed = lock(&self.armed);
            armed.remove(&id);
            let mut summary = PollSummary::default();
            return self.schedule(message, Utc::now(), &mut armed, &mut summary);
        }
        if let Err(e) = self.fire(message, Utc::now()) {
            error!("firing message {} failed: {}", id, e);
        }
        lock(&self.armed).remove(&id);
        None
    }

    fn fire(&self, mut message: ScheduledMessage, now: DateTime<Utc>) -> Result<FireOutcome, StoreError> {
        let label = message
            .id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "(unsaved)".into());
        match message.status {
            MessageStatus::Scheduled => {}
            other => {
                debug!("message {} is {}, not firing", label, other);
                return Ok(FireOutcome::Skipped(other));
            }
        }
        if message.is_missed_at(now, self.grace()) {
            info!("message {} fired past its grace period, marked missed", label);
            message.status = MessageStatus::Missed;
            self.store.save(&mut message)?;
            return Ok(FireOutcome::Missed);
        }

        message.status = MessageStatus::Transmitting;
        let frame = match message.freeze_frame().map(<[u8]>::to_vec) {
            Ok(frame) => frame,
            Err(e) => {
                error!("message {} cannot be encoded: {}", label, e);
                message.status = MessageStatus::Failed;
                self.store.save(&mut message)?;
                return Ok(FireOutcome::Failed);
            }
        };
        self.store.save(&mut message)?;

        let sent = match self.transmitter.transmit(&frame) {
            Ok(CommandOutcome::Acked(())) => true,
            Ok(CommandOutcome::NoResponse { attempts }) => {
                warn!("message {} not acknowledged after {} attempts", label, attempts);
                false
            }
            Err(e) => {
                warn!("message {} could not be sent: {}", label, e);
                false
            }
        };
        message.status = if sent {
            MessageStatus::Transmitted
        } else {
            MessageStatus::Failed
        };
        self.store.save(&mut message)?;
        if sent {
            info!("message {} transmitted ({} bytes)", label, frame.len());
            Ok(FireOutcome::Transmitted)
        } else {
            Ok(FireOutcome::Failed)
        }
    }
}

/// Wait on the earliest deadline and on new arm requests at once. Stops on
/// request, or when the scheduler it serves has been dropped.
fn run_timers(inner: Weak<Inner>, commands: Receiver<TimerCommand>) {
    let mut deadlines: BinaryHeap<Reverse<(Instant, MessageId)>> = BinaryHeap::new();
    loop {
        let next = match deadlines.peek() {
            Some(Reverse((at, _))) => after(at.saturating_duration_since(Instant::now())),
            None => never(),
        };
        select! {
            recv(commands) -> command => match command {
                Ok(TimerCommand::Arm(id, at)) => deadlines.push(Reverse((at, id))),
                Ok(TimerCommand::Stop) | Err(_) => break,
            },
            recv(next) -> _ => {}
        }
        while let Some(&Reverse((at, id))) = deadlines.peek() {
            if at > Instant::now() {
                break;
            }
            deadlines.pop();
            let Some(inner) = inner.upgrade() else { return };
            if let Some((id, at)) = inner.on_deadline(id, at) {
                deadlines.push(Reverse((at, id)));
            }
        }
    }
    debug!("timer thread stopped, {} deadlines dropped", deadlines.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy)]
    enum Reply {
        Ack,
        Silent,
        Disconnected,
    }

    struct Recorder {
        reply: Reply,
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl Recorder {
        fn new(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                frames: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl Transmitter for Recorder {
        fn transmit(&self, frame: &[u8]) -> Result<CommandOutcome<()>, LinkError> {
            self.frames.lock().unwrap().push(frame.to_vec());
            match self.reply {
                Reply::Ack => Ok(CommandOutcome::Acked(())),
                Reply::Silent => Ok(CommandOutcome::NoResponse { attempts: 10 }),
                Reply::Disconnected => Err(LinkError::NotConnected),
            }
        }
    }

    fn setup(reply: Reply) -> (Arc<MemoryStore>, Arc<Recorder>, Scheduler) {
        let store = Arc::new(MemoryStore::new());
        let recorder = Recorder::new(reply);
        let scheduler = Scheduler::new(
            store.clone(),
            recorder.clone(),
            SchedulerConfig {
                poll_interval: Duration::from_secs(3600),
                default_misfire_grace: 30,
            },
        );
        (store, recorder, scheduler)
    }

    fn queue(store: &MemoryStore, offset_secs: i64) -> MessageId {
        let mut message = ScheduledMessage::new(
            Utc::now() + ChronoDuration::seconds(offset_secs),
            "Varsity",
            Payload::raw(b"ping".to_vec()),
        );
        store.save(&mut message).unwrap()
    }

    fn scheduled(store: &MemoryStore, offset_secs: i64) -> ScheduledMessage {
        let id = queue(store, offset_secs);
        let mut message = store.find_by_id(id).unwrap();
        message.status = MessageStatus::Scheduled;
        store.save(&mut message).unwrap();
        message
    }

    fn wait_for(store: &MemoryStore, id: MessageId, status: MessageStatus) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while store.find_by_id(id).unwrap().status != status {
            assert!(Instant::now() < deadline, "message never reached {status}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn startup_requeues_or_misses_in_flight_messages() {
        let (store, _, scheduler) = setup(Reply::Ack);
        let now = Utc::now();
        let mut late = ScheduledMessage::new(now - ChronoDuration::seconds(120), "A", Payload::raw(vec![1]));
        late.status = MessageStatus::Scheduled;
        let late = store.save(&mut late).unwrap();
        let mut patient = ScheduledMessage::new(now - ChronoDuration::seconds(120), "B", Payload::raw(vec![2]))
            .with_misfire_grace(600);
        patient.status = MessageStatus::Transmitting;
        let patient = store.save(&mut patient).unwrap();

        let summary = scheduler.reconcile_at(now).unwrap();
        assert_eq!(summary, ReconcileSummary { requeued: 1, missed: 1, errors: 0 });
        assert_eq!(store.find_by_id(late).unwrap().status, MessageStatus::Missed);
        assert_eq!(store.find_by_id(patient).unwrap().status, MessageStatus::Queued);
    }

    #[test]
    fn poll_arms_each_message_once() {
        let (store, recorder, scheduler) = setup(Reply::Ack);
        let id = queue(&store, 600);

        let first = scheduler.poll_and_schedule().unwrap();
        assert_eq!(first.armed, 1);
        assert!(scheduler.is_armed(id));
        assert_eq!(store.find_by_id(id).unwrap().status, MessageStatus::Scheduled);

        // Someone requeues it behind the scheduler's back.
        let mut message = store.find_by_id(id).unwrap();
        message.status = MessageStatus::Queued;
        store.save(&mut message).unwrap();

        let second = scheduler.poll_and_schedule().unwrap();
        assert_eq!(second, PollSummary { already_armed: 1, ..PollSummary::default() });
        assert_eq!(scheduler.armed_count(), 1);

        scheduler.shutdown().unwrap();
        assert_eq!(scheduler.armed_count(), 0);
        assert!(recorder.sent().is_empty());
    }

    #[test]
    fn poll_marks_overdue_messages_missed() {
        let (store, recorder, scheduler) = setup(Reply::Ack);
        let id = queue(&store, -120);
        let summary = scheduler.poll_and_schedule().unwrap();
        assert_eq!(summary.missed, 1);
        assert_eq!(store.find_by_id(id).unwrap().status, MessageStatus::Missed);
        assert!(recorder.sent().is_empty());
    }

    #[test]
    fn due_message_is_transmitted_with_its_frozen_frame() {
        let (store, recorder, scheduler) = setup(Reply::Ack);
        let id = queue(&store, -5);
        assert_eq!(scheduler.poll_and_schedule().unwrap().armed, 1);
        wait_for(&store, id, MessageStatus::Transmitted);

        let stored = store.find_by_id(id).unwrap();
        assert_eq!(recorder.sent(), vec![stored.frozen_frame.clone().unwrap()]);
        assert_eq!(stored.beacon_frame().unwrap(), stored.frozen_frame.unwrap());
    }

    #[test]
    fn transmitted_message_is_never_resent() {
        let (store, recorder, scheduler) = setup(Reply::Ack);
        let id = queue(&store, 0);
        let mut message = store.find_by_id(id).unwrap();
        message.status = MessageStatus::Transmitted;
        store.save(&mut message).unwrap();

        let outcome = scheduler.fire(message).unwrap();
        assert_eq!(outcome, FireOutcome::Skipped(MessageStatus::Transmitted));
        assert!(recorder.sent().is_empty());

        let queued = store.find_by_id(queue(&store, 0)).unwrap();
        assert_eq!(
            scheduler.fire(queued).unwrap(),
            FireOutcome::Skipped(MessageStatus::Queued)
        );
        assert!(recorder.sent().is_empty());
    }

    #[test]
    fn unacknowledged_message_fails_without_retry() {
        for reply in [Reply::Silent, Reply::Disconnected] {
            let (store, recorder, scheduler) = setup(reply);
            let message = scheduled(&store, 0);
            let id = message.id.unwrap();
            assert_eq!(scheduler.fire(message).unwrap(), FireOutcome::Failed);
            assert_eq!(store.find_by_id(id).unwrap().status, MessageStatus::Failed);

            assert_eq!(scheduler.poll_and_schedule().unwrap(), PollSummary::default());
            assert_eq!(recorder.sent().len(), 1);
        }
    }

    #[test]
    fn firing_past_grace_marks_missed() {
        let (store, recorder, scheduler) = setup(Reply::Ack);
        let message = scheduled(&store, -31);
        let id = message.id.unwrap();
        assert_eq!(scheduler.fire(message).unwrap(), FireOutcome::Missed);
        assert_eq!(store.find_by_id(id).unwrap().status, MessageStatus::Missed);
        assert!(recorder.sent().is_empty());
    }

    #[test]
    fn shutdown_cancels_timers_and_requeues() {
        let (store, recorder, scheduler) = setup(Reply::Ack);
        let id = queue(&store, 3600);
        scheduler.start().unwrap();
        assert!(scheduler.is_armed(id));

        let summary = scheduler.shutdown().unwrap();
        assert_eq!(summary.requeued, 1);
        assert_eq!(store.find_by_id(id).unwrap().status, MessageStatus::Queued);
        assert_eq!(scheduler.armed_count(), 0);
        assert!(recorder.sent().is_empty());
    }

    /// Memory store whose next `failures` saves fail.
    struct FlakyStore {
        inner: MemoryStore,
        failures: AtomicUsize,
    }

    impl FlakyStore {
        fn fail_next(&self, count: usize) {
            self.failures.store(count, Ordering::SeqCst);
        }
    }

    impl MessageStore for FlakyStore {
        fn find_by_status(&self, status: MessageStatus) -> Result<Vec<ScheduledMessage>, StoreError> {
            self.inner.find_by_status(status)
        }

        fn find_since(&self, window: ChronoDuration) -> Result<Vec<ScheduledMessage>, StoreError> {
            self.inner.find_since(window)
        }

        fn find_by_id(&self, id: MessageId) -> Result<ScheduledMessage, StoreError> {
            self.inner.find_by_id(id)
        }

        fn save(&self, message: &mut ScheduledMessage) -> Result<MessageId, StoreError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(StoreError::Io(io::Error::new(io::ErrorKind::Other, "disk full")));
            }
            self.inner.save(message)
        }

        fn remove(&self, message: &ScheduledMessage) -> Result<(), StoreError> {
            self.inner.remove(message)
        }
    }

    #[test]
    fn failed_save_leaves_the_message_for_the_next_poll() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(0),
        });
        let recorder = Recorder::new(Reply::Ack);
        let scheduler = Scheduler::new(store.clone(), recorder.clone(), SchedulerConfig::default());
        let id = queue(&store.inner, 600);

        store.fail_next(1);
        let first = scheduler.poll_and_schedule().unwrap();
        assert_eq!(first, PollSummary { errors: 1, ..PollSummary::default() });
        assert!(!scheduler.is_armed(id));
        assert_eq!(store.find_by_id(id).unwrap().status, MessageStatus::Queued);

        let second = scheduler.poll_and_schedule().unwrap();
        assert_eq!(second, PollSummary { armed: 1, ..PollSummary::default() });
        assert!(scheduler.is_armed(id));
        assert_eq!(store.find_by_id(id).unwrap().status, MessageStatus::Scheduled);

        scheduler.shutdown().unwrap();
        assert!(recorder.sent().is_empty());
    }

    #[test]
    fn message_requeued_while_armed_fires_at_its_deadline() {
        let (store, recorder, scheduler) = setup(Reply::Ack);
        let mut message = ScheduledMessage::new(
            Utc::now() + ChronoDuration::milliseconds(300),
            "Varsity",
            Payload::raw(b"ping".to_vec()),
        );
        let id = store.save(&mut message).unwrap();
        assert_eq!(scheduler.poll_and_schedule().unwrap().armed, 1);

        let mut message = store.find_by_id(id).unwrap();
        message.status = MessageStatus::Queued;
        store.save(&mut message).unwrap();

        // The re-poll is an hour away; only the timer can pick it up.
        wait_for(&store, id, MessageStatus::Transmitted);
        assert_eq!(recorder.sent().len(), 1);
        let deadline = Instant::now() + Duration::from_secs(2);
        while scheduler.is_armed(id) {
            assert!(Instant::now() < deadline, "timer entry never cleared");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let (store, recorder, scheduler) = setup(Reply::Ack);
        let now = Utc::now();
        let mut ids = Vec::new();
        for (tag, offset_ms) in [(3u8, 450), (1, 150), (4, 600), (2, 300)] {
            let mut message = ScheduledMessage::new(
                now + ChronoDuration::milliseconds(offset_ms),
                "Varsity",
                Payload::raw(vec![tag]),
            );
            ids.push(store.save(&mut message).unwrap());
        }
        assert_eq!(scheduler.poll_at(now).unwrap().armed, 4);
        assert_eq!(scheduler.armed_count(), 4);
        for id in &ids {
            wait_for(&store, *id, MessageStatus::Transmitted);
        }

        let order: Vec<ScheduledMessage> = recorder
            .sent()
            .iter()
            .map(|frame| {
                ids.iter()
                    .map(|id| store.find_by_id(*id).unwrap())
                    .find(|m| m.frozen_frame.as_deref() == Some(frame.as_slice()))
                    .unwrap()
            })
            .collect();
        let tags: Vec<Vec<u8>> = order.iter().map(|m| m.payload.to_bytes().unwrap()).collect();
        assert_eq!(tags, vec![vec![1], vec![2], vec![3], vec![4]]);
        scheduler.shutdown().unwrap();
    }
}
