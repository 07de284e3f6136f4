//! Animation controller: at most one pattern drives the LED bank at a time
//!
//! Each run gets its own OS thread and [`CancelToken`]. Starting a new run
//! cancels the old one, waits a bounded time for its thread to finish, and
//! blanks the bank before the new thread is spawned.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::pattern::{Pattern, PatternKind, Repeat};
use crate::pin::{Frame, PinDriver};

/// How long `start`/`stop` wait for a cancelled run to exit
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Cancellation flag shared between the controller and one animation run
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.inner
            .cancelled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancel and wake any thread blocked in [`Self::sleep`]
    pub fn cancel(&self) {
        *self.lock() = true;
        self.inner.wake.notify_all();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.lock()
    }

    /// Wait for `hold` or until cancelled. Returns `true` if cancelled.
    pub fn sleep(&self, hold: Duration) -> bool {
        let guard = self.lock();
        let (guard, _) = self
            .inner
            .wake
            .wait_timeout_while(guard, hold, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// RAII guard owned by an animation thread: keeps the live-task count and
/// signals completion on drop, including when the thread panics
struct TaskGuard {
    active: Arc<AtomicUsize>,
    done_tx: Option<oneshot::Sender<()>>,
}

impl TaskGuard {
    fn new(active: Arc<AtomicUsize>, done_tx: oneshot::Sender<()>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            active,
            done_tx: Some(done_tx),
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(tx) = self.done_tx.take() {
            let _ = tx.send(());
        }
    }
}

struct AnimationRun {
    kind: PatternKind,
    token: CancelToken,
    done_rx: oneshot::Receiver<()>,
    handle: JoinHandle<()>,
}

/// Owns the single animation slot for a [`PinDriver`]
pub struct AnimationController {
    driver: Arc<PinDriver>,
    current: Mutex<Option<AnimationRun>>,
    active_tasks: Arc<AtomicUsize>,
    join_timeout: Duration,
}

impl AnimationController {
    #[must_use]
    pub fn new(driver: Arc<PinDriver>) -> Self {
        Self::with_join_timeout(driver, DEFAULT_JOIN_TIMEOUT)
    }

    #[must_use]
    pub fn with_join_timeout(driver: Arc<PinDriver>, join_timeout: Duration) -> Self {
        Self {
            driver,
            current: Mutex::new(None),
            active_tasks: Arc::new(AtomicUsize::new(0)),
            join_timeout,
        }
    }

    #[must_use]
    pub const fn driver(&self) -> &Arc<PinDriver> {
        &self.driver
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<AnimationRun>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace whatever is running with `pattern`.
    ///
    /// Returns `false` only if the animation thread could not be spawned.
    pub fn start(&self, pattern: Pattern) -> bool {
        let mut current = self.lock_current();
        self.cancel_locked(&mut current);
        self.spawn_locked(&mut current, pattern)
    }

    /// Start `pattern` unless a run is still alive
    pub fn start_if_idle(&self, pattern: Pattern) -> bool {
        let mut current = self.lock_current();
        if let Some(run) = current.as_ref() {
            if !run.handle.is_finished() {
                debug!(
                    "Not starting {}: {} is still running",
                    pattern.kind(),
                    run.kind
                );
                return false;
            }
        }
        self.cancel_locked(&mut current);
        self.spawn_locked(&mut current, pattern)
    }

    /// Cancel the current run (if any) and blank the bank
    pub fn stop(&self) {
        let mut current = self.lock_current();
        self.cancel_locked(&mut current);
    }

    /// Stop, blank, then light exactly one LED.
    ///
    /// Returns `false` if `index` is outside the bank (the bank stays blank).
    pub fn light_single(&self, index: usize) -> bool {
        let mut current = self.lock_current();
        self.cancel_locked(&mut current);
        self.driver.set(index, true)
    }

    /// Kind of the live run; `None` once a single-shot run has finished
    #[must_use]
    pub fn current(&self) -> Option<PatternKind> {
        self.lock_current()
            .as_ref()
            .filter(|run| !run.handle.is_finished())
            .map(|run| run.kind)
    }


    /// Number of animation threads still alive
    #[must_use]
    pub fn active_tasks(&self) -> usize {
        self.active_tasks.load(Ordering::SeqCst)
    }

    fn cancel_locked(&self, current: &mut Option<AnimationRun>) {
        if let Some(run) = current.take() {
            run.token.cancel();
            match run.done_rx.recv_timeout(self.join_timeout) {
                Ok(()) | Err(oneshot::RecvTimeoutError::Disconnected) => {
                    if run.handle.join().is_err() {
                        warn!("Animation {} panicked", run.kind);
                    } else {
                        debug!("Animation {} stopped", run.kind);
                    }
                }
                Err(oneshot::RecvTimeoutError::Timeout) => {
                    warn!(
                        "Animation {} did not exit within {:?}, detaching",
                        run.kind, self.join_timeout
                    );
                }
            }
        }
        // Runs hold the token check and the write under the bank lock, so
        // once this returns no cancelled run can light anything
        self.driver.all_off();
    }

    fn spawn_locked(&self, current: &mut Option<AnimationRun>, pattern: Pattern) -> bool {
        let kind = pattern.kind();
        let cycle = pattern.cycle_duration();
        let token = CancelToken::new();
        let (done_tx, done_rx) = oneshot::channel();
        let guard = TaskGuard::new(self.active_tasks.clone(), done_tx);
        let driver = self.driver.clone();
        let task_token = token.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("anim-{kind}"))
            .spawn(move || {
                let _guard = guard;
                run_pattern(&driver, &pattern, &task_token);
            });

        match spawned {
            Ok(handle) => {
                info!("Animation {kind} started ({cycle:?} per pass)");
                *current = Some(AnimationRun {
                    kind,
                    token,
                    done_rx,
                    handle,
                });
                true
            }
            Err(e) => {
                error!("Failed to spawn animation thread for {kind}: {e}");
                false
            }
        }
    }
}

impl Drop for AnimationController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_pattern(driver: &PinDriver, pattern: &Pattern, token: &CancelToken) {
    if pattern.is_empty() {
        return;
    }
    loop {
        for step in pattern.steps() {
            if !driver.apply_unless_cancelled(&step.frame, token) {
                return;
            }
            if token.sleep(step.hold) {
                return;
            }
        }
        if pattern.repeat() == Repeat::Once {
            let blank: Frame = smallvec::smallvec![false; driver.len()];
            driver.apply_unless_cancelled(&blank, token);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Step;
    use crate::pin::{BackendError, Level, MemoryBackend, OutputBackend, Pin};
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    fn pins(n: u8) -> Vec<Pin> {
        (0..n).map(|i| Pin::active_high(10 + i)).collect()
    }

    fn setup(n: u8) -> (Arc<MemoryBackend>, Arc<AnimationController>) {
        let backend = Arc::new(MemoryBackend::new());
        let driver = Arc::new(PinDriver::configure(backend.clone(), pins(n)));
        (backend, Arc::new(AnimationController::new(driver)))
    }

    /// Every step lights only `led`
    fn solid(kind: PatternKind, n: usize, led: usize, hold_ms: u64) -> Pattern {
        let mut frame: Frame = smallvec::smallvec![false; n];
        frame[led] = true;
        Pattern::new(
            kind,
            vec![Step {
                frame,
                hold: Duration::from_millis(hold_ms),
            }],
            Repeat::Loop,
        )
    }

    fn chase(n: usize, hold_ms: u64) -> Pattern {
        let steps = (0..n)
            .map(|i| {
                let mut frame: Frame = smallvec::smallvec![false; n];
                frame[i] = true;
                Step {
                    frame,
                    hold: Duration::from_millis(hold_ms),
                }
            })
            .collect();
        Pattern::new(PatternKind::Chase, steps, Repeat::Loop)
    }

    fn wave(n: usize, hold_ms: u64) -> Pattern {
        let looped = chase(n, hold_ms);
        Pattern::new(PatternKind::Wave, looped.steps().to_vec(), Repeat::Once)
    }

    #[test]
    fn cancel_token_wakes_sleeper() {
        let token = CancelToken::new();
        let sleeper = token.clone();
        let started = Instant::now();
        let t = std::thread::spawn(move || sleeper.sleep(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
        assert!(t.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn sleep_without_cancel_times_out() {
        let token = CancelToken::new();
        assert!(!token.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn start_then_stop_leaves_no_threads() {
        let (_backend, controller) = setup(4);
        assert!(controller.start(chase(4, 1000)));
        assert_eq!(controller.current(), Some(PatternKind::Chase));

        controller.stop();
        assert_eq!(controller.active_tasks(), 0);
        assert_eq!(controller.current(), None);
    }

    #[test]
    fn stop_blanks_every_pin() {
        let (backend, controller) = setup(4);
        controller.start(chase(4, 20));
        std::thread::sleep(Duration::from_millis(50));
        controller.stop();

        assert!(controller.driver().snapshot().iter().all(|on| !on));
        for line in 10..14 {
            assert_eq!(backend.level(line), Some(Level::Low));
        }
    }

    #[test]
    fn cancel_mid_loop_is_prompt() {
        let (_backend, controller) = setup(4);
        controller.start(chase(4, 200));
        std::thread::sleep(Duration::from_millis(300));

        let started = Instant::now();
        controller.stop();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(controller.driver().snapshot().iter().all(|on| !on));
    }

    #[test]
    fn single_shot_blanks_itself() {
        let (backend, controller) = setup(4);
        controller.start(wave(4, 10));
        std::thread::sleep(Duration::from_millis(300));

        assert_eq!(controller.current(), None);
        assert_eq!(controller.active_tasks(), 0);
        assert!(controller.driver().snapshot().iter().all(|on| !on));
        for line in 10..14 {
            assert_eq!(backend.level(line), Some(Level::Low));
        }
    }

    #[test]
    fn empty_pattern_completes_immediately() {
        let (_backend, controller) = setup(0);
        assert!(controller.start(Pattern::new(PatternKind::Wave, Vec::new(), Repeat::Loop)));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(controller.current(), None);
        assert_eq!(controller.active_tasks(), 0);
    }

    #[test]
    fn start_replaces_running_pattern() {
        let (_backend, controller) = setup(3);
        controller.start(solid(PatternKind::Strobe, 3, 0, 10));
        std::thread::sleep(Duration::from_millis(30));
        controller.start(solid(PatternKind::Breathing, 3, 2, 10));
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(controller.current(), Some(PatternKind::Breathing));
        assert_eq!(controller.active_tasks(), 1);
        assert_eq!(controller.driver().snapshot().as_slice(), &[false, false, true]);
        controller.stop();
    }

    #[test]
    fn start_if_idle_refuses_while_running() {
        let (_backend, controller) = setup(3);
        assert!(controller.start_if_idle(chase(3, 1000)));
        assert!(!controller.start_if_idle(chase(3, 1000)));
        controller.stop();
        assert!(controller.start_if_idle(chase(3, 1000)));
        controller.stop();
    }

    #[test]
    fn start_if_idle_accepts_after_single_shot_finished() {
        let (_backend, controller) = setup(2);
        controller.start(wave(2, 5));
        std::thread::sleep(Duration::from_millis(100));
        assert!(controller.start_if_idle(chase(2, 1000)));
        assert_eq!(controller.current(), Some(PatternKind::Chase));
        controller.stop();
    }

    #[test]
    fn light_single_shows_one_led() {
        let (_backend, controller) = setup(4);
        controller.start(chase(4, 10));
        std::thread::sleep(Duration::from_millis(30));

        assert!(controller.light_single(2));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(controller.current(), None);
        assert_eq!(
            controller.driver().snapshot().as_slice(),
            &[false, false, true, false]
        );
        assert!(!controller.light_single(9));
    }

    #[test]
    fn interleaved_starts_leave_only_the_winner() {
        let (_backend, controller) = setup(4);
        let mut handles = Vec::new();
        for round in 0..20 {
            let c = controller.clone();
            handles.push(std::thread::spawn(move || {
                let (kind, led) = if round % 2 == 0 {
                    (PatternKind::Strobe, 0)
                } else {
                    (PatternKind::Breathing, 3)
                };
                c.start(solid(kind, 4, led, 5));
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(controller.active_tasks(), 1);
        let winner = controller.current().unwrap();
        let expected_led = if winner == PatternKind::Strobe { 0 } else { 3 };

        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(7));
            let snapshot = controller.driver().snapshot();
            let lit: Vec<usize> = snapshot
                .iter()
                .enumerate()
                .filter_map(|(i, &on)| on.then_some(i))
                .collect();
            assert_eq!(lit, vec![expected_led]);
        }
        controller.stop();
        assert_eq!(controller.active_tasks(), 0);
    }

    /// Panics on the first "on" write after being armed
    #[derive(Default)]
    struct PanicOnceBackend {
        inner: MemoryBackend,
        armed: AtomicBool,
    }

    impl OutputBackend for PanicOnceBackend {
        fn set_output(&self, line: u8) -> Result<(), BackendError> {
            self.inner.set_output(line)
        }

        fn write(&self, line: u8, level: Level) -> Result<(), BackendError> {
            if level == Level::High && self.armed.swap(false, Ordering::SeqCst) {
                panic!("simulated driver fault");
            }
            self.inner.write(line, level)
        }
    }

    #[test]
    fn panicking_task_does_not_wedge_controller() {
        let backend = Arc::new(PanicOnceBackend::default());
        let driver = Arc::new(PinDriver::configure(backend.clone(), pins(3)));
        let controller = AnimationController::new(driver);

        backend.armed.store(true, Ordering::SeqCst);
        controller.start(chase(3, 10));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(controller.active_tasks(), 0);

        controller.stop();
        assert!(controller.start(solid(PatternKind::Alert, 3, 1, 10)));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(controller.driver().snapshot().as_slice(), &[false, true, false]);
        controller.stop();
        assert_eq!(controller.active_tasks(), 0);
    }

    #[test]
    fn stuck_task_is_detached_after_join_timeout() {
        /// Delays writes while `slow` is set
        struct SlowBackend {
            inner: MemoryBackend,
            delay: Duration,
            slow: AtomicBool,
        }

        impl OutputBackend for SlowBackend {
            fn set_output(&self, line: u8) -> Result<(), BackendError> {
                self.inner.set_output(line)
            }

            fn write(&self, line: u8, level: Level) -> Result<(), BackendError> {
                if self.slow.load(Ordering::SeqCst) {
                    std::thread::sleep(self.delay);
                }
                self.inner.write(line, level)
            }
        }

        let backend = Arc::new(SlowBackend {
            inner: MemoryBackend::new(),
            delay: Duration::from_millis(150),
            slow: AtomicBool::new(false),
        });
        let driver = Arc::new(PinDriver::configure(backend.clone(), pins(1)));
        let controller =
            AnimationController::with_join_timeout(driver, Duration::from_millis(20));

        backend.slow.store(true, Ordering::SeqCst);
        controller.start(chase(1, 1));
        std::thread::sleep(Duration::from_millis(30));
        backend.slow.store(false, Ordering::SeqCst);

        controller.stop();
        assert!(controller.driver().snapshot().iter().all(|on| !on));
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(controller.active_tasks(), 0);
        assert!(controller.driver().snapshot().iter().all(|on| !on));
    }
}
