use super::*;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use crate::job::panic_message;

const WAIT: Duration = Duration::from_secs(10);

fn assert_usage_error<F: FnOnce()>(f: F) {
    let payload = catch_unwind(AssertUnwindSafe(f)).unwrap_err();
    assert!(panic_message(&payload).starts_with("dispatch usage error:"));
}

/// Activate and block until the registration step has run
fn activate_registered(source: &Source) -> DispatchResult<()> {
    let (tx, rx) = mpsc::channel();
    source.set_registration_handler(move |result| tx.send(result).unwrap());
    source.activate();
    rx.recv_timeout(WAIT).unwrap()
}

/// Event handler forwarding each delivery's data
fn forward_data(source: &Source) -> mpsc::Receiver<u64> {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let s = source.clone();
    source.set_event_handler(move || {
        let _ = lock(&tx).send(s.data());
    });
    rx
}

#[test]
fn test_data_add_coalesces_while_suspended() {
    let source = Source::data_add(Some(&Queue::serial("test.source.add")));
    let rx = forward_data(&source);
    activate_registered(&source).unwrap();

    source.suspend();
    source.merge_data(1);
    source.merge_data(2);
    source.merge_data(3);
    source.merge_data(0);
    assert!(rx.recv_timeout(Duration::from_millis(30)).is_err());
    source.resume();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 6);

    source.merge_data(4);
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 4);
    source.cancel();
    source.wait_cancelled();
}

#[test]
fn test_data_or_and_replace() {
    let or = Source::data_or_masked(0b0110, None);
    let rx = forward_data(&or);
    activate_registered(&or).unwrap();
    or.suspend();
    or.merge_data(0b0011);
    or.merge_data(0b1100);
    or.resume();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 0b0110);
    or.cancel();

    let replace = Source::data_replace(None);
    let rx = forward_data(&replace);
    activate_registered(&replace).unwrap();
    replace.suspend();
    replace.merge_data(5);
    replace.merge_data(9);
    replace.resume();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 9);
    replace.merge_data(0);
    assert!(rx.recv_timeout(Duration::from_millis(30)).is_err());
    replace.cancel();
    replace.wait_cancelled();
}

#[test]
fn test_registration_precedes_first_event() {
    let source = Source::data_add(Some(&Queue::concurrent("test.source.reg")));
    let log = Arc::new(Mutex::new(Vec::new()));
    let l = Arc::clone(&log);
    source.set_registration_handler(move |result| {
        assert!(result.is_ok());
        lock(&l).push("registered");
    });
    let l = Arc::clone(&log);
    let (tx, rx) = mpsc::channel();
    source.set_event_handler(move || {
        lock(&l).push("event");
        let _ = tx.send(());
    });
    source.merge_data(7);
    assert_eq!(source.state(), SourceState::Created);
    source.activate();
    rx.recv_timeout(WAIT).unwrap();
    assert_eq!(*lock(&log), vec!["registered", "event"]);
    source.cancel();
}

#[test]
fn test_cancel_handler_runs_exactly_once() {
    let source = Source::data_add(None);
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    source.set_cancel_handler(move || {
        c.fetch_add(1, Ordering::SeqCst);
    });
    source.activate();
    source.cancel();
    source.cancel();
    assert!(source.is_cancelled());
    assert_eq!(source.wait_cancelled_timeout(WAIT), WaitResult::Success);
    source.cancel();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(source.state(), SourceState::Cancelled);
}

#[test]
fn test_cancel_waits_for_activation() {
    let source = Source::data_add(None);
    let registered = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&registered);
    source.set_registration_handler(move |_| {
        r.fetch_add(1, Ordering::SeqCst);
    });
    let (tx, rx) = mpsc::channel();
    source.set_cancel_handler(move || tx.send(()).unwrap());
    source.cancel();
    assert_eq!(source.state(), SourceState::Cancelling);
    assert_eq!(
        source.wait_cancelled_timeout(Duration::from_millis(20)),
        WaitResult::TimedOut
    );
    source.activate();
    rx.recv_timeout(WAIT).unwrap();
    source.wait_cancelled();
    // Cancelled before registering: the registration step is skipped
    assert_eq!(registered.load(Ordering::SeqCst), 0);
}

#[test]
fn test_cancel_runs_after_in_flight_handler() {
    let source = Source::data_add(Some(&Queue::concurrent("test.source.inflight")));
    let log = Arc::new(Mutex::new(Vec::new()));
    let (started_tx, started_rx) = mpsc::channel();
    let l = Arc::clone(&log);
    source.set_event_handler(move || {
        let _ = started_tx.send(());
        thread::sleep(Duration::from_millis(30));
        lock(&l).push("event done");
    });
    let l = Arc::clone(&log);
    source.set_cancel_handler(move || lock(&l).push("cancel"));
    source.activate();
    source.merge_data(1);
    started_rx.recv_timeout(WAIT).unwrap();
    source.cancel();
    source.merge_data(1);
    source.wait_cancelled();
    assert_eq!(*lock(&log), vec!["event done", "cancel"]);
}

#[test]
fn test_state_transitions() {
    let source = Source::data_or(None);
    assert_eq!(source.state(), SourceState::Created);
    source.activate();
    assert_eq!(source.state(), SourceState::Resumed);
    source.suspend();
    assert_eq!(source.state(), SourceState::Suspended);
    source.resume();
    assert_eq!(source.state(), SourceState::Resumed);
    assert_usage_error(|| source.resume());
    source.cancel();
    source.wait_cancelled();
    assert_eq!(source.state(), SourceState::Cancelled);
}

#[test]
fn test_resume_activates_new_source() {
    let source = Source::data_add(None);
    let rx = forward_data(&source);
    source.merge_data(2);
    source.resume();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 2);
    source.cancel();
}

#[test]
fn test_kind_misuse_is_usage_error() {
    let timer = Source::timer(TimerFlags::NONE, None);
    assert_usage_error(|| timer.merge_data(1));
    let data = Source::data_add(None);
    assert_usage_error(|| data.schedule(DispatchTime::now(), TimeInterval::never(), TimeInterval::ZERO));
}

#[test]
fn test_one_shot_timer_fires_once() {
    let timer = Source::timer(TimerFlags::STRICT, Some(&Queue::serial("test.timer.once")));
    let rx = forward_data(&timer);
    let start = DispatchTime::now();
    timer.schedule(
        DispatchTime::after(Duration::from_millis(15)),
        TimeInterval::never(),
        TimeInterval::milliseconds(1),
    );
    timer.activate();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);
    assert!(DispatchTime::now().duration_since(start) >= Duration::from_millis(15));
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    timer.cancel();
}

#[test]
fn test_repeating_timer_counts_periods() {
    let timer = Source::timer(TimerFlags::NONE, Some(&Queue::serial("test.timer.repeat")));
    let total = Arc::new(AtomicU64::new(0));
    let t = Arc::clone(&total);
    let s = timer.clone();
    timer.set_event_handler(move || {
        t.fetch_add(s.data(), Ordering::SeqCst);
    });
    timer.schedule(
        DispatchTime::after(Duration::from_millis(10)),
        TimeInterval::milliseconds(10),
        TimeInterval::milliseconds(2),
    );
    timer.activate();
    thread::sleep(Duration::from_millis(305));
    timer.cancel();
    timer.wait_cancelled();

    // Late deliveries coalesce, so the sum tracks elapsed periods
    let fired = total.load(Ordering::SeqCst);
    assert!((26..=31).contains(&fired), "fired {} times", fired);
}

#[test]
fn test_repeating_timer_does_not_drift() {
    let timer = Source::timer(TimerFlags::NONE, Some(&Queue::serial("test.timer.drift")));
    let fires = Arc::new(Mutex::new(Vec::with_capacity(128)));
    let f = Arc::clone(&fires);
    let s = timer.clone();
    timer.set_event_handler(move || {
        lock(&f).push((Instant::now(), s.data()));
    });
    timer.schedule(
        DispatchTime::after(Duration::from_millis(10)),
        TimeInterval::milliseconds(10),
        TimeInterval::milliseconds(2),
    );
    timer.activate();
    thread::sleep(Duration::from_millis(1005));
    timer.cancel();
    timer.wait_cancelled();

    let fires = lock(&fires);
    let periods: u64 = fires.iter().map(|&(_, n)| n).sum();
    assert!((95..=101).contains(&periods), "{} periods in 1s", periods);

    // Each gap should span the periods its delivery reports
    let interval = Duration::from_millis(10);
    let deviations: Vec<Duration> = fires
        .windows(2)
        .map(|w| {
            let gap = w[1].0.duration_since(w[0].0);
            let expected = interval * w[1].1 as u32;
            if gap > expected {
                gap - expected
            } else {
                expected - gap
            }
        })
        .collect();
    assert!(!deviations.is_empty());
    let mean = deviations.iter().sum::<Duration>() / deviations.len() as u32;
    assert!(mean < Duration::from_millis(1), "mean gap deviation {:?}", mean);
}

#[test]
fn test_suspended_timer_delivers_one_coalesced_event() {
    let timer = Source::timer(TimerFlags::STRICT, Some(&Queue::serial("test.timer.suspend")));
    let rx = forward_data(&timer);
    timer.schedule(
        DispatchTime::now(),
        TimeInterval::milliseconds(5),
        TimeInterval::ZERO,
    );
    timer.activate();
    assert!(rx.recv_timeout(WAIT).unwrap() >= 1);

    timer.suspend();
    // Drain anything that was already in flight
    while rx.recv_timeout(Duration::from_millis(20)).is_ok() {}
    thread::sleep(Duration::from_millis(60));
    timer.resume();

    let coalesced = rx.recv_timeout(WAIT).unwrap();
    assert!(coalesced >= 8, "coalesced {}", coalesced);
    timer.cancel();
    timer.wait_cancelled();
}

#[test]
fn test_reschedule_from_handler() {
    let timer = Source::timer(TimerFlags::STRICT, Some(&Queue::serial("test.timer.reschedule")));
    let fires = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    let f = Arc::clone(&fires);
    let s = timer.clone();
    let tx = Mutex::new(tx);
    timer.set_event_handler(move || {
        if f.fetch_add(1, Ordering::SeqCst) == 0 {
            s.schedule(
                DispatchTime::after(Duration::from_millis(5)),
                TimeInterval::never(),
                TimeInterval::ZERO,
            );
        } else {
            let _ = lock(&tx).send(());
        }
    });
    timer.schedule(DispatchTime::now(), TimeInterval::never(), TimeInterval::ZERO);
    timer.activate();
    rx.recv_timeout(WAIT).unwrap();
    thread::sleep(Duration::from_millis(30));
    assert_eq!(fires.load(Ordering::SeqCst), 2);
    timer.cancel();
}

#[test]
fn test_wall_deadline_timer() {
    let timer = Source::timer(TimerFlags::NONE, None);
    let rx = forward_data(&timer);
    let wall = dispatch_core::WallTime::now().saturating_add(TimeInterval::milliseconds(10));
    timer.schedule(wall, TimeInterval::never(), TimeInterval::ZERO);
    timer.activate();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);
    timer.cancel();
}

#[cfg(unix)]
mod unix {
    use super::*;
    use std::os::fd::{AsRawFd, OwnedFd};

    use nix::unistd;

    #[test]
    fn test_read_source_reports_available_bytes() {
        let (read_end, write_end) = unistd::pipe().unwrap();
        let fd = read_end.as_raw_fd();
        let source = Source::read(fd, Some(&Queue::serial("test.source.read")));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let s = source.clone();
        source.set_event_handler(move || {
            let mut buf = [0u8; 64];
            let n = unistd::read(s.handle(), &mut buf).unwrap_or(0);
            let _ = lock(&tx).send((s.data(), buf[..n].to_vec()));
        });
        let (closed_tx, closed_rx) = mpsc::channel();
        let owned: Mutex<Option<OwnedFd>> = Mutex::new(Some(read_end));
        source.set_cancel_handler(move || {
            drop(lock(&owned).take());
            closed_tx.send(()).unwrap();
        });
        activate_registered(&source).unwrap();

        unistd::write(&write_end, b"hello").unwrap();
        let (available, bytes) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(available, 5);
        assert_eq!(bytes, b"hello");

        unistd::write(&write_end, b"again").unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().1, b"again");

        source.cancel();
        closed_rx.recv_timeout(WAIT).unwrap();
        source.wait_cancelled();
    }

    #[test]
    fn test_write_source_fires_when_writable() {
        let (_read_end, write_end) = unistd::pipe().unwrap();
        let source = Source::write(write_end.as_raw_fd(), None);
        let rx = forward_data(&source);
        activate_registered(&source).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 1);
        source.cancel();
        source.wait_cancelled();
    }

    #[test]
    fn test_invalid_descriptor_cancels_source() {
        let source = Source::read(1 << 20, None);
        let (tx, rx) = mpsc::channel();
        source.set_cancel_handler(move || tx.send(()).unwrap());
        let result = activate_registered(&source);
        assert_eq!(result, Err(DispatchError::InvalidDescriptor(1 << 20)));
        rx.recv_timeout(WAIT).unwrap();
        source.wait_cancelled();
        assert_eq!(source.error(), Some(DispatchError::InvalidDescriptor(1 << 20)));
        assert_eq!(source.state(), SourceState::Cancelled);
    }

    #[test]
    fn test_signal_source_counts_deliveries() {
        let source = Source::signal(libc::SIGUSR2, Some(&Queue::serial("test.source.signal")));
        let total = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let t = Arc::clone(&total);
        let s = source.clone();
        source.set_event_handler(move || {
            if t.fetch_add(s.data(), Ordering::SeqCst) + s.data() >= 2 {
                let _ = lock(&tx).send(());
            }
        });
        activate_registered(&source).unwrap();

        // SAFETY: our handler is installed for SIGUSR2
        unsafe {
            libc::raise(libc::SIGUSR2);
            libc::raise(libc::SIGUSR2);
        }
        rx.recv_timeout(WAIT).unwrap();
        assert!(total.load(Ordering::SeqCst) >= 2);
        source.cancel();
        source.wait_cancelled();
    }

    #[test]
    fn test_uncatchable_signal_is_rejected() {
        let source = Source::signal(libc::SIGKILL, None);
        assert_eq!(
            activate_registered(&source),
            Err(DispatchError::InvalidSignal(libc::SIGKILL))
        );
        source.wait_cancelled();
    }
}
