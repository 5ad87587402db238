//! Integration tests for dispatcher timers and affinity objects

mod common;

use crossbeam::channel;
use parking_lot::Mutex;
use raya_dispatcher::{DispatcherAffine, DispatcherError, DispatcherObject, DispatcherTimer};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_ticks_marshal_to_owner_thread() {
    let (_registry, owner) = common::owner_thread("timer-owner");
    let dispatcher = Arc::clone(owner.dispatcher());
    let owner_id = owner.thread_id();

    let ticks = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = channel::bounded::<()>(1);

    // Created and started from a foreign thread
    let timer =
        DispatcherTimer::with_dispatcher(Arc::clone(&dispatcher), Duration::from_millis(100));
    let sink = Arc::clone(&ticks);
    timer.on_tick(move |timer| {
        sink.lock().push((thread::current().id(), Instant::now()));
        if timer.tick_count() == 3 {
            timer.stop();
            let _ = done_tx.send(());
        }
    });

    let start = Instant::now();
    timer.start().unwrap();
    done_rx.recv_timeout(Duration::from_secs(10)).unwrap();

    let ticks = ticks.lock().clone();
    assert_eq!(ticks.len(), 3);
    for (ran_on, _) in &ticks {
        assert_eq!(*ran_on, owner_id);
    }
    // Each tick is armed after the previous one ran
    assert!(ticks[2].1.duration_since(start) >= Duration::from_millis(300));
    assert!(!timer.is_enabled());

    owner.shutdown().unwrap();
}

#[test]
fn test_shutdown_from_tick_handler() {
    let (_registry, owner) = common::owner_thread("timer-shutdown-owner");
    let dispatcher = Arc::clone(owner.dispatcher());

    let timer =
        DispatcherTimer::with_dispatcher(Arc::clone(&dispatcher), Duration::from_millis(20));
    timer.on_tick(|timer| {
        if timer.tick_count() == 2 {
            let _ = timer.dispatcher().request_shutdown();
        }
    });
    timer.start().unwrap();

    owner.join().unwrap();
    assert!(dispatcher.has_shutdown_finished());

    // The next deadline finds the dispatcher gone and disables the timer
    let deadline = Instant::now() + Duration::from_secs(5);
    while timer.is_enabled() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!timer.is_enabled());
    assert_eq!(timer.tick_count(), 2);
}

#[test]
fn test_timer_started_on_owner_thread() {
    let (_registry, owner) = common::owner_thread("timer-local-owner");
    let (tick_tx, tick_rx) = channel::unbounded();

    let timer = owner
        .dispatcher()
        .send(
            move || {
                let timer = DispatcherTimer::new(Duration::from_millis(10));
                timer.on_tick(move |timer| {
                    let _ = tick_tx.send(thread::current().id());
                    timer.stop();
                });
                timer.start()?;
                Ok(timer)
            },
            Some(Duration::from_secs(5)),
        )
        .unwrap()
        .unwrap();

    let ran_on = tick_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(ran_on, owner.thread_id());
    assert_eq!(timer.dispatcher().thread_id(), owner.thread_id());
    owner.shutdown().unwrap();
}

// ===== DispatcherObject =====

struct Document {
    object: DispatcherObject,
    title: String,
}

impl DispatcherAffine for Document {
    fn dispatcher_object(&self) -> &DispatcherObject {
        &self.object
    }
}

impl Document {
    fn rename(&mut self, title: &str) -> Result<(), DispatcherError> {
        self.verify_access()?;
        self.title = title.to_string();
        Ok(())
    }
}

#[test]
fn test_affine_object_marshals_through_owner() {
    let (_registry, owner) = common::owner_thread("object-owner");

    let document = owner
        .dispatcher()
        .send(
            || {
                Ok(Arc::new(Mutex::new(Document {
                    object: DispatcherObject::new(),
                    title: "draft".to_string(),
                })))
            },
            Some(Duration::from_secs(5)),
        )
        .unwrap()
        .unwrap();

    // Direct access from here is refused
    assert!(!document.lock().check_access());
    let err = document.lock().rename("stolen").unwrap_err();
    assert!(matches!(err, DispatcherError::WrongThread { .. }));

    // Marshaled access succeeds
    let shared = Arc::clone(&document);
    owner
        .dispatcher()
        .send(move || Ok(shared.lock().rename("final")?), Some(Duration::from_secs(5)))
        .unwrap()
        .unwrap();
    assert_eq!(document.lock().title, "final");

    owner.shutdown().unwrap();
}
