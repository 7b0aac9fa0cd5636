use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use helix_osal::{
    Forever, MutexFlags, NoWait, ObjectAttr, Osal, OsalError, Port, Priority, QueueAttr, ThreadId,
    Timeout, TimerKind, WaitOptions,
};

use super::*;

fn setup(priority: Priority) -> (Arc<HostPort>, Arc<Osal>, ThreadId) {
    let port = Arc::new(HostPort::new());
    let osal = Arc::new(Osal::with_port(port.clone()).unwrap());
    let main = adopt_current(&osal, "test-main", priority).unwrap();
    (port, osal, main)
}

fn pause(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

/// Poll `cond` for up to two seconds
fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(2) {
        if cond() {
            return true;
        }
        pause(1);
    }
    false
}

#[test]
fn test_event_wait_woken_by_set() {
    let (_port, osal, _main) = setup(Priority::NORMAL);
    let evt = osal.events().create(&ObjectAttr::named("evt")).unwrap();

    let setter = spawn(&osal, "setter", Priority::NORMAL, {
        let osal = osal.clone();
        move || {
            pause(20);
            osal.events().set(evt, 0b0110).unwrap()
        }
    })
    .unwrap();

    let seen = osal.events().wait(evt, 0b0010, WaitOptions::ANY, Forever).unwrap();
    assert_eq!(seen & 0b0010, 0b0010);
    setter.join().unwrap();
    // only the satisfying bit was consumed
    assert_eq!(osal.events().get(evt), Ok(0b0100));
}

#[test]
fn test_one_bit_satisfies_one_waiter() {
    let (_port, osal, _main) = setup(Priority::NORMAL);
    let evt = osal.events().create(&ObjectAttr::default()).unwrap();
    let ready = osal.semaphores().create(2, 0, &ObjectAttr::default()).unwrap();

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let shared = osal.clone();
            spawn(&osal, "waiter", Priority::NORMAL, move || {
                shared.semaphores().release(ready).unwrap();
                shared.events().wait(evt, 0b1, WaitOptions::ANY, Timeout::Ticks(300))
            })
            .unwrap()
        })
        .collect();

    osal.semaphores().acquire(ready, Forever).unwrap();
    osal.semaphores().acquire(ready, Forever).unwrap();
    pause(20);
    osal.events().set(evt, 0b1).unwrap();

    let results: Vec<_> = waiters.into_iter().map(|h| h.join().unwrap()).collect();
    let won = results.iter().filter(|r| r.is_ok()).count();
    let timed_out = results.iter().filter(|r| **r == Err(OsalError::Timeout)).count();
    assert_eq!((won, timed_out), (1, 1));
    assert_eq!(osal.events().get(evt), Ok(0));
}

#[test]
fn test_wait_all_across_two_sets() {
    let (_port, osal, main) = setup(Priority::NORMAL);
    let waiter = spawn(&osal, "notified", Priority::NORMAL, {
        let osal = osal.clone();
        move || {
            let me = osal.threads().current().unwrap();
            (me, osal.threads().notify_wait(0b11, WaitOptions::ALL, Forever))
        }
    })
    .unwrap();

    // find the waiter's id through the registry
    let mut target = None;
    assert!(eventually(|| {
        target = osal
            .threads()
            .enumerate()
            .into_iter()
            .find(|t| t.name == "notified")
            .map(|t| t.id);
        target.is_some()
    }));
    let target = target.unwrap();
    assert_ne!(target, main);

    osal.threads().notify_set(target, 0b01).unwrap();
    pause(10);
    interrupt(|| osal.threads().notify_set(target, 0b10)).unwrap();

    let (me, result) = waiter.join().unwrap();
    assert_eq!(me, target);
    assert_eq!(result, Ok(0b11));
}

#[test]
fn test_priority_inheritance_across_threads() {
    let (port, osal, _main) = setup(Priority::NORMAL);
    let m = osal
        .mutexes()
        .create(&ObjectAttr {
            attr_bits: MutexFlags::PRIO_INHERIT.bits(),
            ..ObjectAttr::named("pi")
        })
        .unwrap();
    let go = osal.events().create(&ObjectAttr::default()).unwrap();
    let held = osal.semaphores().create(1, 0, &ObjectAttr::default()).unwrap();

    let low = spawn(&osal, "low", Priority::LOW, {
        let (osal, port) = (osal.clone(), port.clone());
        move || {
            let me = osal.threads().current().unwrap();
            osal.mutexes().acquire(m, Forever).unwrap();
            osal.semaphores().release(held).unwrap();
            osal.events().wait(go, 0b1, WaitOptions::ANY, Forever).unwrap();
            osal.mutexes().release(m).unwrap();
            (me, port.effective_priority(me))
        }
    })
    .unwrap();
    osal.semaphores().acquire(held, Forever).unwrap();
    let owner = osal.mutexes().get_owner(m).unwrap().unwrap();

    let high = spawn(&osal, "high", Priority::HIGH, {
        let osal = osal.clone();
        move || {
            let result = osal.mutexes().acquire(m, Forever);
            let me = osal.threads().current().unwrap();
            let owned = osal.mutexes().get_owner(m) == Ok(Some(me));
            osal.mutexes().release(m).unwrap();
            (result, owned)
        }
    })
    .unwrap();

    assert!(eventually(|| osal.threads().get_priority(owner) == Ok(Priority::HIGH)));
    assert!(eventually(|| port.effective_priority(owner) == Some(Priority::HIGH)));
    assert_eq!(osal.threads().get_base_priority(owner), Ok(Priority::LOW));

    osal.events().set(go, 0b1).unwrap();
    // restored on release, forgotten once the thread exits
    assert_eq!(low.join().unwrap(), (owner, Some(Priority::LOW)));
    assert_eq!(high.join().unwrap(), (Ok(()), true));
    assert_eq!(port.effective_priority(owner), None);
    assert_eq!(osal.mutexes().get_owner(m), Ok(None));
}

#[test]
fn test_robust_mutex_released_when_owner_exits() {
    let (_port, osal, main) = setup(Priority::NORMAL);
    let m = osal
        .mutexes()
        .create(&ObjectAttr {
            attr_bits: (MutexFlags::ROBUST | MutexFlags::RECURSIVE).bits(),
            ..ObjectAttr::named("robust")
        })
        .unwrap();
    let held = osal.semaphores().create(1, 0, &ObjectAttr::default()).unwrap();

    let worker = spawn(&osal, "worker", Priority::NORMAL, {
        let osal = osal.clone();
        move || {
            osal.mutexes().acquire(m, Forever).unwrap();
            osal.mutexes().acquire(m, Forever).unwrap();
            osal.semaphores().release(held).unwrap();
            pause(30);
            // exits still holding it twice
        }
    })
    .unwrap();

    osal.semaphores().acquire(held, Forever).unwrap();
    assert_eq!(osal.mutexes().acquire(m, NoWait), Err(OsalError::Resource));
    assert_eq!(osal.mutexes().acquire(m, Timeout::Ticks(2000)), Ok(()));
    assert_eq!(osal.mutexes().get_owner(m), Ok(Some(main)));
    worker.join().unwrap();
    osal.mutexes().release(m).unwrap();
}

#[test]
fn test_exited_thread_state_is_freed() {
    let (port, osal, _main) = setup(Priority::NORMAL);
    let sem = osal.semaphores().create(1, 0, &ObjectAttr::default()).unwrap();

    let worker = spawn(&osal, "sleeper", Priority::NORMAL, {
        let (osal, port) = (osal.clone(), port.clone());
        move || {
            let me = osal.threads().current().unwrap();
            let res = osal.semaphores().acquire(sem, Timeout::Ticks(5));
            (me, res, port.has_parker(me))
        }
    })
    .unwrap();

    let (id, res, parked) = worker.join().unwrap();
    assert_eq!(res, Err(OsalError::Timeout));
    assert!(parked);
    assert!(!port.has_parker(id));
    assert_eq!(osal.threads().get_name(id), Err(OsalError::InvalidArg));
}

#[test]
fn test_semaphore_released_from_interrupt() {
    let (_port, osal, _main) = setup(Priority::NORMAL);
    let sem = osal.semaphores().create(1, 0, &ObjectAttr::default()).unwrap();

    let isr = std::thread::spawn({
        let osal = osal.clone();
        move || {
            pause(20);
            interrupt(|| {
                assert_eq!(osal.semaphores().acquire(sem, Timeout::Ticks(10)), Err(OsalError::Isr));
                osal.semaphores().release(sem)
            })
        }
    });

    assert_eq!(osal.semaphores().acquire(sem, Forever), Ok(()));
    assert_eq!(isr.join().unwrap(), Ok(()));
    assert_eq!(osal.semaphores().get_count(sem), Ok(0));
    assert!(!osal.port().in_isr());
}

#[test]
fn test_queue_producer_consumer() {
    let (_port, osal, _main) = setup(Priority::NORMAL);
    let q = osal.queues().create(2, 4, QueueAttr::named("pipe")).unwrap();

    let producer = spawn(&osal, "producer", Priority::NORMAL, {
        let osal = osal.clone();
        move || {
            for n in 0u32..20 {
                osal.queues().put(q, &n.to_le_bytes(), 0, Forever).unwrap();
            }
        }
    })
    .unwrap();

    let mut received = Vec::new();
    let mut buf = [0u8; 4];
    for _ in 0..20 {
        osal.queues().get(q, &mut buf, Timeout::Ticks(2000)).unwrap();
        received.push(u32::from_le_bytes(buf));
        assert!(osal.queues().get_count(q).unwrap() <= 2);
    }
    producer.join().unwrap();
    assert_eq!(received, (0..20).collect::<Vec<_>>());
}

#[test]
fn test_delete_wakes_blocked_waiters() {
    let (_port, osal, _main) = setup(Priority::NORMAL);
    let evt = osal.events().create(&ObjectAttr::default()).unwrap();
    let q = osal.queues().create(1, 1, QueueAttr::default()).unwrap();

    let getter = spawn(&osal, "getter", Priority::NORMAL, {
        let osal = osal.clone();
        move || {
            let mut buf = [0u8; 1];
            osal.queues().get(q, &mut buf, Forever)
        }
    })
    .unwrap();

    let deleter = spawn(&osal, "deleter", Priority::NORMAL, {
        let osal = osal.clone();
        move || {
            pause(30);
            osal.events().delete(evt).unwrap();
            osal.queues().delete(q).unwrap();
        }
    })
    .unwrap();

    assert_eq!(
        osal.events().wait(evt, 0b1, WaitOptions::ANY, Forever),
        Err(OsalError::Resource)
    );
    assert_eq!(getter.join().unwrap(), Err(OsalError::Resource));
    deleter.join().unwrap();
}

#[test]
fn test_timeouts_elapse() {
    let (port, osal, _main) = setup(Priority::NORMAL);
    let sem = osal.semaphores().create(1, 0, &ObjectAttr::default()).unwrap();
    let start = port.tick_count();
    assert_eq!(osal.semaphores().acquire(sem, Timeout::Ticks(25)), Err(OsalError::Timeout));
    assert!(port.tick_count() >= start + 25);

    let start = port.tick_count();
    osal.delay(10).unwrap();
    assert!(port.tick_count() >= start + 10);
}

#[test]
fn test_timer_service() {
    let (_port, osal, _main) = setup(Priority::NORMAL);
    let service = TimerService::start(&osal, &HostConfig::default()).unwrap();

    let periodic_hits = Arc::new(AtomicUsize::new(0));
    let once_hits = Arc::new(AtomicUsize::new(0));
    let periodic = {
        let hits = periodic_hits.clone();
        osal.timers()
            .create(
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                TimerKind::Periodic,
                &ObjectAttr::default(),
            )
            .unwrap()
    };
    let once = {
        let hits = once_hits.clone();
        osal.timers()
            .create(
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                TimerKind::Once,
                &ObjectAttr::default(),
            )
            .unwrap()
    };
    osal.timers().start(periodic, 5).unwrap();
    osal.timers().start(once, 5).unwrap();

    assert!(eventually(|| periodic_hits.load(Ordering::SeqCst) >= 3));
    osal.timers().stop(periodic).unwrap();
    pause(10);
    assert_eq!(once_hits.load(Ordering::SeqCst), 1);
    assert_eq!(osal.timers().is_running(once), Ok(false));

    let after_stop = periodic_hits.load(Ordering::SeqCst);
    pause(30);
    assert_eq!(periodic_hits.load(Ordering::SeqCst), after_stop);
    service.shutdown();
}
