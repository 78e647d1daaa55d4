// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cross-thread runtime scenarios: messaging, updown delivery, watchers,
//! and the IPC registration contract.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use nicsdk_rt::event::{
    current_thread_id, message_send, timestamp_now, updown_up_subscribe, EventThreadBuilder,
    EvTimer, Events, Io, IpcInfra, IpcProvider, Prepare, Registry,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_cross_thread_message_delivery() {
    init_logging();
    let registry = Registry::new();
    let (tx, rx) = mpsc::channel::<u64>();

    let receiver = EventThreadBuilder::new("msg-rx", 2)
        .registry(Arc::clone(&registry))
        .on_message(move |payload, _ctx| {
            let value = *payload.downcast_ref::<u64>().expect("u64 payload");
            tx.send(value).expect("report");
        })
        .build()
        .expect("build");
    receiver.start(Box::new(())).expect("start");

    let sender = {
        let registry = Arc::clone(&registry);
        std::thread::spawn(move || {
            registry
                .message_send(2, Box::new(0xdeadu64))
                .expect("send");
        })
    };
    sender.join().expect("sender");

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).expect("delivery"), 0xdead);
    // exactly one delivery
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    receiver.stop();
    receiver.join();
}

#[test]
fn test_fifo_order_per_sender() {
    let registry = Registry::new();
    let (tx, rx) = mpsc::channel::<u32>();

    let receiver = EventThreadBuilder::new("fifo-rx", 3)
        .registry(Arc::clone(&registry))
        .on_message(move |payload, _ctx| {
            tx.send(*payload.downcast_ref::<u32>().expect("u32"))
                .expect("report");
        })
        .build()
        .expect("build");
    receiver.start(Box::new(())).expect("start");

    for i in 0..200u32 {
        registry.message_send(3, Box::new(i)).expect("send");
    }
    for i in 0..200u32 {
        assert_eq!(rx.recv_timeout(RECV_TIMEOUT).expect("delivery"), i);
    }

    receiver.stop();
    receiver.join();
}

#[test]
fn test_updown_subscribe_before_target_starts() {
    init_logging();
    let registry = Registry::new();
    let (tx, rx) = mpsc::channel::<(u8, Option<u8>)>();

    let subscriber = EventThreadBuilder::new("updown-sub", 4)
        .registry(Arc::clone(&registry))
        .on_init(move |_ctx| {
            let tx = tx.clone();
            updown_up_subscribe(5, move |thread_id, _ctx| {
                tx.send((thread_id, current_thread_id())).expect("report");
            });
        })
        .build()
        .expect("build");
    subscriber.start(Box::new(())).expect("start");
    while !subscriber.is_ready() {
        std::thread::sleep(Duration::from_millis(1));
    }

    let target = EventThreadBuilder::new("updown-target", 5)
        .registry(Arc::clone(&registry))
        .build()
        .expect("build");
    target.start(Box::new(())).expect("start");

    // callback runs on the subscriber's thread, exactly once
    let (up_id, on_thread) = rx.recv_timeout(RECV_TIMEOUT).expect("notification");
    assert_eq!(up_id, 5);
    assert_eq!(on_thread, Some(4));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    target.stop();
    target.join();
    subscriber.stop();
    subscriber.join();
}

#[test]
fn test_updown_subscribe_after_target_up() {
    let registry = Registry::new();

    let target = EventThreadBuilder::new("late-target", 6)
        .registry(Arc::clone(&registry))
        .build()
        .expect("build");
    target.start(Box::new(())).expect("start");
    while !target.is_ready() {
        std::thread::sleep(Duration::from_millis(1));
    }

    let (tx, rx) = mpsc::channel::<u8>();
    let subscriber = EventThreadBuilder::new("late-sub", 7)
        .registry(Arc::clone(&registry))
        .on_init(move |_ctx| {
            let tx = tx.clone();
            updown_up_subscribe(6, move |thread_id, _ctx| {
                tx.send(thread_id).expect("report");
            });
        })
        .build()
        .expect("build");
    subscriber.start(Box::new(())).expect("start");

    // the already-UP target yields exactly one immediate notification
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).expect("notification"), 6);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    subscriber.stop();
    subscriber.join();
    target.stop();
    target.join();
}

#[test]
fn test_user_ctx_reaches_callbacks() {
    let registry = Registry::new();
    let (tx, rx) = mpsc::channel::<u32>();

    struct Ctx {
        seen: u32,
    }

    let tx_exit = tx.clone();
    let thread = EventThreadBuilder::new("ctx", 8)
        .registry(Arc::clone(&registry))
        .on_message(move |payload, ctx| {
            let ctx = ctx.downcast_mut::<Ctx>().expect("ctx type");
            ctx.seen += *payload.downcast_ref::<u32>().expect("u32");
            tx.send(ctx.seen).expect("report");
        })
        .on_exit(move |ctx| {
            let ctx = ctx.downcast_mut::<Ctx>().expect("ctx type");
            tx_exit.send(ctx.seen).expect("report");
        })
        .build()
        .expect("build");
    thread.start(Box::new(Ctx { seen: 0 })).expect("start");

    registry.message_send(8, Box::new(2u32)).expect("send");
    registry.message_send(8, Box::new(3u32)).expect("send");
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).expect("first"), 2);
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).expect("second"), 5);

    thread.stop();
    thread.join();
    // exit callback observed the accumulated context
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).expect("exit"), 5);
}

#[test]
fn test_suspend_and_resume() {
    let registry = Registry::new();
    let (tx, rx) = mpsc::channel::<&'static str>();

    let thread = EventThreadBuilder::new("susp", 10)
        .registry(Arc::clone(&registry))
        .on_message(move |payload, _ctx| {
            tx.send(*payload.downcast_ref::<&'static str>().expect("tag"))
                .expect("report");
        })
        .build()
        .expect("build");
    thread.start(Box::new(())).expect("start");
    while !thread.is_ready() {
        std::thread::sleep(Duration::from_millis(1));
    }

    let (suspend_tx, suspend_rx) = mpsc::channel::<()>();
    thread
        .suspend_req(move || {
            suspend_tx.send(()).expect("suspended");
        })
        .expect("suspend_req");
    suspend_rx.recv_timeout(RECV_TIMEOUT).expect("suspend ran");
    while !thread.is_suspended() {
        std::thread::sleep(Duration::from_millis(1));
    }

    // messages queue up while suspended
    registry.message_send(10, Box::new("after-resume")).expect("send");
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    thread.resume_req();
    assert_eq!(
        rx.recv_timeout(RECV_TIMEOUT).expect("delivery"),
        "after-resume"
    );

    thread.stop();
    thread.join();
}

#[test]
fn test_stop_while_suspended() {
    let registry = Registry::new();
    let thread = EventThreadBuilder::new("susp-stop", 11)
        .registry(Arc::clone(&registry))
        .build()
        .expect("build");
    thread.start(Box::new(())).expect("start");
    while !thread.is_ready() {
        std::thread::sleep(Duration::from_millis(1));
    }

    thread.suspend_req(|| {}).expect("suspend_req");
    while !thread.is_suspended() {
        std::thread::sleep(Duration::from_millis(1));
    }
    // stop must resume the parked thread so it can exit
    thread.stop();
    thread.join();
    assert!(!thread.is_running());
}

#[test]
fn test_wall_time_timer_on_event_thread() {
    let registry = Registry::new();
    let (tx, rx) = mpsc::channel::<f64>();

    let thread = EventThreadBuilder::new("evtimer", 12)
        .registry(Arc::clone(&registry))
        .on_init(move |_ctx| {
            let tx = tx.clone();
            let started = timestamp_now();
            let timer = EvTimer::new(0.05, 0.0, move || {
                tx.send(timestamp_now() - started).expect("report");
            });
            timer.start();
            // dropping the handle leaves the armed timer installed
        })
        .build()
        .expect("build");
    thread.start(Box::new(())).expect("start");

    let elapsed = rx.recv_timeout(RECV_TIMEOUT).expect("timer fired");
    assert!(elapsed >= 0.04, "fired too early: {}", elapsed);

    thread.stop();
    thread.join();
}

#[test]
fn test_periodic_wall_time_timer_repeat_and_stop() {
    let registry = Registry::new();
    let (tx, rx) = mpsc::channel::<()>();
    let fired = Arc::new(AtomicUsize::new(0));

    let fired_init = Arc::clone(&fired);
    let thread = EventThreadBuilder::new("evtimer-rep", 13)
        .registry(Arc::clone(&registry))
        .on_init(move |_ctx| {
            let tx = tx.clone();
            let fired = Arc::clone(&fired_init);
            // the callback stops its own timer after three firings; the
            // handle reaches the closure through a shared slot
            let slot: Rc<RefCell<Option<EvTimer>>> = Rc::new(RefCell::new(None));
            let slot_cb = Rc::clone(&slot);
            let timer = EvTimer::new(0.02, 0.02, move || {
                if fired.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                    if let Some(timer) = slot_cb.borrow().as_ref() {
                        timer.stop();
                    }
                    tx.send(()).expect("report");
                }
            });
            timer.start();
            *slot.borrow_mut() = Some(timer);
        })
        .build()
        .expect("build");
    thread.start(Box::new(())).expect("start");

    rx.recv_timeout(RECV_TIMEOUT).expect("three firings");
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fired.load(Ordering::SeqCst), 3, "timer kept firing after stop");

    thread.stop();
    thread.join();
}

#[test]
fn test_io_watcher_on_pipe() {
    let registry = Registry::new();
    let (tx, rx) = mpsc::channel::<Vec<u8>>();

    // plain pipe: read end watched by the event thread
    let mut fds = [0i32; 2];
    // SAFETY: fds is a valid two-element buffer.
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let thread = EventThreadBuilder::new("io", 14)
        .registry(Arc::clone(&registry))
        .on_init(move |_ctx| {
            let tx = tx.clone();
            let io = Io::new(read_fd, Events::READ, move |fd, events| {
                assert!(events.readable());
                let mut buf = [0u8; 16];
                // SAFETY: reading into a stack buffer from the pipe fd.
                let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 16) };
                assert!(n > 0);
                tx.send(buf[..n as usize].to_vec()).expect("report");
            });
            io.start().expect("io start");
        })
        .build()
        .expect("build");
    thread.start(Box::new(())).expect("start");

    // SAFETY: writing a short byte string to the pipe's write end.
    let n = unsafe { libc::write(write_fd, b"ping".as_ptr() as *const libc::c_void, 4) };
    assert_eq!(n, 4);

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).expect("io event"), b"ping");

    thread.stop();
    thread.join();
    // SAFETY: both ends still open and owned by the test.
    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

#[test]
fn test_prepare_hook_runs_before_waits() {
    let registry = Registry::new();
    let (tx, rx) = mpsc::channel::<usize>();
    let count = Arc::new(AtomicUsize::new(0));

    let count_init = Arc::clone(&count);
    let thread = EventThreadBuilder::new("prep", 15)
        .registry(Arc::clone(&registry))
        .on_init(move |_ctx| {
            let count = Arc::clone(&count_init);
            let tx = tx.clone();
            let prepare = Prepare::new(move || {
                let seen = count.fetch_add(1, Ordering::SeqCst) + 1;
                if seen == 1 {
                    tx.send(seen).expect("report");
                }
            });
            prepare.start();
        })
        .build()
        .expect("build");
    thread.start(Box::new(())).expect("start");

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).expect("prepare ran"), 1);

    thread.stop();
    thread.join();
    assert!(count.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_ipc_provider_contract() {
    // crossbeam senders because IpcProvider must be Sync
    use crossbeam::channel;

    struct FakeIpc {
        read_fd: i32,
        fd_tx: channel::Sender<u8>,
        timer_tx: channel::Sender<()>,
        mode: channel::Sender<&'static str>,
    }

    impl IpcProvider for FakeIpc {
        fn init_sync(&self, thread_id: u8, infra: IpcInfra) {
            self.mode.send("sync").expect("mode");
            self.install(thread_id, infra);
        }

        fn init_async(&self, thread_id: u8, infra: IpcInfra) {
            self.mode.send("async").expect("mode");
            self.install(thread_id, infra);
        }
    }

    impl FakeIpc {
        fn install(&self, _thread_id: u8, infra: IpcInfra) {
            let fd_tx = self.fd_tx.clone();
            infra
                .fd_watch(self.read_fd, move |fd| {
                    let mut byte = 0u8;
                    // SAFETY: one-byte read from the pipe fd.
                    let n = unsafe {
                        libc::read(fd, &mut byte as *mut u8 as *mut libc::c_void, 1)
                    };
                    assert_eq!(n, 1);
                    fd_tx.send(byte).expect("report");
                })
                .expect("fd_watch");

            let timer_tx = self.timer_tx.clone();
            infra.timer_add(0.03, move || {
                timer_tx.send(()).expect("report");
            });
        }
    }

    let registry = Registry::new();
    let mut fds = [0i32; 2];
    // SAFETY: fds is a valid two-element buffer.
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let (fd_tx, fd_rx) = channel::unbounded();
    let (timer_tx, timer_rx) = channel::unbounded();
    let (mode_tx, mode_rx) = channel::unbounded();

    let thread = EventThreadBuilder::new("ipc", 16)
        .registry(Arc::clone(&registry))
        .sync_ipc(true)
        .ipc_provider(Arc::new(FakeIpc {
            read_fd,
            fd_tx,
            timer_tx,
            mode: mode_tx,
        }))
        .build()
        .expect("build");
    thread.start(Box::new(())).expect("start");

    assert_eq!(mode_rx.recv_timeout(RECV_TIMEOUT).expect("mode"), "sync");

    // the provider's timer watcher fires on the thread
    timer_rx.recv_timeout(RECV_TIMEOUT).expect("ipc timer");

    // the provider's fd watcher sees traffic
    // SAFETY: one-byte write to the pipe's write end.
    let n = unsafe { libc::write(write_fd, &7u8 as *const u8 as *const libc::c_void, 1) };
    assert_eq!(n, 1);
    assert_eq!(fd_rx.recv_timeout(RECV_TIMEOUT).expect("ipc fd"), 7);

    thread.stop();
    thread.join();
    // SAFETY: both ends still open and owned by the test.
    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

#[test]
fn test_timestamp_now_is_loop_cached_inside_thread() {
    let registry = Registry::new();
    let (tx, rx) = mpsc::channel::<(f64, f64)>();

    let thread = EventThreadBuilder::new("ts", 17)
        .registry(Arc::clone(&registry))
        .on_message(move |_payload, _ctx| {
            // two reads within one dispatch see the same cached time
            tx.send((timestamp_now(), timestamp_now())).expect("report");
        })
        .build()
        .expect("build");
    thread.start(Box::new(())).expect("start");

    registry.message_send(17, Box::new(())).expect("send");
    let (a, b) = rx.recv_timeout(RECV_TIMEOUT).expect("delivery");
    assert_eq!(a, b);
    assert!((timestamp_now() - a).abs() < 5.0);

    thread.stop();
    thread.join();
}

#[test]
#[should_panic(expected = "affinity violation")]
fn test_watcher_outside_event_thread_panics() {
    let io = Io::new(0, Events::READ, |_, _| {});
    let _ = io.start();
}

#[test]
fn test_timer_again_rearms_from_repeat() {
    let registry = Registry::new();
    let (tx, rx) = mpsc::channel::<()>();

    let thread = EventThreadBuilder::new("again", 18)
        .registry(Arc::clone(&registry))
        .on_init(move |_ctx| {
            let tx = tx.clone();
            // initial delay is far out; again() re-arms from the repeat
            // value instead
            let timer = EvTimer::new(30.0, 0.05, move || {
                tx.send(()).expect("report");
            });
            timer.start();
            timer.again();
        })
        .build()
        .expect("build");
    thread.start(Box::new(())).expect("start");

    rx.recv_timeout(Duration::from_secs(2))
        .expect("again() must fire from the repeat interval");

    thread.stop();
    thread.join();
}

#[test]
fn test_global_registry_message_send() {
    // ids high in the range to stay clear of other tests' registries
    let (tx, rx) = mpsc::channel::<u16>();
    let thread = EventThreadBuilder::new("global-rx", 200)
        .on_message(move |payload, _ctx| {
            tx.send(*payload.downcast_ref::<u16>().expect("u16"))
                .expect("report");
        })
        .build()
        .expect("build");
    thread.start(Box::new(())).expect("start");

    message_send(200, Box::new(31u16)).expect("send");
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).expect("delivery"), 31);

    thread.stop();
    thread.join();
}
