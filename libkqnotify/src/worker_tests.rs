// libkqnotify/src/worker_tests.rs

use super::worker::{self, SessionState};
use crate::config::Config;
use crate::error::Error;
use crate::mask::EventMask;
use crate::session::{InitFlags, Inotify};
use crate::test_utils::{drain_for, poll_session, read_records, settle, ControlledSource};
use std::fs;
use std::os::unix::net::UnixStream;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const DIR_EVENTS: EventMask = EventMask::CREATE
    .union(EventMask::DELETE)
    .union(EventMask::MOVE);

fn named(s: &str) -> Option<String> {
    Some(s.to_owned())
}

#[test]
fn create_delete_rename_in_watched_directory() {
    let tmp = tempdir().unwrap();
    fs::write(tmp.path().join("1"), b"").unwrap();
    fs::write(tmp.path().join("2"), b"").unwrap();

    let s = poll_session();
    let wd = s.add_watch(tmp.path(), DIR_EVENTS).unwrap();
    assert_eq!(wd, 1);
    settle();

    fs::write(tmp.path().join("3"), b"").unwrap();
    assert_eq!(
        read_records(&s, 1),
        vec![(wd, EventMask::CREATE.bits(), 0, named("3"))]
    );
    settle();

    fs::remove_file(tmp.path().join("2")).unwrap();
    assert_eq!(
        read_records(&s, 1),
        vec![(wd, EventMask::DELETE.bits(), 0, named("2"))]
    );
    settle();

    fs::rename(tmp.path().join("1"), tmp.path().join("one")).unwrap();
    let ev = read_records(&s, 2);
    assert_eq!(ev.len(), 2, "got {ev:?}");
    assert_eq!((ev[0].0, ev[0].1, &ev[0].3), (wd, EventMask::MOVED_FROM.bits(), &named("1")));
    assert_eq!((ev[1].0, ev[1].1, &ev[1].3), (wd, EventMask::MOVED_TO.bits(), &named("one")));
    assert_ne!(ev[0].2, 0, "rename halves carry a cookie");
    assert_eq!(ev[0].2, ev[1].2);
}

#[test]
fn subdirectories_carry_isdir() {
    let tmp = tempdir().unwrap();
    let s = poll_session();
    let wd = s.add_watch(tmp.path(), DIR_EVENTS).unwrap();
    settle();

    fs::create_dir(tmp.path().join("sub")).unwrap();
    assert_eq!(
        read_records(&s, 1),
        vec![(wd, (EventMask::CREATE | EventMask::ISDIR).bits(), 0, named("sub"))]
    );
}

#[test]
fn rename_onto_existing_entry_is_a_plain_move() {
    let tmp = tempdir().unwrap();
    fs::write(tmp.path().join("foo"), b"old").unwrap();
    fs::write(tmp.path().join("bar"), b"new").unwrap();

    let s = poll_session();
    let wd = s.add_watch(tmp.path(), DIR_EVENTS).unwrap();
    settle();

    fs::rename(tmp.path().join("bar"), tmp.path().join("foo")).unwrap();
    let ev = read_records(&s, 2);
    let kinds: Vec<_> = ev.iter().map(|e| (e.0, e.1, e.3.clone())).collect();
    assert_eq!(
        kinds,
        vec![
            (wd, EventMask::MOVED_FROM.bits(), named("bar")),
            (wd, EventMask::MOVED_TO.bits(), named("foo")),
        ]
    );
    // nothing about the replaced foo
    assert!(drain_for(&s, Duration::from_millis(100)).is_empty());
}

#[test]
fn overwrite_from_outside_is_delete_then_create() {
    let base = tempdir().unwrap();
    let watched = base.path().join("watched");
    let outside = base.path().join("outside");
    fs::create_dir(&watched).unwrap();
    fs::create_dir(&outside).unwrap();
    fs::write(watched.join("f"), b"old").unwrap();
    fs::write(outside.join("g"), b"new").unwrap();

    let s = poll_session();
    let wd = s.add_watch(&watched, DIR_EVENTS).unwrap();
    settle();

    fs::rename(outside.join("g"), watched.join("f")).unwrap();
    assert_eq!(
        read_records(&s, 2),
        vec![
            (wd, EventMask::DELETE.bits(), 0, named("f")),
            (wd, EventMask::CREATE.bits(), 0, named("f")),
        ]
    );
}

#[test]
fn rm_watch_queues_ignored_then_forgets() {
    let tmp = tempdir().unwrap();
    let s = poll_session();
    let wd = s.add_watch(tmp.path(), DIR_EVENTS).unwrap();

    s.rm_watch(wd).unwrap();
    assert_eq!(
        read_records(&s, 1),
        vec![(wd, EventMask::IGNORED.bits(), 0, None)]
    );
    assert!(matches!(s.rm_watch(wd), Err(Error::NotFound(_))));

    // descriptors are never handed out twice
    let again = s.add_watch(tmp.path(), DIR_EVENTS).unwrap();
    assert!(again > wd);
}

#[test]
fn deleting_watched_directory_ends_the_watch() {
    let tmp = tempdir().unwrap();
    let victim = tmp.path().join("victim");
    fs::create_dir(&victim).unwrap();

    let s = poll_session();
    let wd = s.add_watch(&victim, EventMask::DELETE_SELF).unwrap();
    settle();

    fs::remove_dir(&victim).unwrap();
    let ev = read_records(&s, 2);
    assert_eq!(ev.len(), 2, "got {ev:?}");
    assert_eq!(ev[0].0, wd);
    assert_ne!(ev[0].1 & EventMask::DELETE_SELF.bits(), 0);
    assert_eq!(ev[1], (wd, EventMask::IGNORED.bits(), 0, None));

    assert!(matches!(s.rm_watch(wd), Err(Error::NotFound(_))));
}

#[test]
fn unlinking_one_of_two_links_is_attrib() {
    let tmp = tempdir().unwrap();
    let f = tmp.path().join("f");
    fs::write(&f, b"x").unwrap();
    fs::hard_link(&f, tmp.path().join("g")).unwrap();

    let s = poll_session();
    let wd = s
        .add_watch(&f, EventMask::ATTRIB | EventMask::DELETE_SELF)
        .unwrap();
    settle();

    fs::remove_file(&f).unwrap();
    let ev = read_records(&s, 1);
    assert_eq!(ev, vec![(wd, EventMask::ATTRIB.bits(), 0, None)]);
    assert!(drain_for(&s, Duration::from_millis(100))
        .iter()
        .all(|e| e.1 & EventMask::IGNORED.bits() == 0));
}

#[test]
fn onlydir_rejects_files() {
    let tmp = tempdir().unwrap();
    let f = tmp.path().join("plain");
    fs::write(&f, b"").unwrap();

    let s = poll_session();
    let err = s
        .add_watch(&f, EventMask::CREATE | EventMask::ONLYDIR)
        .unwrap_err();
    assert!(matches!(err, Error::NotADirectory(_)));
    assert_eq!(err.errno(), libc::ENOTDIR);

    // nothing was allocated for the failed call
    assert_eq!(s.add_watch(tmp.path(), DIR_EVENTS).unwrap(), 1);
}

#[test]
fn missing_path_is_not_found() {
    let tmp = tempdir().unwrap();
    let s = poll_session();
    let err = s
        .add_watch(tmp.path().join("nope"), EventMask::CREATE)
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(err.errno(), libc::ENOENT);
}

#[test]
fn unreadable_directory_is_permission_denied() {
    use std::os::unix::fs::PermissionsExt;

    // root reads through any mode bits
    if unsafe { libc::geteuid() } == 0 {
        return;
    }
    let tmp = tempdir().unwrap();
    let locked = tmp.path().join("locked");
    fs::create_dir(&locked).unwrap();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o100)).unwrap();

    let s = poll_session();
    let res = s.add_watch(&locked, EventMask::CREATE);
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o700)).unwrap();
    let err = res.unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)), "{err:?}");
    assert_eq!(err.errno(), libc::EACCES);
}

#[test]
fn same_object_keeps_its_descriptor() {
    let tmp = tempdir().unwrap();
    let a = tmp.path().join("a");
    let b = tmp.path().join("b");
    fs::create_dir(&a).unwrap();
    fs::create_dir(&b).unwrap();

    let s = poll_session();
    let wa = s.add_watch(&a, EventMask::CREATE).unwrap();
    let wb = s.add_watch(&b, EventMask::CREATE).unwrap();
    assert_ne!(wa, wb);
    assert_eq!(s.add_watch(&a, EventMask::DELETE).unwrap(), wa);
    // another path to the same directory
    assert_eq!(s.add_watch(a.join("."), EventMask::DELETE).unwrap(), wa);
}

#[test]
fn mask_add_merges_and_plain_add_replaces() {
    let tmp = tempdir().unwrap();
    let s = poll_session();
    let wd = s.add_watch(tmp.path(), EventMask::CREATE).unwrap();
    assert_eq!(
        s.add_watch(tmp.path(), EventMask::DELETE | EventMask::MASK_ADD)
            .unwrap(),
        wd
    );
    settle();

    fs::write(tmp.path().join("x"), b"").unwrap();
    assert_eq!(
        read_records(&s, 1),
        vec![(wd, EventMask::CREATE.bits(), 0, named("x"))]
    );
    settle();
    fs::remove_file(tmp.path().join("x")).unwrap();
    assert_eq!(
        read_records(&s, 1),
        vec![(wd, EventMask::DELETE.bits(), 0, named("x"))]
    );

    // replace: CREATE is no longer wanted
    assert_eq!(s.add_watch(tmp.path(), EventMask::DELETE).unwrap(), wd);
    settle();
    fs::write(tmp.path().join("y"), b"").unwrap();
    assert!(drain_for(&s, Duration::from_millis(150)).is_empty());
    fs::remove_file(tmp.path().join("y")).unwrap();
    assert_eq!(
        read_records(&s, 1),
        vec![(wd, EventMask::DELETE.bits(), 0, named("y"))]
    );
}

#[test]
fn oneshot_fires_once_until_rearmed() {
    let tmp = tempdir().unwrap();
    let s = poll_session();
    let wd = s
        .add_watch(tmp.path(), EventMask::CREATE | EventMask::ONESHOT)
        .unwrap();
    settle();

    fs::write(tmp.path().join("a"), b"").unwrap();
    assert_eq!(
        read_records(&s, 1),
        vec![(wd, EventMask::CREATE.bits(), 0, named("a"))]
    );
    settle();
    fs::write(tmp.path().join("b"), b"").unwrap();
    assert!(drain_for(&s, Duration::from_millis(150)).is_empty());

    assert_eq!(s.add_watch(tmp.path(), EventMask::CREATE).unwrap(), wd);
    settle();
    fs::write(tmp.path().join("c"), b"").unwrap();
    assert_eq!(
        read_records(&s, 1),
        vec![(wd, EventMask::CREATE.bits(), 0, named("c"))]
    );
}

#[test]
fn child_modify_names_the_entry() {
    let tmp = tempdir().unwrap();
    let f = tmp.path().join("log");
    fs::write(&f, b"a").unwrap();

    let s = poll_session();
    let wd = s.add_watch(tmp.path(), EventMask::MODIFY).unwrap();
    settle();

    fs::write(&f, b"abc").unwrap();
    let ev = read_records(&s, 1);
    assert!(!ev.is_empty());
    assert_eq!(ev[0], (wd, EventMask::MODIFY.bits(), 0, named("log")));
}

#[test]
fn session_reports_active_until_closed() {
    let s = poll_session();
    assert_eq!(s.state(), SessionState::Active);
    s.close().unwrap();
}

#[test]
fn callers_waiting_at_hangup_all_get_an_answer() {
    let tmp = tempdir().unwrap();
    let (consumer, control) = UnixStream::pair().unwrap();
    let (source, _switches) = ControlledSource::new();
    let handle =
        Arc::new(worker::spawn(&Config::default(), control, Box::new(source), -1).unwrap());

    let start = Arc::new(Barrier::new(9));
    let callers: Vec<_> = (0..8)
        .map(|i| {
            let dir = tmp.path().join(format!("d{i}"));
            fs::create_dir(&dir).unwrap();
            let handle = Arc::clone(&handle);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                handle.add_or_modify(&dir, EventMask::CREATE)
            })
        })
        .collect();
    start.wait();
    drop(consumer);

    let deadline = Instant::now() + Duration::from_secs(5);
    for caller in callers {
        while !caller.is_finished() {
            assert!(Instant::now() < deadline, "a caller never got its reply");
            thread::sleep(Duration::from_millis(5));
        }
        match caller.join().unwrap() {
            Ok(wd) => assert!(wd > 0),
            Err(Error::AlreadyClosed) => {}
            Err(e) => panic!("unexpected {e}"),
        }
    }

    handle.join();
    assert_eq!(handle.state(), SessionState::Closed);
    assert!(matches!(
        handle.add_or_modify(tmp.path(), EventMask::CREATE),
        Err(Error::AlreadyClosed)
    ));
}

/// Lift the soft descriptor limit to `want` if the hard limit allows it.
fn raise_fd_limit(want: u64) -> bool {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) } != 0 {
        return false;
    }
    let want = want as libc::rlim_t;
    if lim.rlim_cur >= want {
        return true;
    }
    if lim.rlim_max < want {
        return false;
    }
    lim.rlim_cur = want;
    unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &lim) == 0 }
}

#[test]
fn backlog_beyond_socket_space_drains_without_rescans() {
    // every entry holds a sub-watch descriptor
    const FILES: usize = 1_500;
    if !raise_fd_limit(8_192) {
        return;
    }
    let tmp = tempdir().unwrap();
    let (source, switches) = ControlledSource::new();
    let s = Inotify::with_source(InitFlags::NONBLOCK, &Config::default(), Box::new(source))
        .unwrap();
    let wd = s.add_watch(tmp.path(), EventMask::CREATE).unwrap();

    // ~336 KiB of records, more than a default socket buffer holds
    let pad = "x".repeat(196);
    let names: Vec<String> = (0..FILES).map(|i| format!("{i:04}{pad}")).collect();
    for n in &names {
        fs::write(tmp.path().join(n), b"").unwrap();
    }
    settle();

    // one scan, then the source goes quiet and asks for no timer
    switches.open.store(true, Ordering::SeqCst);
    assert_eq!(s.add_watch(tmp.path(), EventMask::CREATE).unwrap(), wd);

    let ev = read_records(&s, FILES);
    assert_eq!(ev.len(), FILES);
    for (rec, name) in ev.iter().zip(&names) {
        assert_eq!(rec, &(wd, EventMask::CREATE.bits(), 0, Some(name.clone())));
    }
}
