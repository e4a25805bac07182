//! Handler installation, in its own test binary so the process-wide
//! dispositions do not leak into other tests.

use forkpipe::SignalState;
use forkpipe::signals::{install_supervisor, install_worker};
use nix::sys::signal::{Signal, raise};

#[test]
fn handlers_only_record_flags() {
    let state = install_supervisor().unwrap();
    assert!(std::ptr::eq(state, SignalState::global()));
    state.reset();

    // SIGCHLD is counted, not acted upon.
    raise(Signal::SIGCHLD).unwrap();
    raise(Signal::SIGCHLD).unwrap();
    assert!(state.take_child_events() >= 1);
    assert_eq!(state.termination(), None);

    // Termination signals are recorded and the process keeps running; the
    // first one is the one reported.
    raise(Signal::SIGPIPE).unwrap();
    raise(Signal::SIGTERM).unwrap();
    assert_eq!(state.termination(), Some(Signal::SIGPIPE));

    // A worker keeps a pending termination but not the parent's child events.
    raise(Signal::SIGCHLD).unwrap();
    let worker = install_worker().unwrap();
    assert_eq!(worker.termination(), Some(Signal::SIGPIPE));
    assert_eq!(worker.take_child_events(), 0);

    // Workers do not watch SIGCHLD at all.
    raise(Signal::SIGCHLD).unwrap();
    assert_eq!(worker.take_child_events(), 0);

    raise(Signal::SIGINT).unwrap();
    assert_eq!(worker.termination(), Some(Signal::SIGPIPE));
    worker.reset();
    raise(Signal::SIGINT).unwrap();
    assert_eq!(worker.termination(), Some(Signal::SIGINT));
}
