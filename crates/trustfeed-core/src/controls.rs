//! Start/stop/pause/resume lifecycle shared by background components
//!
//! A component hands [`Controls`] a start function, which returns the
//! callback that stops it again, and optionally a pause function, which
//! returns the callback that resumes it. `Controls` owns the captured
//! callbacks and the state machine:
//!
//! ```text
//! Stopped --start--> Started --pause--> Paused
//!    ^                  |  ^               |
//!    +------stop--------+  +----resume-----+
//! ```
//!
//! Stopping while paused resumes first.

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{NodeError, NodeResult};

/// Stops a started component
pub type StopFn = Box<dyn FnOnce() + Send>;

/// Resumes a paused component
pub type ResumeFn = Box<dyn FnOnce() + Send>;

type StartFn = Box<dyn FnMut() -> NodeResult<StopFn> + Send>;
type PauseFn = Box<dyn FnMut() -> ResumeFn + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Stopped,
    Started,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Started,
    Stopped,
    Paused,
    Resumed,
}

enum Phase {
    Stopped,
    Started { stop: StopFn },
    Paused { stop: StopFn, resume: ResumeFn },
}

impl Phase {
    fn state(&self) -> ControlState {
        match self {
            Phase::Stopped => ControlState::Stopped,
            Phase::Started { .. } => ControlState::Started,
            Phase::Paused { .. } => ControlState::Paused,
        }
    }
}

struct Inner {
    phase: Phase,
    start: StartFn,
    pause: Option<PauseFn>,
}

pub struct Controls {
    name: &'static str,
    inner: Mutex<Inner>,
    events: broadcast::Sender<ControlEvent>,
}

impl Controls {
    pub fn new<S>(name: &'static str, start: S) -> Self
    where
        S: FnMut() -> NodeResult<StopFn> + Send + 'static,
    {
        let (events, _) = broadcast::channel(16);
        Self {
            name,
            inner: Mutex::new(Inner {
                phase: Phase::Stopped,
                start: Box::new(start),
                pause: None,
            }),
            events,
        }
    }

    /// Make the component pausable
    pub fn with_pause<P>(self, pause: P) -> Self
    where
        P: FnMut() -> ResumeFn + Send + 'static,
    {
        self.inner.lock().pause = Some(Box::new(pause));
        self
    }

    pub fn state(&self) -> ControlState {
        self.inner.lock().phase.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ControlState::Started
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ControlEvent) {
        debug!(component = self.name, ?event, "lifecycle");
        let _ = self.events.send(event);
    }

    /// No-op unless stopped
    pub fn start(&self) -> NodeResult<()> {
        let mut inner = self.inner.lock();
        if !matches!(inner.phase, Phase::Stopped) {
            return Ok(());
        }
        let stop = (inner.start)()?;
        inner.phase = Phase::Started { stop };
        drop(inner);
        self.emit(ControlEvent::Started);
        Ok(())
    }

    /// No-op while stopped; resumes first while paused
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        let mut events = Vec::new();
        match std::mem::replace(&mut inner.phase, Phase::Stopped) {
            Phase::Stopped => return,
            Phase::Started { stop } => {
                stop();
            }
            Phase::Paused { stop, resume } => {
                resume();
                events.push(ControlEvent::Resumed);
                stop();
            }
        }
        drop(inner);
        events.push(ControlEvent::Stopped);
        for event in events {
            self.emit(event);
        }
    }

    /// Fails while stopped or when the component cannot pause
    pub fn pause(&self) -> NodeResult<()> {
        let mut inner = self.inner.lock();
        let Inner { phase, pause, .. } = &mut *inner;
        match std::mem::replace(phase, Phase::Stopped) {
            Phase::Stopped => Err(NodeError::Control(format!(
                "{}: pause while stopped",
                self.name
            ))),
            Phase::Paused { stop, resume } => {
                *phase = Phase::Paused { stop, resume };
                Ok(())
            }
            Phase::Started { stop } => match pause {
                Some(pause) => {
                    let resume = pause();
                    *phase = Phase::Paused { stop, resume };
                    drop(inner);
                    self.emit(ControlEvent::Paused);
                    Ok(())
                }
                None => {
                    *phase = Phase::Started { stop };
                    Err(NodeError::Control(format!("{} cannot pause", self.name)))
                }
            },
        }
    }

    /// Fails while stopped; no-op while started
    pub fn resume(&self) -> NodeResult<()> {
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut inner.phase, Phase::Stopped) {
            Phase::Stopped => Err(NodeError::Control(format!(
                "{}: resume while stopped",
                self.name
            ))),
            Phase::Started { stop } => {
                inner.phase = Phase::Started { stop };
                Ok(())
            }
            Phase::Paused { stop, resume } => {
                resume();
                inner.phase = Phase::Started { stop };
                drop(inner);
                self.emit(ControlEvent::Resumed);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Records every callback invocation
    fn recorded() -> (Controls, Arc<Mutex<Vec<&'static str>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let c1 = calls.clone();
        let c2 = calls.clone();
        let controls = Controls::new("test", move || {
            c1.lock().push("start");
            let c = c1.clone();
            Ok(Box::new(move || c.lock().push("stop")) as StopFn)
        })
        .with_pause(move || {
            c2.lock().push("pause");
            let c = c2.clone();
            Box::new(move || c.lock().push("resume")) as ResumeFn
        });
        (controls, calls)
    }

    #[test]
    fn test_full_cycle() {
        let (controls, calls) = recorded();
        let mut events = controls.subscribe();

        controls.start().unwrap();
        assert!(controls.is_running());
        controls.pause().unwrap();
        assert_eq!(controls.state(), ControlState::Paused);
        controls.resume().unwrap();
        controls.stop();
        assert_eq!(controls.state(), ControlState::Stopped);

        assert_eq!(*calls.lock(), vec!["start", "pause", "resume", "stop"]);
        let mut seen = Vec::new();
        while let Ok(e) = events.try_recv() {
            seen.push(e);
        }
        assert_eq!(
            seen,
            vec![
                ControlEvent::Started,
                ControlEvent::Paused,
                ControlEvent::Resumed,
                ControlEvent::Stopped
            ]
        );
    }

    #[test]
    fn test_stop_while_paused_resumes_first() {
        let (controls, calls) = recorded();
        controls.start().unwrap();
        controls.pause().unwrap();
        controls.stop();
        assert_eq!(*calls.lock(), vec!["start", "pause", "resume", "stop"]);
    }

    #[test]
    fn test_harmless_repeats_are_noops() {
        let (controls, calls) = recorded();
        controls.stop();
        controls.start().unwrap();
        controls.start().unwrap();
        controls.resume().unwrap();
        controls.pause().unwrap();
        controls.pause().unwrap();
        assert_eq!(*calls.lock(), vec!["start", "pause"]);
    }

    #[test]
    fn test_misuse_is_an_error() {
        let (controls, _) = recorded();
        assert!(matches!(controls.pause(), Err(NodeError::Control(_))));
        assert!(matches!(controls.resume(), Err(NodeError::Control(_))));

        let unpausable = Controls::new("plain", || Ok(Box::new(|| {}) as StopFn));
        unpausable.start().unwrap();
        assert!(matches!(unpausable.pause(), Err(NodeError::Control(_))));
        assert!(unpausable.is_running());
    }

    #[test]
    fn test_failed_start_stays_stopped() {
        let controls = Controls::new("broken", || Err(NodeError::Blockchain("no rpc".into())));
        assert!(controls.start().is_err());
        assert_eq!(controls.state(), ControlState::Stopped);
    }
}
