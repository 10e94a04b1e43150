use std::{cmp::Ordering, collections::BTreeSet, fmt::Debug};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    event::{OnEvent, SendEvent},
    unordered::{Net, Object, Unordered},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum Mode {
    Paused = 1,
    Running = 2,
}

impl From<Mode> for i32 {
    fn from(value: Mode) -> Self {
        value as _
    }
}

impl TryFrom<i32> for Mode {
    type Error = anyhow::Error;

    fn try_from(value: i32) -> anyhow::Result<Self> {
        match value {
            1 => Ok(Self::Paused),
            2 => Ok(Self::Running),
            _ => Err(anyhow::anyhow!("invalid mode {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum Kind {
    Run = 1,
    Pause = 2,
    Reset = 3,
}

impl From<Kind> for i32 {
    fn from(value: Kind) -> Self {
        value as _
    }
}

impl TryFrom<i32> for Kind {
    type Error = anyhow::Error;

    fn try_from(value: i32) -> anyhow::Result<Self> {
        match value {
            1 => Ok(Self::Run),
            2 => Ok(Self::Pause),
            3 => Ok(Self::Reset),
            _ => Err(anyhow::anyhow!("invalid event kind {value}")),
        }
    }
}

// one entry of the shared log: something happened to the watch at group
// time `at`. the total order over `(at, kind)` is what every replica sorts
// its log by, so it must not depend on insertion order; `total_cmp` keeps
// it total over any f64 the wire can carry
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Event {
    pub at: f64,
    pub kind: Kind,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.total_cmp(&other.at).then(self.kind.cmp(&other.kind))
    }
}

// while RUNNING `timeval` is the group-time epoch (displayed elapsed is
// group time minus epoch); while PAUSED it is the frozen elapsed value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub mode: Mode,
    pub timeval: f64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            mode: Mode::Paused,
            timeval: 0.,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub init: State,
    pub events: Vec<Event>,
}

fn fold<'a>(init: State, events: impl IntoIterator<Item = &'a Event>) -> State {
    let State {
        mut mode,
        mut timeval,
    } = init;
    for event in events {
        match (mode, event.kind) {
            (Mode::Paused, Kind::Run) => {
                mode = Mode::Running;
                timeval = event.at - timeval
            }
            (Mode::Paused, Kind::Reset) => timeval = 0.,
            (Mode::Paused, Kind::Pause) => {}
            (Mode::Running, Kind::Pause) => {
                mode = Mode::Paused;
                timeval = event.at - timeval
            }
            (Mode::Running, Kind::Reset) => timeval = event.at,
            (Mode::Running, Kind::Run) => {}
        }
    }
    State { mode, timeval }
}

type Listener = Box<dyn SendEvent<State> + Send>;

// shared stopwatch: a grow-only event log plus the deterministic fold of it.
// the log converges by set union, so the folded state converges too; any
// event may arrive twice or arbitrarily late and only novel entries matter
pub struct Watch {
    init: State,
    history: BTreeSet<Event>,
    state: State,
    listeners: Vec<Listener>,
}

impl Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("init", &self.init)
            .field("history", &self.history)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Default for Watch {
    fn default() -> Self {
        let init = State::default();
        Self {
            init,
            state: init,
            history: BTreeSet::new(),
            listeners: Vec::new(),
        }
    }
}

impl Watch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> State {
        self.state
    }

    fn insert(&mut self, event: Event) -> bool {
        self.history.insert(event)
    }

    fn refold(&mut self) -> bool {
        let state = fold(self.init, &self.history);
        if state != self.state {
            self.state = state;
            true
        } else {
            false
        }
    }

    fn notify(&mut self) {
        for listener in &mut self.listeners {
            if let Err(err) = listener.send(self.state) {
                warn!("watch listener: {err}")
            }
        }
    }

    pub fn subscribe(&mut self, mut listener: Listener) -> anyhow::Result<()> {
        listener.send(self.state)?;
        self.listeners.push(listener);
        Ok(())
    }

    // host restore: replace the baseline and forget the log
    pub fn reset(&mut self, init: State) {
        self.init = init;
        self.history.clear();
        self.refold();
    }
}

impl Object for Watch {
    type Message = Event;
    type History = History;

    fn receive_message(&mut self, event: Event) -> anyhow::Result<Option<Event>> {
        if !self.insert(event) {
            return Ok(None);
        }
        if !self.refold() {
            return Ok(None);
        }
        self.notify();
        // relay novel state-changing events so stragglers behind a lossy hop
        // still hear about them; the novelty check terminates the flood
        Ok(Some(event))
    }

    fn get_history(&self) -> History {
        History {
            init: self.init,
            events: self.history.iter().copied().collect(),
        }
    }

    fn add_history(&mut self, history: History) -> anyhow::Result<()> {
        self.init = history.init;
        for event in history.events {
            self.insert(event);
        }
        if self.refold() {
            self.notify()
        }
        Ok(())
    }
}

pub mod events {
    use crate::event::SendEvent;

    #[derive(Debug)]
    pub struct FromView(pub super::Event);

    #[derive(Debug)]
    pub struct Reset(pub super::State);

    pub struct Subscribe(pub Box<dyn SendEvent<super::State> + Send>);
}

impl<N: Net<Watch>> OnEvent<events::FromView> for Unordered<Watch, N> {
    fn on_event(&mut self, events::FromView(event): events::FromView) -> anyhow::Result<()> {
        let object = self.object_mut()?;
        if object.insert(event) {
            object.refold();
            object.notify();
            self.broadcast(event)
        } else {
            // a desynchronized clock can make a button click produce an event
            // in the causal past that changes nothing; the view still gets a
            // callback so the button falls back in line with the model
            object.notify();
            Ok(())
        }
    }
}

impl<N: Net<Watch>> OnEvent<events::Reset> for Unordered<Watch, N> {
    fn on_event(&mut self, events::Reset(init): events::Reset) -> anyhow::Result<()> {
        self.object_mut()?.reset(init);
        Ok(())
    }
}

impl<N: Net<Watch>> OnEvent<events::Subscribe> for Unordered<Watch, N> {
    fn on_event(&mut self, events::Subscribe(listener): events::Subscribe) -> anyhow::Result<()> {
        self.object_mut()?.subscribe(listener)
    }
}

// lap mark in group seconds, totally ordered so marks can live in a sorted
// grow-only set
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Mark(pub f64);

impl PartialEq for Mark {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Mark {}

impl PartialOrd for Mark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Mark {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::{
        net::events::Recv,
        tube::{Addressed, Granted, PeerName, Recorder},
        unordered::{events::Register, Message},
    };

    use super::*;

    fn at(at: f64, kind: Kind) -> Event {
        Event { at, kind }
    }

    #[test]
    fn fold_of_shuffled_log() -> anyhow::Result<()> {
        let mut watch = Watch::new();
        // delivery order scrambled on purpose
        for event in [
            at(25., Kind::Reset),
            at(10., Kind::Run),
            at(20., Kind::Run),
            at(15., Kind::Pause),
        ] {
            watch.receive_message(event)?;
        }
        assert_eq!(
            watch.state(),
            State {
                mode: Mode::Running,
                timeval: 25.
            }
        );
        // a straggler from the causal past recomputes deterministically:
        // run 10, pause 15, run 20, pause 22 freeze elapsed at 7, then the
        // reset at 25 lands while paused and zeroes it
        watch.receive_message(at(22., Kind::Pause))?;
        assert_eq!(
            watch.state(),
            State {
                mode: Mode::Paused,
                timeval: 0.
            }
        );
        Ok(())
    }

    #[test]
    fn reset_semantics() -> anyhow::Result<()> {
        let mut watch = Watch::new();
        watch.reset(State {
            mode: Mode::Paused,
            timeval: 7.,
        });
        watch.receive_message(at(100., Kind::Reset))?;
        assert_eq!(watch.state().timeval, 0.);
        assert_eq!(watch.state().mode, Mode::Paused);
        watch.receive_message(at(101., Kind::Run))?;
        assert_eq!(
            watch.state(),
            State {
                mode: Mode::Running,
                timeval: 101.
            }
        );
        watch.receive_message(at(110., Kind::Reset))?;
        assert_eq!(
            watch.state(),
            State {
                mode: Mode::Running,
                timeval: 110.
            }
        );
        watch.receive_message(at(120., Kind::Pause))?;
        assert_eq!(
            watch.state(),
            State {
                mode: Mode::Paused,
                timeval: 10.
            }
        );
        Ok(())
    }

    #[test]
    fn duplicate_event_is_inert() -> anyhow::Result<()> {
        let mut watch = Watch::new();
        assert_eq!(watch.receive_message(at(10., Kind::Run))?, Some(at(10., Kind::Run)));
        let before = watch.state();
        assert_eq!(watch.receive_message(at(10., Kind::Run))?, None);
        assert_eq!(watch.state(), before);
        assert_eq!(watch.get_history().events.len(), 1);
        Ok(())
    }

    #[test]
    fn novel_but_inert_event_is_not_relayed() -> anyhow::Result<()> {
        let mut watch = Watch::new();
        // pausing a paused watch moves no state
        assert_eq!(watch.receive_message(at(5., Kind::Pause))?, None);
        assert_eq!(watch.get_history().events.len(), 1);
        Ok(())
    }

    #[test]
    fn history_merge_is_union() -> anyhow::Result<()> {
        let mut a = Watch::new();
        let mut b = Watch::new();
        a.receive_message(at(10., Kind::Run))?;
        b.receive_message(at(15., Kind::Pause))?;
        b.add_history(a.get_history())?;
        a.add_history(b.get_history())?;
        assert_eq!(a.state(), b.state());
        assert_eq!(
            a.state(),
            State {
                mode: Mode::Paused,
                timeval: 5.
            }
        );
        Ok(())
    }

    #[derive(Debug, Clone, Default)]
    struct Collect(Arc<Mutex<Vec<State>>>);

    impl SendEvent<State> for Collect {
        fn send(&mut self, state: State) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(state);
            Ok(())
        }
    }

    type TestNet = Recorder<Message<Event, History>>;

    fn replica(name: &str) -> anyhow::Result<Unordered<Watch, TestNet>> {
        let mut handler = Unordered::new("watch0", TestNet::default());
        handler.on_event(Register(Watch::new()))?;
        handler.on_event(Granted {
            name: PeerName(name.into()),
            is_initiator: false,
        })?;
        Ok(handler)
    }

    #[test]
    fn view_event_always_answers_the_view() -> anyhow::Result<()> {
        let mut handler = replica(":1.1")?;
        let seen = Collect::default();
        handler.on_event(events::Subscribe(Box::new(seen.clone())))?;
        handler.on_event(events::FromView(at(10., Kind::Run)))?;
        let broadcasts = handler.net.broadcasts.len();
        // the same click again: no new history, no broadcast, but the view
        // hears back
        handler.on_event(events::FromView(at(10., Kind::Run)))?;
        assert_eq!(handler.net.broadcasts.len(), broadcasts);
        assert_eq!(seen.0.lock().unwrap().len(), 3);
        Ok(())
    }

    #[test]
    fn net_event_notifies_only_on_change() -> anyhow::Result<()> {
        let mut handler = replica(":1.1")?;
        let seen = Collect::default();
        handler.on_event(events::Subscribe(Box::new(seen.clone())))?;
        handler.on_event(Recv(Addressed {
            sender: PeerName(":1.2".into()),
            inner: Message::Update(at(5., Kind::Pause)),
        }))?;
        assert_eq!(seen.0.lock().unwrap().len(), 1); // just the subscription
        handler.on_event(Recv(Addressed {
            sender: PeerName(":1.2".into()),
            inner: Message::Update(at(10., Kind::Run)),
        }))?;
        assert_eq!(seen.0.lock().unwrap().len(), 2);
        // the novel state-changing event got relayed
        assert!(matches!(
            handler.net.broadcasts.last(),
            Some(Message::Update(event)) if *event == at(10., Kind::Run)
        ));
        Ok(())
    }

    #[test]
    fn marks_order_totally() {
        let mut marks = [Mark(3.5), Mark(0.1), Mark(2.)];
        marks.sort();
        assert_eq!(marks, [Mark(0.1), Mark(2.), Mark(3.5)]);
    }
}
