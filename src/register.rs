use std::{
    cmp::Ordering::{Equal, Greater, Less},
    fmt::Debug,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    event::{OnEvent, SendEvent},
    time::{GroupClock, LocalClock},
    unordered::{Net, Object, Unordered},
};

// one proposed or received state of the register. the register keeps the
// lexicographic maximum over every observation: score first (an unordered
// score, e.g. NaN, never wins), then tiebreaker by total order, then the
// value itself so equal-score ties settle the same way on every replica.
// the tiebreaker always travels on the wire; writers with ties disabled
// send 0
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation<V, S> {
    pub value: V,
    pub score: S,
    pub tiebreaker: f64,
}

type Listener<V, S> = Box<dyn SendEvent<(V, S)> + Send>;

pub struct HighScore<V, S> {
    value: V,
    score: S,
    tiebreaker: f64,
    break_ties: bool,
    listeners: Vec<Listener<V, S>>,
}

impl<V: Debug, S: Debug> Debug for HighScore<V, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HighScore")
            .field("value", &self.value)
            .field("score", &self.score)
            .field("tiebreaker", &self.tiebreaker)
            .finish_non_exhaustive()
    }
}

impl<V, S> HighScore<V, S> {
    pub fn new(value: V, score: S, break_ties: bool) -> Self {
        Self {
            value,
            score,
            break_ties,
            tiebreaker: 0.,
            listeners: Vec::new(),
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn score(&self) -> &S {
        &self.score
    }
}

impl<V: Ord + Clone, S: PartialOrd + Clone> HighScore<V, S> {
    fn beaten_by(&self, observation: &Observation<V, S>) -> bool {
        match observation.score.partial_cmp(&self.score) {
            Some(Greater) => true,
            Some(Less) | None => false,
            Some(Equal) => match observation.tiebreaker.total_cmp(&self.tiebreaker) {
                Greater => true,
                Less => false,
                Equal => observation.value > self.value,
            },
        }
    }

    fn apply(&mut self, observation: Observation<V, S>) -> bool {
        if !self.beaten_by(&observation) {
            debug!("not changing value");
            return false;
        }
        self.value = observation.value;
        self.score = observation.score;
        self.tiebreaker = observation.tiebreaker;
        self.notify();
        true
    }

    fn notify(&mut self) {
        let pair = (self.value.clone(), self.score.clone());
        for listener in &mut self.listeners {
            if let Err(err) = listener.send(pair.clone()) {
                warn!("register listener: {err}")
            }
        }
    }

    // delivers the current pair to the listener exactly once, before any
    // future change notification
    pub fn subscribe(&mut self, mut listener: Listener<V, S>) -> anyhow::Result<()> {
        listener.send((self.value.clone(), self.score.clone()))?;
        self.listeners.push(listener);
        Ok(())
    }
}

impl<V: Ord + Clone, S: PartialOrd + Clone> Object for HighScore<V, S> {
    type Message = Observation<V, S>;
    type History = Observation<V, S>;

    fn receive_message(
        &mut self,
        message: Self::Message,
    ) -> anyhow::Result<Option<Self::Message>> {
        self.apply(message);
        Ok(None)
    }

    fn get_history(&self) -> Self::History {
        Observation {
            value: self.value.clone(),
            score: self.score.clone(),
            tiebreaker: self.tiebreaker,
        }
    }

    fn add_history(&mut self, history: Self::History) -> anyhow::Result<()> {
        self.apply(history);
        Ok(())
    }
}

pub mod events {
    use crate::event::SendEvent;

    #[derive(Debug)]
    pub struct Set<V, S>(pub V, pub S);

    pub struct Subscribe<V, S>(pub Box<dyn SendEvent<(V, S)> + Send>);

    // register whose score is the group time at the moment of the write
    #[derive(Debug)]
    pub struct SetNow<V>(pub V);

    pub struct SubscribeValue<V>(pub Box<dyn SendEvent<V> + Send>);
}

impl<V, S, N> OnEvent<events::Set<V, S>> for Unordered<HighScore<V, S>, N>
where
    V: Ord + Clone,
    S: PartialOrd + Clone,
    N: Net<HighScore<V, S>>,
{
    fn on_event(&mut self, events::Set(value, score): events::Set<V, S>) -> anyhow::Result<()> {
        let object = self.object_mut()?;
        let tiebreaker = if object.break_ties { rand::random() } else { 0. };
        let observation = Observation {
            value,
            score,
            tiebreaker,
        };
        if object.apply(observation.clone()) {
            self.broadcast(observation)?
        }
        Ok(())
    }
}

impl<V, S, N> OnEvent<events::Subscribe<V, S>> for Unordered<HighScore<V, S>, N>
where
    V: Ord + Clone,
    S: PartialOrd + Clone,
    N: Net<HighScore<V, S>>,
{
    fn on_event(
        &mut self,
        events::Subscribe(listener): events::Subscribe<V, S>,
    ) -> anyhow::Result<()> {
        self.object_mut()?.subscribe(listener)
    }
}

// register whose score is group time, so the latest writer wins. the initial
// score is -inf and loses to any real write
#[derive(derive_more::Deref, derive_more::DerefMut)]
pub struct Latest<V, C> {
    #[deref]
    #[deref_mut]
    inner: HighScore<V, f64>,
    group: GroupClock,
    clock: C,
}

impl<V: Debug, C> Debug for Latest<V, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Latest")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl<V, C> Latest<V, C> {
    pub fn new(value: V, group: GroupClock, clock: C) -> Self {
        Self {
            inner: HighScore::new(value, f64::NEG_INFINITY, false),
            group,
            clock,
        }
    }
}

impl<V: Ord + Clone, C> Object for Latest<V, C> {
    type Message = Observation<V, f64>;
    type History = Observation<V, f64>;

    fn receive_message(
        &mut self,
        message: Self::Message,
    ) -> anyhow::Result<Option<Self::Message>> {
        self.inner.receive_message(message)
    }

    fn get_history(&self) -> Self::History {
        self.inner.get_history()
    }

    fn add_history(&mut self, history: Self::History) -> anyhow::Result<()> {
        self.inner.add_history(history)
    }
}

impl<V, C, N> OnEvent<events::SetNow<V>> for Unordered<Latest<V, C>, N>
where
    V: Ord + Clone,
    C: LocalClock,
    N: Net<Latest<V, C>>,
{
    fn on_event(&mut self, events::SetNow(value): events::SetNow<V>) -> anyhow::Result<()> {
        let object = self.object_mut()?;
        let score = object.group.time(&object.clock);
        let observation = Observation {
            value,
            score,
            tiebreaker: 0.,
        };
        if object.inner.apply(observation.clone()) {
            self.broadcast(observation)?
        }
        Ok(())
    }
}

// adapts a value-only listener onto the scored listener interface
struct ValueOnly<V>(Box<dyn SendEvent<V> + Send>);

impl<V, S> SendEvent<(V, S)> for ValueOnly<V> {
    fn send(&mut self, (value, _): (V, S)) -> anyhow::Result<()> {
        self.0.send(value)
    }
}

impl<V, C, N> OnEvent<events::SubscribeValue<V>> for Unordered<Latest<V, C>, N>
where
    V: Ord + Clone + 'static,
    C: LocalClock,
    N: Net<Latest<V, C>>,
{
    fn on_event(
        &mut self,
        events::SubscribeValue(listener): events::SubscribeValue<V>,
    ) -> anyhow::Result<()> {
        self.object_mut()?
            .inner
            .subscribe(Box::new(ValueOnly(listener)))
    }
}

// per-watch label register
pub type NameRegister<C> = Latest<String, C>;

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::{
        net::events::Recv,
        tube::{Addressed, PeerName, Recorder},
        unordered::{events::Register, Message},
    };

    use super::*;

    type TestNet = Recorder<Message<Observation<String, u32>, Observation<String, u32>>>;

    #[derive(Debug, Clone, Default)]
    struct Collect<T>(Arc<Mutex<Vec<T>>>);

    impl<T> SendEvent<T> for Collect<T> {
        fn send(&mut self, event: T) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn replica(name: &str) -> anyhow::Result<Unordered<HighScore<String, u32>, TestNet>> {
        let mut handler = Unordered::new("color", TestNet::default());
        handler.on_event(Register(HighScore::new("".to_string(), 0, false)))?;
        handler.on_event(crate::tube::Granted {
            name: PeerName(name.into()),
            is_initiator: false,
        })?;
        Ok(handler)
    }

    fn update(sender: &str, observation: Observation<String, u32>) -> Recv<Addressed<Message<Observation<String, u32>, Observation<String, u32>>>> {
        Recv(Addressed {
            sender: PeerName(sender.into()),
            inner: Message::Update(observation),
        })
    }

    #[test]
    fn higher_score_wins() -> anyhow::Result<()> {
        let mut handler = replica(":1.1")?;
        handler.on_event(events::Set("red".to_string(), 5))?;
        handler.on_event(events::Set("blue".to_string(), 3))?;
        let object = handler.object().unwrap();
        assert_eq!(object.value(), "red");
        assert_eq!(*object.score(), 5);
        // only the winning write went out
        assert_eq!(handler.net.broadcasts.len(), 2); // ask history + one update
        Ok(())
    }

    #[test]
    fn crossing_ties_settle_identically() -> anyhow::Result<()> {
        let mut a = replica(":1.1")?;
        let mut b = replica(":1.2")?;
        a.on_event(events::Set("red".to_string(), 5))?;
        b.on_event(events::Set("blue".to_string(), 5))?;
        let from_a = Observation {
            value: "red".to_string(),
            score: 5,
            tiebreaker: 0.,
        };
        let from_b = Observation {
            value: "blue".to_string(),
            score: 5,
            tiebreaker: 0.,
        };
        a.on_event(update(":1.2", from_b))?;
        b.on_event(update(":1.1", from_a))?;
        let (a, b) = (a.object().unwrap(), b.object().unwrap());
        assert_eq!(a.value(), b.value());
        assert_eq!(a.score(), b.score());
        assert_eq!(a.value(), "red");
        Ok(())
    }

    #[test]
    fn tiebreaker_orders_equal_scores() -> anyhow::Result<()> {
        let mut handler = replica(":1.1")?;
        handler.on_event(update(
            ":1.2",
            Observation {
                value: "blue".to_string(),
                score: 5,
                tiebreaker: 0.7,
            },
        ))?;
        handler.on_event(update(
            ":1.3",
            Observation {
                value: "zzz".to_string(),
                score: 5,
                tiebreaker: 0.2,
            },
        ))?;
        assert_eq!(handler.object().unwrap().value(), "blue");
        Ok(())
    }

    #[test]
    fn listener_gets_current_then_changes() -> anyhow::Result<()> {
        let mut handler = replica(":1.1")?;
        handler.on_event(events::Set("red".to_string(), 5))?;
        let collect = Collect::default();
        handler.on_event(events::Subscribe(Box::new(collect.clone())))?;
        handler.on_event(events::Set("green".to_string(), 4))?; // loses, no callback
        handler.on_event(events::Set("blue".to_string(), 6))?;
        let seen = collect.0.lock().unwrap();
        assert_eq!(
            *seen,
            [("red".to_string(), 5), ("blue".to_string(), 6)]
        );
        Ok(())
    }

    #[test]
    fn latest_scores_with_group_time() -> anyhow::Result<()> {
        struct At(f64);
        impl LocalClock for At {
            fn now(&self) -> f64 {
                self.0
            }
        }
        let group = GroupClock::new();
        group.assume(100.);
        let mut handler = Unordered::new(
            "name0",
            Recorder::<Message<Observation<String, f64>, Observation<String, f64>>>::default(),
        );
        handler.on_event(Register(NameRegister::new("Stopwatch 1".to_string(), group, At(7.))))?;
        handler.on_event(events::SetNow("Lap timer".to_string()))?;
        let object = handler.object().unwrap();
        assert_eq!(object.value(), "Lap timer");
        assert_eq!(*object.score(), 107.);
        let collect = Collect::default();
        handler.on_event(events::SubscribeValue(Box::new(collect.clone())))?;
        assert_eq!(*collect.0.lock().unwrap(), ["Lap timer".to_string()]);
        Ok(())
    }
}
