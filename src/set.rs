use std::{collections::HashSet, fmt::Debug, hash::Hash};

use tracing::warn;

use crate::{
    event::{OnEvent, SendEvent},
    unordered::{Net, Object, Unordered},
};

type Listener<T> = Box<dyn SendEvent<Vec<T>> + Send>;

// grow-only set. the only mutation is insertion, so the union of everything
// ever observed is the state and any delivery order converges. updates on
// the wire carry just the freshly inserted subset; the history snapshot is
// the full contents. removal, discard, pop and clear do not exist
pub struct AddOnlySet<T> {
    items: HashSet<T>,
    listeners: Vec<Listener<T>>,
}

impl<T: Debug> Debug for AddOnlySet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddOnlySet")
            .field("items", &self.items)
            .finish_non_exhaustive()
    }
}

impl<T> Default for AddOnlySet<T> {
    fn default() -> Self {
        Self {
            items: HashSet::new(),
            listeners: Vec::new(),
        }
    }
}

impl<T> AddOnlySet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &HashSet<T> {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Eq + Hash + Clone> AddOnlySet<T> {
    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    // inserts whatever is not yet present and returns it; listeners hear
    // about exactly that subset
    fn insert_diff(&mut self, items: Vec<T>) -> Vec<T> {
        let mut fresh = Vec::new();
        for item in items {
            if self.items.insert(item.clone()) {
                fresh.push(item)
            }
        }
        if !fresh.is_empty() {
            self.notify(&fresh)
        }
        fresh
    }

    fn notify(&mut self, inserted: &[T]) {
        for listener in &mut self.listeners {
            if let Err(err) = listener.send(inserted.to_vec()) {
                warn!("set listener: {err}")
            }
        }
    }

    pub fn subscribe(&mut self, mut listener: Listener<T>) -> anyhow::Result<()> {
        listener.send(self.items.iter().cloned().collect())?;
        self.listeners.push(listener);
        Ok(())
    }
}

impl<T: Eq + Hash + Clone> Object for AddOnlySet<T> {
    type Message = Vec<T>;
    type History = Vec<T>;

    fn receive_message(&mut self, message: Vec<T>) -> anyhow::Result<Option<Vec<T>>> {
        self.insert_diff(message);
        Ok(None)
    }

    fn get_history(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    fn add_history(&mut self, history: Vec<T>) -> anyhow::Result<()> {
        self.insert_diff(history);
        Ok(())
    }
}

pub mod events {
    use crate::event::SendEvent;

    #[derive(Debug)]
    pub struct Add<T>(pub T);

    #[derive(Debug)]
    pub struct Update<T>(pub Vec<T>);

    pub struct Subscribe<T>(pub Box<dyn SendEvent<Vec<T>> + Send>);
}

impl<T, N> OnEvent<events::Add<T>> for Unordered<AddOnlySet<T>, N>
where
    T: Eq + Hash + Clone,
    N: Net<AddOnlySet<T>>,
{
    fn on_event(&mut self, events::Add(item): events::Add<T>) -> anyhow::Result<()> {
        // a singleton add still broadcasts a one-element collection
        self.on_event(events::Update(vec![item]))
    }
}

impl<T, N> OnEvent<events::Update<T>> for Unordered<AddOnlySet<T>, N>
where
    T: Eq + Hash + Clone,
    N: Net<AddOnlySet<T>>,
{
    fn on_event(&mut self, events::Update(items): events::Update<T>) -> anyhow::Result<()> {
        let fresh = self.object_mut()?.insert_diff(items);
        if !fresh.is_empty() {
            self.broadcast(fresh)?
        }
        Ok(())
    }
}

impl<T, N> OnEvent<events::Subscribe<T>> for Unordered<AddOnlySet<T>, N>
where
    T: Eq + Hash + Clone,
    N: Net<AddOnlySet<T>>,
{
    fn on_event(&mut self, events::Subscribe(listener): events::Subscribe<T>) -> anyhow::Result<()> {
        self.object_mut()?.subscribe(listener)
    }
}

// same semantics over a sorted deduplicated vector, for consumers that want
// a deterministic iteration order and positional access. listeners receive
// new items in comparator order
pub struct AddOnlySortedSet<T> {
    items: Vec<T>,
    listeners: Vec<Listener<T>>,
}

impl<T: Debug> Debug for AddOnlySortedSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddOnlySortedSet")
            .field("items", &self.items)
            .finish_non_exhaustive()
    }
}

impl<T> Default for AddOnlySortedSet<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            listeners: Vec::new(),
        }
    }
}

impl<T> AddOnlySortedSet<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Ord + Clone> AddOnlySortedSet<T> {
    pub fn contains(&self, item: &T) -> bool {
        self.items.binary_search(item).is_ok()
    }

    fn insert_diff(&mut self, mut items: Vec<T>) -> Vec<T> {
        items.sort();
        items.dedup();
        let mut fresh = Vec::new();
        for item in items {
            if let Err(index) = self.items.binary_search(&item) {
                self.items.insert(index, item.clone());
                fresh.push(item)
            }
        }
        if !fresh.is_empty() {
            self.notify(&fresh)
        }
        fresh
    }

    fn notify(&mut self, inserted: &[T]) {
        for listener in &mut self.listeners {
            if let Err(err) = listener.send(inserted.to_vec()) {
                warn!("set listener: {err}")
            }
        }
    }

    pub fn subscribe(&mut self, mut listener: Listener<T>) -> anyhow::Result<()> {
        listener.send(self.items.clone())?;
        self.listeners.push(listener);
        Ok(())
    }
}

impl<T: Ord + Clone> Object for AddOnlySortedSet<T> {
    type Message = Vec<T>;
    type History = Vec<T>;

    fn receive_message(&mut self, message: Vec<T>) -> anyhow::Result<Option<Vec<T>>> {
        self.insert_diff(message);
        Ok(None)
    }

    fn get_history(&self) -> Vec<T> {
        self.items.clone()
    }

    fn add_history(&mut self, history: Vec<T>) -> anyhow::Result<()> {
        self.insert_diff(history);
        Ok(())
    }
}

impl<T, N> OnEvent<events::Add<T>> for Unordered<AddOnlySortedSet<T>, N>
where
    T: Ord + Clone,
    N: Net<AddOnlySortedSet<T>>,
{
    fn on_event(&mut self, events::Add(item): events::Add<T>) -> anyhow::Result<()> {
        self.on_event(events::Update(vec![item]))
    }
}

impl<T, N> OnEvent<events::Update<T>> for Unordered<AddOnlySortedSet<T>, N>
where
    T: Ord + Clone,
    N: Net<AddOnlySortedSet<T>>,
{
    fn on_event(&mut self, events::Update(items): events::Update<T>) -> anyhow::Result<()> {
        let fresh = self.object_mut()?.insert_diff(items);
        if !fresh.is_empty() {
            self.broadcast(fresh)?
        }
        Ok(())
    }
}

impl<T, N> OnEvent<events::Subscribe<T>> for Unordered<AddOnlySortedSet<T>, N>
where
    T: Ord + Clone,
    N: Net<AddOnlySortedSet<T>>,
{
    fn on_event(&mut self, events::Subscribe(listener): events::Subscribe<T>) -> anyhow::Result<()> {
        self.object_mut()?.subscribe(listener)
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

    type TestNet = Recorder<Message<Vec<&'static str>, Vec<&'static str>>>;

    #[derive(Debug, Clone, Default)]
    struct Collect(Arc<Mutex<Vec<Vec<&'static str>>>>);

    impl SendEvent<Vec<&'static str>> for Collect {
        fn send(&mut self, event: Vec<&'static str>) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn replica(name: &str) -> anyhow::Result<Unordered<AddOnlySet<&'static str>, TestNet>> {
        let mut handler = Unordered::new("marks", TestNet::default());
        handler.on_event(Register(AddOnlySet::new()))?;
        handler.on_event(Granted {
            name: PeerName(name.into()),
            is_initiator: false,
        })?;
        Ok(handler)
    }

    fn update(
        sender: &str,
        items: Vec<&'static str>,
    ) -> Recv<Addressed<Message<Vec<&'static str>, Vec<&'static str>>>> {
        Recv(Addressed {
            sender: PeerName(sender.into()),
            inner: Message::Update(items),
        })
    }

    #[test]
    fn union_of_crossing_adds() -> anyhow::Result<()> {
        let mut a = replica(":1.1")?;
        let mut b = replica(":1.2")?;
        let a_seen = Collect::default();
        let b_seen = Collect::default();
        a.on_event(events::Subscribe(Box::new(a_seen.clone())))?;
        b.on_event(events::Subscribe(Box::new(b_seen.clone())))?;
        a.on_event(events::Add("x"))?;
        b.on_event(events::Add("y"))?;
        a.on_event(update(":1.2", vec!["y"]))?;
        b.on_event(update(":1.1", vec!["x"]))?;
        assert_eq!(a.object().unwrap().items(), b.object().unwrap().items());
        assert_eq!(a.object().unwrap().len(), 2);
        // initial empty contents, own add, remote diff
        assert_eq!(*a_seen.0.lock().unwrap(), [vec![], vec!["x"], vec!["y"]]);
        assert_eq!(*b_seen.0.lock().unwrap(), [vec![], vec!["y"], vec!["x"]]);
        Ok(())
    }

    #[test]
    fn duplicate_add_stays_silent() -> anyhow::Result<()> {
        let mut handler = replica(":1.1")?;
        handler.on_event(events::Add("x"))?;
        let broadcasts = handler.net.broadcasts.len();
        handler.on_event(events::Add("x"))?;
        handler.on_event(update(":1.2", vec!["x"]))?;
        assert_eq!(handler.net.broadcasts.len(), broadcasts);
        assert_eq!(handler.object().unwrap().len(), 1);
        Ok(())
    }

    #[test]
    fn update_broadcasts_only_the_diff() -> anyhow::Result<()> {
        let mut handler = replica(":1.1")?;
        handler.on_event(events::Add("x"))?;
        handler.on_event(events::Update(vec!["x", "y", "z"]))?;
        let Some(Message::Update(diff)) = handler.net.broadcasts.last() else {
            panic!("expected an update broadcast")
        };
        let mut diff = diff.clone();
        diff.sort();
        assert_eq!(diff, ["y", "z"]);
        Ok(())
    }

    #[test]
    fn sorted_set_orders_and_indexes() -> anyhow::Result<()> {
        let mut handler = Unordered::new(
            "marks",
            Recorder::<Message<Vec<u32>, Vec<u32>>>::default(),
        );
        handler.on_event(Register(AddOnlySortedSet::new()))?;
        handler.on_event(events::Update(vec![9, 3, 7, 3]))?;
        handler.on_event(events::Add(5))?;
        let object = handler.object().unwrap();
        assert_eq!(object.items(), [3, 5, 7, 9]);
        assert_eq!(object.get(1), Some(&5));
        assert!(object.contains(&7));
        assert!(!object.contains(&4));
        Ok(())
    }
}
