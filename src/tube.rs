use std::{
    collections::HashMap,
    fmt::{Debug, Display},
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use tracing::warn;

use crate::{
    event::{OnEvent, SendEvent},
    net::{All, SendMessage},
};

// stable per-peer identity handed out by the transport, the `unique_name` of
// the underlying bus connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerName(pub String);

impl Display for PeerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

// ingress attribution. the transport knows who emitted a frame; the state
// machines need the sender to drop their own echoes and to address replies
#[derive(Debug, Clone)]
pub struct Addressed<M> {
    pub sender: PeerName,
    pub inner: M,
}

// the consumed channel interface. `emit` is a broadcast signal under the
// object's path and is delivered to every member, the emitter included.
// `call` is a directed fire-and-forget method invocation. participant
// changes and inbound frames flow the other way, from the transport into
// `Dispatch`
pub trait Tube: Send + Sync {
    fn unique_name(&self) -> PeerName;

    fn emit(&self, path: &str, buf: Bytes) -> anyhow::Result<()>;

    fn call(&self, peer: &PeerName, path: &str, buf: Bytes) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct Inserted {
    pub tube: Arc<dyn Tube>,
    pub is_initiator: bool,
}

impl Debug for Inserted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inserted")
            .field("is_initiator", &self.is_initiator)
            .finish_non_exhaustive()
    }
}

pub mod events {
    use bytes::Bytes;

    use super::PeerName;

    // per-handler notification that the channel has arrived. `name` is our
    // own unique name on the bus, recorded for echo detection
    #[derive(Debug, Clone)]
    pub struct Granted {
        pub name: PeerName,
        pub is_initiator: bool,
    }

    #[derive(Debug, Clone)]
    pub struct Ingress {
        pub path: String,
        pub sender: PeerName,
        pub buf: Bytes,
    }

    // the `watch_participants` notification of the transport
    #[derive(Debug, Clone)]
    pub struct Membership {
        pub added: Vec<(u32, PeerName)>,
        pub removed: Vec<(u32, PeerName)>,
    }
}
pub use events::{Granted, Ingress, Membership};

type InsertListener = Box<dyn FnOnce(&Inserted) -> anyhow::Result<()> + Send>;

#[derive(Default)]
struct BoxState {
    inserted: Option<Inserted>,
    listeners: Vec<InsertListener>,
}

// holds a possibly-absent channel. handlers are created before the session is
// shared and must not care whether the channel exists yet; they subscribe
// here and get exactly one callback once it does. the host owns the box and
// performs the single `insert` when its transport comes up
#[derive(Default)]
pub struct TubeBox {
    state: Mutex<BoxState>,
}

impl Debug for TubeBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TubeBox").finish_non_exhaustive()
    }
}

impl TubeBox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn granted(&self) -> Option<Inserted> {
        match self.state.lock() {
            Ok(state) => state.inserted.clone(),
            Err(_) => None,
        }
    }

    // listeners run exactly once, in subscription order, outside the lock
    pub fn subscribe(&self, listener: InsertListener) -> anyhow::Result<()> {
        let inserted = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| anyhow::anyhow!("tube box poisoned"))?;
            match &state.inserted {
                Some(inserted) => inserted.clone(),
                None => {
                    state.listeners.push(listener);
                    return Ok(());
                }
            }
        };
        listener(&inserted)
    }

    // at most one insert takes effect. a second insert keeps the first tube;
    // the duplicate is logged and discarded
    pub fn insert(&self, tube: Arc<dyn Tube>, is_initiator: bool) -> anyhow::Result<()> {
        let (inserted, listeners) = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| anyhow::anyhow!("tube box poisoned"))?;
            if state.inserted.is_some() {
                warn!("discard duplicate tube insert");
                return Ok(());
            }
            let inserted = Inserted { tube, is_initiator };
            state.inserted = Some(inserted.clone());
            (inserted, std::mem::take(&mut state.listeners))
        };
        for listener in listeners {
            if let Err(err) = listener(&inserted) {
                warn!("tube listener: {err}")
            }
        }
        Ok(())
    }
}

// adapts a session sender into a tube box listener: on insert the handler's
// state machine receives a single `Granted` event carrying its own bus name
pub fn subscribe_granted(
    tube_box: &TubeBox,
    mut sender: impl SendEvent<Granted> + Send + 'static,
) -> anyhow::Result<()> {
    tube_box.subscribe(Box::new(move |inserted| {
        sender.send(Granted {
            name: inserted.tube.unique_name(),
            is_initiator: inserted.is_initiator,
        })
    }))
}

// late-binding egress net scoped to one object path. before the tube arrives
// every send is dropped with a log line: the object's state retains the
// mutation and the on-insert anti-entropy exchange supersedes the lost
// broadcast. transport failures are dropped the same way, there is no retry
#[derive(Debug, Clone)]
pub struct TubeNet {
    tube_box: Arc<TubeBox>,
    path: String,
}

impl TubeNet {
    pub fn new(tube_box: Arc<TubeBox>, path: impl Into<String>) -> Self {
        Self {
            tube_box,
            path: path.into(),
        }
    }
}

impl SendMessage<All, Bytes> for TubeNet {
    fn send(&mut self, All: All, buf: Bytes) -> anyhow::Result<()> {
        let Some(inserted) = self.tube_box.granted() else {
            warn!("{} drop egress before tube arrival", self.path);
            return Ok(());
        };
        if let Err(err) = inserted.tube.emit(&self.path, buf) {
            warn!("{} emit: {err}", self.path)
        }
        Ok(())
    }
}

impl SendMessage<PeerName, Bytes> for TubeNet {
    fn send(&mut self, dest: PeerName, buf: Bytes) -> anyhow::Result<()> {
        let Some(inserted) = self.tube_box.granted() else {
            warn!("{} drop egress before tube arrival", self.path);
            return Ok(());
        };
        if let Err(err) = inserted.tube.call(&dest, &self.path, buf) {
            warn!("{} call {dest}: {err}", self.path)
        }
        Ok(())
    }
}

// records egress instead of delivering it, for testing
#[derive(Debug)]
pub struct Recorder<M> {
    pub broadcasts: Vec<M>,
    pub directs: Vec<(PeerName, M)>,
}

impl<M> Default for Recorder<M> {
    fn default() -> Self {
        Self {
            broadcasts: Vec::new(),
            directs: Vec::new(),
        }
    }
}

impl<M> SendMessage<All, M> for Recorder<M> {
    fn send(&mut self, All: All, message: M) -> anyhow::Result<()> {
        self.broadcasts.push(message);
        Ok(())
    }
}

impl<M> SendMessage<PeerName, M> for Recorder<M> {
    fn send(&mut self, dest: PeerName, message: M) -> anyhow::Result<()> {
        self.directs.push((dest, message));
        Ok(())
    }
}

type OnBuf = Box<dyn FnMut(PeerName, &[u8]) -> anyhow::Result<()> + Send>;

struct Route {
    on_buf: OnBuf,
    membership: Option<Box<dyn SendEvent<Membership> + Send>>,
}

// ingress router. one per tube: frames address an object path, participant
// changes fan out to every handler that asked for them. decode or dispatch
// failures inside a route never take the router down, the frame is dropped
// and the object stays in its prior state
#[derive(Default)]
pub struct Dispatch {
    routes: HashMap<String, Route>,
}

impl Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("paths", &self.routes.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, derive_more::From)]
pub enum DispatchEvent {
    Ingress(Ingress),
    Membership(Membership),
}

impl Dispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        path: impl Into<String>,
        on_buf: OnBuf,
        membership: Option<Box<dyn SendEvent<Membership> + Send>>,
    ) -> anyhow::Result<()> {
        let path = path.into();
        anyhow::ensure!(
            !self.routes.contains_key(&path),
            "duplicate route for {path}"
        );
        self.routes.insert(path, Route { on_buf, membership });
        Ok(())
    }
}

impl OnEvent<DispatchEvent> for Dispatch {
    fn on_event(&mut self, event: DispatchEvent) -> anyhow::Result<()> {
        match event {
            DispatchEvent::Ingress(ingress) => {
                let Some(route) = self.routes.get_mut(&ingress.path) else {
                    warn!("{} ingress before registration", ingress.path);
                    return Ok(());
                };
                if let Err(err) = (route.on_buf)(ingress.sender, &ingress.buf) {
                    warn!("{} drop ingress: {err}", ingress.path)
                }
                Ok(())
            }
            DispatchEvent::Membership(membership) => {
                for (path, route) in &mut self.routes {
                    let Some(sender) = &mut route.membership else {
                        continue;
                    };
                    if let Err(err) = sender.send(membership.clone()) {
                        warn!("{path} membership: {err}")
                    }
                }
                Ok(())
            }
        }
    }
}
