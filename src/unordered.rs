// the most basic replicated object is the unordered one: every state change
// can be encapsulated as a message with no intrinsic ordering, so replicas
// that receive the same messages in any order reach the same state. naively
// coherency could be kept by replaying every message ever sent to each
// joining member, but most messages are obsolete; objects therefore manage
// their own non-obsolete snapshot for synchronizing with joining or merging
// peers, and the handler here only moves updates and snapshots around
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    event::{OnEvent, SendEvent},
    net::{deserialize, events::Recv, All, SendMessage},
    tube::{Addressed, Granted, Membership, PeerName},
};

pub const INTERFACE: &str = "org.dobject.Unordered";
pub const BASE_PATH: &str = "/org/dobject/Unordered/";

pub fn path(name: &str) -> String {
    format!("{BASE_PATH}{name}")
}

// the capability every wrapped object implements. `receive_message` may hand
// back a relay to re-broadcast (the watch model forwards novel
// state-changing events; registers and sets never do). `get_history` is the
// full non-obsolete state, `add_history` merges a peer's snapshot
pub trait Object {
    type Message;
    type History;

    fn receive_message(&mut self, message: Self::Message)
        -> anyhow::Result<Option<Self::Message>>;

    fn get_history(&self) -> Self::History;

    fn add_history(&mut self, history: Self::History) -> anyhow::Result<()>;
}

// wire protocol under the object's path: the `send` and `ask_history`
// broadcast signals and the directed `receive_history` method call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message<M, S> {
    Update(M),
    AskHistory,
    History(S),
}

pub trait Net<O: Object>:
    SendMessage<All, Message<O::Message, O::History>>
    + SendMessage<PeerName, Message<O::Message, O::History>>
{
}
impl<
        T: SendMessage<All, Message<O::Message, O::History>>
            + SendMessage<PeerName, Message<O::Message, O::History>>,
        O: Object,
    > Net<O> for T
{
}

pub mod events {
    // installs the wrapped object. sent once, by the code that constructed
    // the object, mirroring the object registering itself with its handler
    #[derive(Debug)]
    pub struct Register<O>(pub O);
}

// per-object replication adapter. owns both the adapter role and the object
// itself, so there is no handler/object reference cycle. anti-entropy (the
// `AskHistory` broadcast) starts after whichever of the channel and the
// object arrives second
#[derive(Debug)]
pub struct Unordered<O, N> {
    name: String,
    self_name: Option<PeerName>,
    object: Option<O>,
    pub(crate) net: N,
}

impl<O, N> Unordered<O, N> {
    pub fn new(name: impl Into<String>, net: N) -> Self {
        Self {
            name: name.into(),
            net,
            self_name: None,
            object: None,
        }
    }

    pub fn path(&self) -> String {
        path(&self.name)
    }

    pub fn object(&self) -> Option<&O> {
        self.object.as_ref()
    }

    pub fn object_mut(&mut self) -> anyhow::Result<&mut O> {
        self.object
            .as_mut()
            .ok_or(anyhow::anyhow!("{} not registered", self.name))
    }
}

impl<O: Object, N: Net<O>> Unordered<O, N> {
    // broadcast an incremental update produced by a local operation. the
    // operation impls on concrete objects call this after mutating
    pub fn broadcast(&mut self, update: O::Message) -> anyhow::Result<()> {
        self.net.send(All, Message::Update(update))
    }

    fn ask_history(&mut self) -> anyhow::Result<()> {
        debug!("{} ask history", self.name);
        self.net.send(All, Message::<O::Message, O::History>::AskHistory)
    }

    fn tell_history(&mut self, peer: PeerName) -> anyhow::Result<()> {
        let Some(object) = &self.object else {
            warn!("{} not registered before tell_history", self.name);
            return Ok(());
        };
        debug!("{} tell history to {peer}", self.name);
        let history = object.get_history();
        // fire and forget: an unreachable peer resynchronizes on its own
        // next join
        if let Err(err) = self.net.send(peer, Message::History(history)) {
            warn!("{} tell history: {err}", self.name)
        }
        Ok(())
    }
}

impl<O: Object, N: Net<O>> OnEvent<Granted> for Unordered<O, N> {
    fn on_event(&mut self, granted: Granted) -> anyhow::Result<()> {
        self.self_name = Some(granted.name);
        if self.object.is_some() {
            self.ask_history()?
        }
        Ok(())
    }
}

impl<O: Object, N: Net<O>> OnEvent<events::Register<O>> for Unordered<O, N> {
    fn on_event(&mut self, events::Register(object): events::Register<O>) -> anyhow::Result<()> {
        anyhow::ensure!(self.object.is_none(), "{} already registered", self.name);
        self.object = Some(object);
        if self.self_name.is_some() {
            self.ask_history()?
        }
        Ok(())
    }
}

impl<O: Object, N: Net<O>> OnEvent<Recv<Addressed<Message<O::Message, O::History>>>>
    for Unordered<O, N>
{
    fn on_event(
        &mut self,
        Recv(message): Recv<Addressed<Message<O::Message, O::History>>>,
    ) -> anyhow::Result<()> {
        match message.inner {
            Message::Update(update) => {
                if Some(&message.sender) == self.self_name.as_ref() {
                    return Ok(());
                }
                let Some(object) = &mut self.object else {
                    warn!("{} got message before registration", self.name);
                    return Ok(());
                };
                let relay = object.receive_message(update)?;
                if let Some(relay) = relay {
                    self.broadcast(relay)?
                }
                Ok(())
            }
            Message::AskHistory => {
                if Some(&message.sender) == self.self_name.as_ref() {
                    return Ok(());
                }
                self.tell_history(message.sender)
            }
            Message::History(history) => {
                let Some(object) = &mut self.object else {
                    warn!("{} got history before registration", self.name);
                    return Ok(());
                };
                object.add_history(history)
            }
        }
    }
}

impl<O: Object, N: Net<O>> OnEvent<Membership> for Unordered<O, N> {
    fn on_event(&mut self, membership: Membership) -> anyhow::Result<()> {
        // push on join: every existing peer sends its snapshot to each new
        // member, so a joiner converges even when its own ask gets lost
        for (_, peer) in membership.added {
            if Some(&peer) == self.self_name.as_ref() {
                continue;
            }
            self.tell_history(peer)?
        }
        Ok(())
    }
}

pub fn on_buf<M: DeserializeOwned, S: DeserializeOwned>(
    sender: PeerName,
    buf: &[u8],
    out: &mut impl SendEvent<Recv<Addressed<Message<M, S>>>>,
) -> anyhow::Result<()> {
    out.send(Recv(Addressed {
        sender,
        inner: deserialize(buf)?,
    }))
}
