// a cheap, decentralized clock for the sharing group. the offset between
// local time and group time is estimated by broadcasting a question and
// accepting the first answer, assuming both transfer delays were equal. the
// initiator's offset is 0; once anyone else has synchronized the initiator
// can leave and later joiners still converge. the estimator is not resilient
// to splits: a daughter group with no synchronized member stays on its own
// clock. typical error is 0.1-2s, good enough to order human-scale events
use std::{
    sync::{
        atomic::{
            AtomicBool, AtomicU64,
            Ordering::{Acquire, Relaxed, Release},
        },
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    event::{OnEvent, SendEvent},
    net::{deserialize, events::Recv, All, SendMessage},
    tube::{Addressed, Granted, PeerName},
};

pub const INTERFACE: &str = "org.dobject.TimeHandler";
pub const BASE_PATH: &str = "/org/dobject/TimeHandler/";

pub fn path(name: &str) -> String {
    format!("{BASE_PATH}{name}")
}

pub trait LocalClock {
    // seconds since the unix epoch
    fn now(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl LocalClock for WallClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.)
    }
}

#[derive(Debug, Default)]
struct OffsetCell {
    bits: AtomicU64,
    known: AtomicBool,
}

// shared view of the learned offset. mutation is serialized by the owning
// `TimeHandler` session (plus the host's restore path); everyone else only
// reads, and a stale read is tolerated because the offset is quiescent once
// `known` flips
#[derive(Debug, Clone, Default)]
pub struct GroupClock(Arc<OffsetCell>);

impl GroupClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn known(&self) -> bool {
        self.0.known.load(Acquire)
    }

    pub fn offset(&self) -> f64 {
        f64::from_bits(self.0.bits.load(Relaxed))
    }

    // first write wins; the estimator never reassigns a learned offset
    pub fn learn(&self, offset: f64) -> bool {
        if self.known() {
            return false;
        }
        self.0.bits.store(offset.to_bits(), Relaxed);
        self.0.known.store(true, Release);
        true
    }

    // host restore path, overwrites unconditionally
    pub fn assume(&self, offset: f64) {
        self.0.bits.store(offset.to_bits(), Relaxed);
        self.0.known.store(true, Release);
    }

    pub fn time(&self, clock: &impl LocalClock) -> f64 {
        clock.now() + self.offset()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // broadcast signal, `asktime` is the asker's local send time
    WhatTimeIsIt { asktime: f64 },
    // directed reply. start/finish are the responder's group time on receipt
    // and right before sending
    ReceiveTime {
        asktime: f64,
        start_time: f64,
        finish_time: f64,
    },
}

pub trait Net: SendMessage<All, Message> + SendMessage<PeerName, Message> {}
impl<T: SendMessage<All, Message> + SendMessage<PeerName, Message>> Net for T {}

#[derive(Debug)]
pub struct TimeHandler<N, C> {
    name: Option<PeerName>,
    group: GroupClock,
    clock: C,
    net: N,
}

impl<N, C> TimeHandler<N, C> {
    pub fn new(group: GroupClock, clock: C, net: N) -> Self {
        Self {
            group,
            clock,
            net,
            name: None,
        }
    }

    pub fn group(&self) -> &GroupClock {
        &self.group
    }
}

impl<N: Net, C: LocalClock> OnEvent<Granted> for TimeHandler<N, C> {
    fn on_event(&mut self, granted: Granted) -> anyhow::Result<()> {
        debug!("granted, initiator {}", granted.is_initiator);
        self.name = Some(granted.name);
        if granted.is_initiator {
            self.group.learn(0.);
            return Ok(());
        }
        if self.group.known() {
            return Ok(());
        }
        debug!("ask time");
        self.net.send(
            All,
            Message::WhatTimeIsIt {
                asktime: self.clock.now(),
            },
        )
    }
}

impl<N: Net, C: LocalClock> OnEvent<Recv<Addressed<Message>>> for TimeHandler<N, C> {
    fn on_event(&mut self, Recv(message): Recv<Addressed<Message>>) -> anyhow::Result<()> {
        match message.inner {
            Message::WhatTimeIsIt { asktime } => {
                if Some(&message.sender) == self.name.as_ref() {
                    return Ok(());
                }
                if !self.group.known() {
                    return Ok(());
                }
                debug!("tell time to {}", message.sender);
                let offset = self.group.offset();
                let start_time = self.clock.now() + offset;
                let reply = Message::ReceiveTime {
                    asktime,
                    start_time,
                    finish_time: self.clock.now() + offset,
                };
                self.net.send(message.sender, reply)
            }
            Message::ReceiveTime {
                asktime,
                start_time,
                finish_time,
            } => {
                let rtime = self.clock.now();
                // first response wins, later replies fall through `learn`
                let offset = (start_time + finish_time) / 2. - (asktime + rtime) / 2.;
                if self.group.learn(offset) {
                    debug!("learned offset {offset}")
                }
                Ok(())
            }
        }
    }
}

pub fn on_buf(
    sender: PeerName,
    buf: &[u8],
    out: &mut impl SendEvent<Recv<Addressed<Message>>>,
) -> anyhow::Result<()> {
    out.send(Recv(Addressed {
        sender,
        inner: deserialize(buf)?,
    }))
}
