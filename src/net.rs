use std::{fmt::Debug, hash::Hash, marker::PhantomData};

use bincode::Options;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

pub trait Addr: Debug + Clone + Eq + Hash + Send + Sync + 'static {}
impl<T: Debug + Clone + Eq + Hash + Send + Sync + 'static> Addr for T {}

// the broadcast destination. a `SendMessage<All, M>` net delivers to every
// group member, the sender included: the underlying bus echoes signals back,
// receivers are expected to drop their own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct All;

// one-way unreliable send. no completion notification, no failure observation
// beyond logging on the implementor side
pub trait SendMessage<A, M> {
    fn send(&mut self, dest: A, message: M) -> anyhow::Result<()>;
}

pub mod events {
    #[derive(Debug, Clone)]
    pub struct Recv<M>(pub M);
}

pub fn serialize<M: Serialize>(message: &M) -> anyhow::Result<Bytes> {
    Ok(bincode::options().serialize(message)?.into())
}

pub fn deserialize<M: DeserializeOwned>(buf: &[u8]) -> anyhow::Result<M> {
    Ok(bincode::options().deserialize(buf)?)
}

// typed message net over a raw buffer net. outgoing messages convert `Into`
// the wire type `M` before encoding, so one `MessageNet` can serve several
// local message types that share a wire enum
pub struct MessageNet<N, M>(pub N, PhantomData<M>);

impl<N: Debug, M> Debug for MessageNet<N, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MessageNet").field(&self.0).finish()
    }
}

impl<N: Clone, M> Clone for MessageNet<N, M> {
    fn clone(&self) -> Self {
        Self(self.0.clone(), PhantomData)
    }
}

impl<N, M> MessageNet<N, M> {
    pub fn new(raw_net: N) -> Self {
        Self(raw_net, PhantomData)
    }
}

impl<N, M> From<N> for MessageNet<N, M> {
    fn from(value: N) -> Self {
        Self::new(value)
    }
}

impl<N: SendMessage<A, Bytes>, A: Addr, M: Into<W>, W: Serialize> SendMessage<A, M>
    for MessageNet<N, W>
{
    fn send(&mut self, dest: A, message: M) -> anyhow::Result<()> {
        let buf = serialize(&message.into())?;
        self.0.send(dest, buf)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe(u32, String);

    #[test]
    fn round_trip() -> anyhow::Result<()> {
        let probe = Probe(7, "probe".into());
        let decoded = deserialize::<Probe>(&serialize(&probe)?)?;
        assert_eq!(decoded, probe);
        Ok(())
    }

    #[test]
    fn decode_failure_is_error() {
        assert!(deserialize::<Probe>(&[0xff; 3]).is_err())
    }
}
