use std::fmt::Debug;
use std::marker::PhantomData;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

pub trait SendEvent<M> {
    fn send(&mut self, event: M) -> anyhow::Result<()>;
}

pub trait OnEvent<M> {
    fn on_event(&mut self, event: M) -> anyhow::Result<()>;
}

// `SendEvent` is the handle side, `OnEvent` is the state side. no blanket
// bridges the two: state machines implement `OnEvent` for each event they
// consume, senders stay senders

// OnEvent -> SendEvent
pub struct Inline<'a, S, M>(pub &'a mut S, pub PhantomData<M>);

impl<S: Debug, M> Debug for Inline<'_, S, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inline")
            .field("state", &self.0)
            .finish_non_exhaustive()
    }
}

impl<S: OnEvent<M>, N: Into<M>, M> SendEvent<N> for Inline<'_, S, M> {
    fn send(&mut self, event: N) -> anyhow::Result<()> {
        self.0.on_event(event.into())
    }
}

#[derive(Debug)]
pub struct Void; // for testing

impl<M> SendEvent<M> for Void {
    fn send(&mut self, _: M) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<N: Into<M>, M> SendEvent<N> for UnboundedSender<M> {
    fn send(&mut self, event: N) -> anyhow::Result<()> {
        UnboundedSender::send(self, event.into()).map_err(|_| anyhow::anyhow!("channel closed"))
    }
}

#[derive(Debug)]
pub struct SessionSender<M>(UnboundedSender<M>);

impl<M> Clone for SessionSender<M> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<M: Into<N>, N> SendEvent<M> for SessionSender<N> {
    fn send(&mut self, event: M) -> anyhow::Result<()> {
        SendEvent::send(&mut self.0, event.into())
    }
}

pub struct Session<M> {
    sender: UnboundedSender<M>,
    receiver: UnboundedReceiver<M>,
}

impl<M> Debug for Session<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl<M> Session<M> {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded_channel();
        Self { sender, receiver }
    }
}

impl<M> Default for Session<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Session<M> {
    pub fn sender(&self) -> SessionSender<M> {
        SessionSender(self.sender.clone())
    }

    pub async fn run(&mut self, state: &mut impl OnEvent<M>) -> anyhow::Result<()>
    where
        M: Send + 'static,
    {
        loop {
            let event = self
                .receiver
                .recv()
                .await
                .ok_or(anyhow::anyhow!("channel closed"))?;
            state.on_event(event)?
        }
    }
}

// alternative design: type-erased event, for states that consume many event
// types through a single queue
pub mod erased {
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    use super::{OnEvent, SendEvent};

    pub type Event<S> = Box<dyn FnOnce(&mut S) -> anyhow::Result<()> + Send>;

    #[derive(Debug)]
    pub struct Sender<'a, S>(&'a UnboundedSender<Event<S>>);

    impl<'a, S> Sender<'a, S> {
        pub fn new(inner: &'a UnboundedSender<Event<S>>) -> Self {
            Self(inner)
        }
    }

    impl<S: OnEvent<M> + 'static, M: Send + 'static> SendEvent<M> for Sender<'_, S> {
        fn send(&mut self, event: M) -> anyhow::Result<()> {
            let event = move |state: &mut S| state.on_event(event);
            self.0
                .send(Box::new(event) as Event<_>)
                .map_err(|_| anyhow::anyhow!("channel closed"))
        }
    }

    #[derive(Debug)]
    pub struct SessionSender<S>(UnboundedSender<Event<S>>);

    impl<S> Clone for SessionSender<S> {
        fn clone(&self) -> Self {
            Self(self.0.clone())
        }
    }

    impl<S: OnEvent<M> + 'static, M: Send + 'static> SendEvent<M> for SessionSender<S> {
        fn send(&mut self, event: M) -> anyhow::Result<()> {
            Sender::new(&self.0).send(event)
        }
    }

    #[derive(Debug)]
    pub struct Session<S> {
        sender: UnboundedSender<Event<S>>,
        receiver: UnboundedReceiver<Event<S>>,
    }

    impl<S> Session<S> {
        pub fn new() -> Self {
            let (sender, receiver) = unbounded_channel();
            Self { sender, receiver }
        }
    }

    impl<S> Default for Session<S> {
        fn default() -> Self {
            Self::new()
        }
    }

    impl<S> Session<S> {
        pub fn sender(&self) -> SessionSender<S> {
            SessionSender(self.sender.clone())
        }

        pub async fn run(&mut self, state: &mut S) -> anyhow::Result<()> {
            loop {
                let event = self
                    .receiver
                    .recv()
                    .await
                    .ok_or(anyhow::anyhow!("channel closed"))?;
                event(state)?
            }
        }
    }
}
