// replicated objects for ad-hoc peer groups over a lossy broadcast channel.
// every shared value converges to the same state on every peer once the
// group is quiescent, regardless of delivery order: grow-only sets and the
// event-log watch model merge commutatively, registers resolve by
// last-writer-wins over a total order, and a decentralized clock exchange
// supplies the shared timeline the time-stamped registers score against.
// the channel itself (a named multicast bus with per-object paths, directed
// calls and participant notifications) is consumed through the `tube`
// abstraction; the host owns the latch (`TubeBox`) and the ingress router
// (`Dispatch`) and wires both to its transport of choice

pub mod event;
pub mod net;
pub mod register;
pub mod set;
pub mod time;
pub mod tube;
pub mod unordered;
pub mod watch;
