//! Per-connection state and the serialized outbound write path.
//!
//! Every connection is driven by two loops. The server's read loop feeds
//! inbound frames to [`Session::on_frame`] one at a time, and a single
//! [`run_writer`] task drains the session's outbound queue. The queue and an
//! explicit [`WriteState`] live behind one lock, so no matter how many groups
//! broadcast into a session concurrently, at most one transport write is in
//! flight and frames leave in the order they were queued.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};

use tokio::io::AsyncWrite;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::group::Group;
use crate::message::{ChatMessage, ClientToServer, ServerToClient, write_frame};
use crate::registry::Registry;

pub type SessionId = u64;

/// Write sub-state of a session. `Closed` is terminal; the other two flip
/// back and forth as the queue drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Idle,
    Writing,
    Closed,
}

/// Queue and state share one lock: a frame can only be queued or popped
/// together with the state transition that justifies it. The state is `Idle`
/// only while the queue is empty.
struct Outbound {
    queue: VecDeque<ServerToClient>,
    state: WriteState,
}

/// Shared handle to one session. Groups hold these keyed by session id and
/// enqueue broadcast frames through them; the session's writer task drains
/// the queue onto the socket.
pub struct SessionHandle {
    id: SessionId,
    outbound: Mutex<Outbound>,
    wake: Notify,
    /// Sticky group binding, set once by the first message that names a group.
    group: OnceLock<Arc<Group>>,
    max_pending: Option<usize>,
}

impl SessionHandle {
    pub(crate) fn new(id: SessionId, max_pending: Option<usize>) -> Self {
        Self {
            id,
            outbound: Mutex::new(Outbound {
                queue: VecDeque::new(),
                state: WriteState::Idle,
            }),
            wake: Notify::new(),
            group: OnceLock::new(),
            max_pending,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Binds this session to its group. Returns false if a binding already
    /// exists; the first caller wins and later calls change nothing.
    fn bind(&self, group: Arc<Group>) -> bool {
        self.group.set(group).is_ok()
    }

    pub fn bound_group(&self) -> Option<&Arc<Group>> {
        self.group.get()
    }

    /// Queues one frame for delivery. When the writer is idle the frame is
    /// handed to it immediately; when a write is already in flight the frame
    /// waits its turn in FIFO order. A closed session absorbs the frame
    /// silently, so broadcasters never have to check liveness first.
    ///
    /// With a pending cap configured, overflow closes the whole session
    /// rather than dropping individual frames, the same outcome as a failed
    /// write. Closing here touches only this session's own lock, which keeps
    /// the call safe from inside a group broadcast.
    pub async fn enqueue(&self, frame: ServerToClient) {
        let mut outbound = self.outbound.lock().await;
        match outbound.state {
            WriteState::Closed => {
                debug!(session = self.id, "discarding frame for closed session");
            }
            WriteState::Idle => {
                outbound.queue.push_back(frame);
                outbound.state = WriteState::Writing;
                drop(outbound);
                self.wake.notify_one();
            }
            WriteState::Writing => {
                if let Some(cap) = self.max_pending {
                    if outbound.queue.len() >= cap {
                        warn!(
                            session = self.id,
                            cap, "outbound queue overflow, closing slow session"
                        );
                        close_locked(&mut outbound);
                        drop(outbound);
                        self.wake.notify_one();
                        return;
                    }
                }
                outbound.queue.push_back(frame);
            }
        }
    }

    /// Pops the next frame for the writer task. `None` means the queue is
    /// drained (the session turns idle) or the session is closed;
    /// [`is_closed`](Self::is_closed) tells the two apart.
    async fn next_frame(&self) -> Option<ServerToClient> {
        let mut outbound = self.outbound.lock().await;
        if outbound.state == WriteState::Closed {
            return None;
        }
        let frame = outbound.queue.pop_front();
        if frame.is_none() {
            outbound.state = WriteState::Idle;
        }
        frame
    }

    pub async fn is_closed(&self) -> bool {
        self.outbound.lock().await.state == WriteState::Closed
    }

    /// Marks the outbound path closed and discards anything still queued.
    /// Wakes the writer so it can observe the closure and exit.
    async fn close_outbound(&self) {
        let mut outbound = self.outbound.lock().await;
        if outbound.state == WriteState::Closed {
            return;
        }
        close_locked(&mut outbound);
        drop(outbound);
        self.wake.notify_one();
    }

    /// Terminates the session: closes the outbound path and removes this
    /// session from its group, if it ever bound one. Every step tolerates
    /// repetition, so any teardown path may call this without coordinating
    /// with the others.
    pub async fn shutdown(&self) {
        self.close_outbound().await;
        if let Some(group) = self.group.get() {
            group.remove_member(self.id).await;
        }
    }
}

fn close_locked(outbound: &mut Outbound) {
    outbound.state = WriteState::Closed;
    outbound.queue.clear();
}

/// Drains one session's outbound queue onto its write half. Runs as the only
/// task that touches the write half, which is what keeps transport writes
/// from overlapping. Exits once the session closes, from either side: a
/// failed write closes it here, a dead reader or queue overflow closes it
/// elsewhere and the wakeup lands here.
pub async fn run_writer<W>(handle: Arc<SessionHandle>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    loop {
        handle.wake.notified().await;
        while let Some(frame) = handle.next_frame().await {
            if let Err(error) = write_frame(&mut writer, &frame).await {
                debug!(session = handle.id, ?error, "write failed, terminating session");
                handle.shutdown().await;
                return;
            }
        }
        if handle.is_closed().await {
            // Completes deregistration when the closure came from overflow.
            handle.shutdown().await;
            return;
        }
    }
}

/// Read-side of one connection: dispatches inbound frames, performs the
/// one-time group binding, and routes chat messages into the bound group.
pub struct Session {
    handle: Arc<SessionHandle>,
    registry: Arc<Registry>,
}

impl Session {
    pub fn new(id: SessionId, registry: Arc<Registry>, max_pending: Option<usize>) -> Self {
        Self {
            handle: Arc::new(SessionHandle::new(id, max_pending)),
            registry,
        }
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    /// Handles one inbound frame. The caller loops, so exactly one inbound
    /// frame is being handled per connection at any time.
    pub async fn on_frame(&self, frame: ClientToServer) {
        if self.handle.is_closed().await {
            debug!(
                session = self.handle.id,
                "ignoring frame for terminated session"
            );
            return;
        }
        match frame {
            ClientToServer::Message(message) => self.on_message(message).await,
            ClientToServer::CreateGroup { group_name } => {
                self.on_create_group(group_name).await;
            }
        }
    }

    /// Routes one chat message. The first message that names a group binds
    /// the session to it for the rest of its life; the binding is installed
    /// before the membership insert so a concurrent termination always finds
    /// the group to deregister from.
    async fn on_message(&self, message: ChatMessage) {
        if self.handle.bound_group().is_none() && !message.group_name.is_empty() {
            let group = self.registry.get_or_create(&message.group_name).await;
            if self.handle.bind(Arc::clone(&group)) {
                group.add_member(Arc::clone(&self.handle)).await;
                info!(
                    session = self.handle.id,
                    group = %group.name(),
                    "session joined group"
                );
            }
        }

        match self.handle.bound_group() {
            Some(group) if group.name() == message.group_name => {
                group.broadcast(&message, self.handle.id).await;
            }
            Some(group) => {
                warn!(
                    session = self.handle.id,
                    bound = %group.name(),
                    requested = %message.group_name,
                    "dropping message for mismatched group"
                );
            }
            None => {
                warn!(
                    session = self.handle.id,
                    "dropping message from session with no group"
                );
            }
        }
    }

    /// Creates the named group (an existing group is left untouched) and
    /// acknowledges. The acknowledgment goes through the regular outbound
    /// queue; an empty name is acknowledged without creating anything.
    async fn on_create_group(&self, group_name: String) {
        if group_name.is_empty() {
            warn!(
                session = self.handle.id,
                "acknowledging create_group with empty name"
            );
        } else {
            let _ = self.registry.get_or_create(&group_name).await;
        }
        self.handle
            .enqueue(ServerToClient::GroupCreated { group_name })
            .await;
    }

    /// Read-side teardown. EOF and read errors both land here.
    pub async fn on_disconnect(&self) {
        self.handle.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::BroadcastPolicy;
    use crate::message::read_frame;
    use std::time::Duration;
    use tokio::io::{BufReader, DuplexStream};
    use tokio::time::timeout;

    fn chat(sender: &str, group: &str, text: &str) -> ChatMessage {
        ChatMessage {
            sender: sender.into(),
            group_name: group.into(),
            text: text.into(),
            timestamp_ms: 7,
        }
    }

    fn frame(text: &str) -> ServerToClient {
        ServerToClient::Message(chat("relay", "general", text))
    }

    async fn recv(reader: &mut BufReader<DuplexStream>) -> Option<ServerToClient> {
        timeout(Duration::from_secs(1), read_frame(reader))
            .await
            .expect("timed out waiting for a frame")
            .expect("read frame")
    }

    #[tokio::test]
    async fn idle_enqueue_is_written_immediately() {
        let handle = Arc::new(SessionHandle::new(1, None));
        let (socket, peer) = tokio::io::duplex(1024);
        tokio::spawn(run_writer(Arc::clone(&handle), socket));
        let mut reader = BufReader::new(peer);

        handle.enqueue(frame("first")).await;

        assert_eq!(recv(&mut reader).await, Some(frame("first")));
    }

    #[tokio::test]
    async fn queued_frames_drain_in_order() {
        let handle = Arc::new(SessionHandle::new(2, None));

        // All five are queued before the writer task even starts; the first
        // enqueue leaves a stored wakeup for it.
        for i in 0..5 {
            handle.enqueue(frame(&format!("msg-{i}"))).await;
        }

        let (socket, peer) = tokio::io::duplex(1024);
        tokio::spawn(run_writer(Arc::clone(&handle), socket));
        let mut reader = BufReader::new(peer);

        for i in 0..5 {
            assert_eq!(recv(&mut reader).await, Some(frame(&format!("msg-{i}"))));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_enqueues_keep_per_task_order() {
        let handle = Arc::new(SessionHandle::new(3, None));
        let (socket, peer) = tokio::io::duplex(64 * 1024);
        tokio::spawn(run_writer(Arc::clone(&handle), socket));

        let mut producers = Vec::new();
        for task in 0..4u64 {
            let handle = Arc::clone(&handle);
            producers.push(tokio::spawn(async move {
                for seq in 0..25i64 {
                    handle
                        .enqueue(ServerToClient::Message(ChatMessage {
                            sender: format!("task-{task}"),
                            group_name: "stress".into(),
                            text: seq.to_string(),
                            timestamp_ms: seq,
                        }))
                        .await;
                }
            }));
        }
        for producer in producers {
            producer.await.expect("producer task");
        }

        let mut reader = BufReader::new(peer);
        let mut last_seq = [-1i64; 4];
        for _ in 0..100 {
            let received = recv(&mut reader).await.expect("expected a frame");
            let ServerToClient::Message(message) = received else {
                panic!("unexpected frame kind");
            };
            let task: usize = message
                .sender
                .strip_prefix("task-")
                .expect("sender prefix")
                .parse()
                .expect("sender index");
            let seq: i64 = message.text.parse().expect("sequence number");
            assert!(
                seq > last_seq[task],
                "frames from {} arrived out of order",
                message.sender
            );
            last_seq[task] = seq;
        }
    }

    #[tokio::test]
    async fn shutdown_discards_queue_and_absorbs_later_frames() {
        let handle = Arc::new(SessionHandle::new(4, None));
        let (socket, peer) = tokio::io::duplex(1024);
        tokio::spawn(run_writer(Arc::clone(&handle), socket));
        let mut reader = BufReader::new(peer);

        handle.shutdown().await;
        handle.enqueue(frame("too late")).await;

        // The writer observed the closure and dropped its write half.
        assert_eq!(recv(&mut reader).await, None);
        assert!(handle.is_closed().await);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let handle = SessionHandle::new(5, None);
        handle.shutdown().await;
        handle.shutdown().await;
        assert!(handle.is_closed().await);
    }

    #[tokio::test]
    async fn overflow_closes_the_session() {
        let handle = SessionHandle::new(6, Some(2));

        // No writer task is draining, so every frame after the first piles up
        // behind the in-flight write.
        handle.enqueue(frame("a")).await;
        handle.enqueue(frame("b")).await;
        assert!(!handle.is_closed().await);

        handle.enqueue(frame("c")).await;
        assert!(handle.is_closed().await);

        handle.enqueue(frame("d")).await;
        assert!(handle.is_closed().await);
    }

    #[tokio::test]
    async fn first_message_binds_and_sticks() {
        let registry = Arc::new(Registry::new(BroadcastPolicy::IncludeSender));
        let session = Session::new(7, Arc::clone(&registry), None);

        session
            .on_frame(ClientToServer::Message(chat("alice", "alpha", "join")))
            .await;
        let bound = session.handle().bound_group().expect("bound after first message");
        assert_eq!(bound.name(), "alpha");
        assert_eq!(bound.member_count().await, 1);

        // A mismatched tag is dropped without creating or joining anything.
        session
            .on_frame(ClientToServer::Message(chat("alice", "beta", "hop")))
            .await;
        let bound = session.handle().bound_group().expect("binding is sticky");
        assert_eq!(bound.name(), "alpha");
        assert_eq!(bound.member_count().await, 1);
        assert_eq!(registry.group_count().await, 1);
    }

    #[tokio::test]
    async fn empty_group_name_does_not_bind() {
        let registry = Arc::new(Registry::new(BroadcastPolicy::IncludeSender));
        let session = Session::new(8, Arc::clone(&registry), None);

        session
            .on_frame(ClientToServer::Message(chat("bob", "", "lost")))
            .await;

        assert!(session.handle().bound_group().is_none());
        assert_eq!(registry.group_count().await, 0);
        assert!(!session.handle().is_closed().await);
    }

    #[tokio::test]
    async fn create_group_is_acknowledged() {
        let registry = Arc::new(Registry::new(BroadcastPolicy::IncludeSender));
        let session = Session::new(9, Arc::clone(&registry), None);
        let (socket, peer) = tokio::io::duplex(1024);
        tokio::spawn(run_writer(Arc::clone(session.handle()), socket));
        let mut reader = BufReader::new(peer);

        session
            .on_frame(ClientToServer::CreateGroup {
                group_name: "ops".into(),
            })
            .await;

        assert_eq!(
            recv(&mut reader).await,
            Some(ServerToClient::GroupCreated {
                group_name: "ops".into()
            })
        );
        assert_eq!(registry.group_count().await, 1);
        assert!(session.handle().bound_group().is_none());
    }

    #[tokio::test]
    async fn create_group_with_empty_name_acks_without_creating() {
        let registry = Arc::new(Registry::new(BroadcastPolicy::IncludeSender));
        let session = Session::new(10, Arc::clone(&registry), None);
        let (socket, peer) = tokio::io::duplex(1024);
        tokio::spawn(run_writer(Arc::clone(session.handle()), socket));
        let mut reader = BufReader::new(peer);

        session
            .on_frame(ClientToServer::CreateGroup {
                group_name: String::new(),
            })
            .await;

        assert_eq!(
            recv(&mut reader).await,
            Some(ServerToClient::GroupCreated {
                group_name: String::new()
            })
        );
        assert_eq!(registry.group_count().await, 0);
    }

    #[tokio::test]
    async fn disconnect_deregisters_from_group() {
        let registry = Arc::new(Registry::new(BroadcastPolicy::IncludeSender));
        let session = Session::new(11, Arc::clone(&registry), None);

        session
            .on_frame(ClientToServer::Message(chat("carol", "alpha", "join")))
            .await;
        let group = Arc::clone(session.handle().bound_group().expect("bound"));
        assert_eq!(group.member_count().await, 1);

        session.on_disconnect().await;
        assert_eq!(group.member_count().await, 0);

        // Frames after termination are ignored outright.
        session
            .on_frame(ClientToServer::Message(chat("carol", "alpha", "ghost")))
            .await;
        assert_eq!(group.member_count().await, 0);
    }
}
