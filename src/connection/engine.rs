//! The per-connection engine task.
//!
//! The engine owns the transport, the reply table, the match-rule registry
//! and the object registry. Everything it owns is mutated only from its own
//! task; the rest of the crate talks to it through the action channel.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::cmp::Reverse;
use std::num::NonZeroU32;
use std::os::fd::OwnedFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::error::{Error, ErrorKind, Result};
use crate::match_rule::MatchRule;
use crate::message::{Message, MessageKind};
use crate::object::{Dispatch, ExportedObject, ObjectRegistry};
use crate::org_freedesktop_dbus as fdo;
use crate::transport::Transport;
use crate::value::Value;
use crate::OwnedObjectPath;

/// A registered signal handler.
pub(crate) type SignalHandler = Box<dyn FnMut(&Message) + Send>;

/// Requests sent from connection handles to the engine.
pub(crate) enum Action {
    /// Send a method call and deliver its reply.
    Call {
        message: Message,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<Message>>,
    },
    /// Send a message without tracking a reply.
    Send {
        message: Message,
        done: oneshot::Sender<Result<NonZeroU32>>,
    },
    /// Queue an already-built message, with no feedback. Used by deferred
    /// handler tasks.
    Enqueue { message: Message },
    /// Register a match rule, forwarding `AddMatch` to the broker when this
    /// is the first reference to it.
    AddMatch {
        rule: MatchRule,
        handler: SignalHandler,
        done: oneshot::Sender<Result<u64>>,
    },
    /// Drop a match rule registration, forwarding `RemoveMatch` when the
    /// last reference goes away.
    RemoveMatch { id: u64 },
    /// Export an object.
    Export {
        object: ExportedObject,
        done: oneshot::Sender<Result<()>>,
    },
    /// Stop exporting the object at a path.
    Unexport {
        path: OwnedObjectPath,
        done: oneshot::Sender<bool>,
    },
    /// Emit a declared signal from an exported object.
    EmitSignal {
        path: OwnedObjectPath,
        interface: Option<Box<str>>,
        member: Box<str>,
        args: Vec<Value>,
        done: oneshot::Sender<Result<()>>,
    },
    /// Read an exported property value.
    GetProperty {
        path: OwnedObjectPath,
        interface: Box<str>,
        name: Box<str>,
        done: oneshot::Sender<Option<Value>>,
    },
    /// Write an exported property value, emitting `PropertiesChanged` as
    /// declared.
    SetProperty {
        path: OwnedObjectPath,
        interface: Box<str>,
        name: Box<str>,
        value: Value,
        done: oneshot::Sender<Result<()>>,
    },
    /// Shut the connection down.
    Close,
}

/// A reply-table entry.
enum Pending {
    /// A user call waiting for its reply.
    User(oneshot::Sender<Result<Message>>),
    /// A broker `AddMatch` call tied to a local rule registration.
    AddMatch {
        id: u64,
        done: oneshot::Sender<Result<u64>>,
    },
    /// A call whose reply only matters for logging.
    Background,
}

struct RuleEntry {
    id: u64,
    serialized: String,
    rule: MatchRule,
    handler: SignalHandler,
}

/// An outgoing frame, with the fds attached to its first byte.
struct Frame {
    bytes: Vec<u8>,
    fds: Vec<OwnedFd>,
    offset: usize,
}

pub(crate) struct Engine {
    transport: Transport,
    actions: mpsc::UnboundedReceiver<Action>,
    /// Cloned into spawned handler tasks so they can queue their replies.
    tasks: mpsc::UnboundedSender<Action>,
    closed: watch::Sender<bool>,
    recv_buf: Vec<u8>,
    recv_fds: Vec<OwnedFd>,
    send_queue: VecDeque<Frame>,
    queued_bytes: usize,
    max_queued_bytes: usize,
    serial: u32,
    pending: HashMap<u32, Pending>,
    deadlines: BinaryHeap<Reverse<(Instant, u32)>>,
    rules: Vec<RuleEntry>,
    next_rule_id: u64,
    registry: ObjectRegistry,
    /// Set when the send queue exceeded its limit, which shuts the
    /// connection down.
    overflowed: bool,
}

impl Engine {
    pub(crate) fn new(
        transport: Transport,
        recv_buf: Vec<u8>,
        actions: mpsc::UnboundedReceiver<Action>,
        tasks: mpsc::UnboundedSender<Action>,
        closed: watch::Sender<bool>,
        max_queued_bytes: usize,
    ) -> Self {
        Self {
            transport,
            actions,
            tasks,
            closed,
            recv_buf,
            recv_fds: Vec::new(),
            send_queue: VecDeque::new(),
            queued_bytes: 0,
            max_queued_bytes,
            serial: 0,
            pending: HashMap::new(),
            deadlines: BinaryHeap::new(),
            rules: Vec::new(),
            next_rule_id: 1,
            registry: ObjectRegistry::new(),
            overflowed: false,
        }
    }

    /// Drive the connection until it is closed or fails. All outstanding
    /// reply futures are failed with a disconnected error on the way out.
    pub(crate) async fn run(mut self) {
        let result = self.run_inner().await;

        if let Err(error) = &result {
            tracing::debug!(%error, "connection engine stopped");
        }

        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::User(tx) => {
                    let _ = tx.send(Err(Error::new(ErrorKind::Disconnected)));
                }
                Pending::AddMatch { done, .. } => {
                    let _ = done.send(Err(Error::new(ErrorKind::Disconnected)));
                }
                Pending::Background => {}
            }
        }

        let _ = self.closed.send(true);
    }

    async fn run_inner(&mut self) -> Result<()> {
        loop {
            self.drain_incoming()?;

            if self.overflowed {
                return Err(Error::new(ErrorKind::SendQueueFull(self.max_queued_bytes)));
            }

            let deadline = self.deadlines.peek().map(|Reverse((at, _))| *at);

            tokio::select! {
                action = self.actions.recv() => {
                    match action {
                        Some(Action::Close) | None => return Ok(()),
                        Some(action) => self.handle_action(action)?,
                    }
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    self.expire_deadlines();
                }
                n = self.transport.recv(&mut self.recv_buf, &mut self.recv_fds) => {
                    if n? == 0 {
                        return Err(Error::new(ErrorKind::Disconnected));
                    }
                }
                result = write_front(&self.transport, &mut self.send_queue, &mut self.queued_bytes),
                    if !self.send_queue.is_empty() =>
                {
                    result?;
                }
            }
        }
    }

    /// Parse every complete frame in the receive buffer and dispatch it.
    fn drain_incoming(&mut self) -> Result<()> {
        loop {
            let Some(total) = Message::required_len(&self.recv_buf)? else {
                return Ok(());
            };

            if self.recv_buf.len() < total {
                return Ok(());
            }

            let frame: Vec<u8> = self.recv_buf.drain(..total).collect();
            let message = Message::decode_split(&frame, &mut self.recv_fds)?;
            self.dispatch(message)?;
        }
    }

    fn dispatch(&mut self, message: Message) -> Result<()> {
        // Every rule sees every incoming message; handler panics are logged
        // and do not stop the remaining subscribers.
        for entry in &mut self.rules {
            if !entry.rule.matches(&message) {
                continue;
            }

            let handler = &mut entry.handler;

            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&message))) {
                let what = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());

                tracing::error!(rule = %entry.serialized, panic = %what, "signal handler panicked");
            }
        }

        match &message.kind {
            MessageKind::MethodReturn { reply_serial } => {
                self.complete(reply_serial.get(), Ok(message));
            }
            MessageKind::Error {
                reply_serial,
                error_name,
            } => {
                let text = match message.body.first() {
                    Some(Value::String(s)) => Some(s.clone().into_boxed_str()),
                    _ => None,
                };

                let error = Error::remote(error_name.clone(), text);
                self.complete(reply_serial.get(), Err(error));
            }
            MessageKind::MethodCall { .. } => {
                match self.registry.dispatch(&message) {
                    Dispatch::Messages(messages) => {
                        for message in messages {
                            self.queue_message(message)?;
                        }
                    }
                    Dispatch::Deferred { future, template } => {
                        let tasks = self.tasks.clone();

                        tokio::spawn(async move {
                            let result = future.await;

                            if let Some(message) = template.build(result) {
                                let _ = tasks.send(Action::Enqueue { message });
                            }
                        });
                    }
                }
            }
            MessageKind::Signal { .. } => {}
        }

        Ok(())
    }

    /// Fulfill the reply-table entry for a serial. Unmatched replies, such
    /// as replies arriving after a timeout, are dropped.
    fn complete(&mut self, reply_serial: u32, result: Result<Message>) {
        let Some(pending) = self.pending.remove(&reply_serial) else {
            return;
        };

        match pending {
            Pending::User(tx) => {
                let _ = tx.send(result);
            }
            Pending::AddMatch { id, done } => match result {
                Ok(..) => {
                    let _ = done.send(Ok(id));
                }
                Err(error) => {
                    self.rules.retain(|entry| entry.id != id);
                    let _ = done.send(Err(error));
                }
            },
            Pending::Background => {
                if let Err(error) = result {
                    tracing::debug!(%error, "background bus call failed");
                }
            }
        }
    }

    fn handle_action(&mut self, action: Action) -> Result<()> {
        match action {
            Action::Call {
                message,
                timeout,
                reply,
            } => {
                // The reply-table entry is registered before the message
                // hits the wire.
                match self.queue_call(message, Pending::User(reply), timeout) {
                    Ok(..) => {}
                    Err((error, Pending::User(reply))) => {
                        let _ = reply.send(Err(error));
                    }
                    Err(..) => {}
                }
            }
            Action::Send { message, done } => {
                let _ = done.send(self.queue_message(message));
            }
            Action::Enqueue { message } => {
                self.queue_message(message)?;
            }
            Action::AddMatch {
                rule,
                handler,
                done,
            } => {
                self.add_match(rule, handler, done);
            }
            Action::RemoveMatch { id } => {
                self.remove_match(id);
            }
            Action::Export { object, done } => {
                let result = self.registry.export(object).and_then(|signal| {
                    self.queue_message(signal)?;
                    Ok(())
                });

                let _ = done.send(result);
            }
            Action::Unexport { path, done } => {
                let removed = match self.registry.unexport(&path) {
                    Some(signal) => {
                        self.queue_message(signal)?;
                        true
                    }
                    None => false,
                };

                let _ = done.send(removed);
            }
            Action::EmitSignal {
                path,
                interface,
                member,
                args,
                done,
            } => {
                let result = self
                    .registry
                    .signal(&path, interface.as_deref(), &member, args)
                    .and_then(|signal| {
                        self.queue_message(signal)?;
                        Ok(())
                    });

                let _ = done.send(result);
            }
            Action::GetProperty {
                path,
                interface,
                name,
                done,
            } => {
                let _ = done.send(self.registry.property(&path, &interface, &name));
            }
            Action::SetProperty {
                path,
                interface,
                name,
                value,
                done,
            } => {
                let result = match self.registry.set_property(&path, &interface, &name, value, false)
                {
                    Ok(Some(signal)) => self.queue_message(signal).map(|_| ()),
                    Ok(None) => Ok(()),
                    Err(call_error) => {
                        let (name, message) = call_error.into_parts();
                        Err(Error::remote(name, Some(message)))
                    }
                };

                let _ = done.send(result);
            }
            Action::Close => return Ok(()),
        }

        Ok(())
    }

    fn add_match(
        &mut self,
        rule: MatchRule,
        handler: SignalHandler,
        done: oneshot::Sender<Result<u64>>,
    ) {
        let id = self.next_rule_id;
        self.next_rule_id += 1;

        let serialized = rule.to_string();
        let first = !self.rules.iter().any(|entry| entry.serialized == serialized);

        self.rules.push(RuleEntry {
            id,
            serialized: serialized.clone(),
            rule,
            handler,
        });

        if !first {
            let _ = done.send(Ok(id));
            return;
        }

        let message = bus_call("AddMatch", vec![Value::from(serialized)]);

        if let Err((error, pending)) = self.queue_call(message, Pending::AddMatch { id, done }, None)
        {
            self.rules.retain(|entry| entry.id != id);

            if let Pending::AddMatch { done, .. } = pending {
                let _ = done.send(Err(error));
            }
        }
    }

    fn remove_match(&mut self, id: u64) {
        let Some(n) = self.rules.iter().position(|entry| entry.id == id) else {
            return;
        };

        let entry = self.rules.remove(n);

        let last = !self
            .rules
            .iter()
            .any(|other| other.serialized == entry.serialized);

        if last {
            let message = bus_call("RemoveMatch", vec![Value::from(entry.serialized)]);
            let _ = self.queue_call(message, Pending::Background, None);
        }
    }

    /// Allocate the next serial: 1..=u32::MAX, skipping zero on wrap.
    fn next_serial(&mut self) -> NonZeroU32 {
        loop {
            self.serial = self.serial.wrapping_add(1);

            if let Some(serial) = NonZeroU32::new(self.serial) {
                return serial;
            }
        }
    }

    /// Register a reply-table entry and queue the call.
    fn queue_call(
        &mut self,
        message: Message,
        pending: Pending,
        timeout: Option<Duration>,
    ) -> Result<NonZeroU32, (Error, Pending)> {
        let serial = match self.queue_message(message) {
            Ok(serial) => serial,
            Err(error) => return Err((error, pending)),
        };

        self.pending.insert(serial.get(), pending);

        if let Some(timeout) = timeout {
            self.deadlines
                .push(Reverse((Instant::now() + timeout, serial.get())));
        }

        Ok(serial)
    }

    /// Assign a serial, encode and queue one message.
    fn queue_message(&mut self, message: Message) -> Result<NonZeroU32> {
        let serial = self.next_serial();
        let message = message.with_serial(serial);

        let bytes = message.encode()?;
        let mut message = message;
        let fds = message.take_fds();

        if self.queued_bytes + bytes.len() > self.max_queued_bytes {
            self.overflowed = true;
            return Err(Error::new(ErrorKind::SendQueueFull(self.max_queued_bytes)));
        }

        self.queued_bytes += bytes.len();

        self.send_queue.push_back(Frame {
            bytes,
            fds,
            offset: 0,
        });

        Ok(serial)
    }

    fn expire_deadlines(&mut self) {
        let now = Instant::now();

        while let Some(Reverse((at, serial))) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }

            self.deadlines.pop();

            // The entry may already have been completed by a reply.
            if let Some(pending) = self.pending.remove(&serial) {
                match pending {
                    Pending::User(tx) => {
                        let _ = tx.send(Err(Error::new(ErrorKind::TimedOut)));
                    }
                    Pending::AddMatch { id, done } => {
                        self.rules.retain(|entry| entry.id != id);
                        let _ = done.send(Err(Error::new(ErrorKind::TimedOut)));
                    }
                    Pending::Background => {}
                }
            }
        }
    }
}

/// Write the front of the send queue, preserving message boundaries across
/// partial writes.
async fn write_front(
    transport: &Transport,
    queue: &mut VecDeque<Frame>,
    queued_bytes: &mut usize,
) -> Result<()> {
    let Some(front) = queue.front_mut() else {
        return Ok(());
    };

    // The fds ride along the first byte of the frame. They are kept in the
    // frame until the write succeeds so that cancellation cannot lose them.
    let n = if front.offset == 0 {
        let n = transport.send(&front.bytes, &front.fds).await?;
        front.fds.clear();
        n
    } else {
        transport.send(&front.bytes[front.offset..], &[]).await?
    };

    front.offset += n;
    *queued_bytes = queued_bytes.saturating_sub(n);

    if front.offset == front.bytes.len() {
        queue.pop_front();
    }

    Ok(())
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A method call addressed to the message bus itself.
fn bus_call(member: &str, args: Vec<Value>) -> Message {
    Message::method_call(fdo::PATH, member)
        .with_interface(fdo::INTERFACE)
        .with_destination(fdo::DESTINATION)
        .with_body(args)
}

#[cfg(test)]
mod tests {
    use tokio::net::UnixStream;
    use tokio::sync::{mpsc, watch};

    use super::*;

    fn test_engine(serial: u32) -> Engine {
        let (a, b) = UnixStream::pair().unwrap();
        // The peer half is leaked so reads stay pending rather than
        // signalling EOF.
        std::mem::forget(b);

        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let mut engine = Engine::new(Transport::Unix(a), Vec::new(), rx, tx, closed, 1 << 20);
        engine.serial = serial;
        engine
    }

    #[tokio::test]
    async fn serial_allocation_skips_zero_on_wrap() {
        let mut engine = test_engine(u32::MAX - 2);

        assert_eq!(engine.next_serial().get(), u32::MAX - 1);
        assert_eq!(engine.next_serial().get(), u32::MAX);
        // Zero is skipped on wrap.
        assert_eq!(engine.next_serial().get(), 1);
        assert_eq!(engine.next_serial().get(), 2);
    }

    #[tokio::test]
    async fn serials_are_strictly_monotonic() {
        let mut engine = test_engine(0);
        let mut last = 0;

        for _ in 0..10_000 {
            let serial = engine.next_serial().get();
            assert!(serial > last);
            last = serial;
        }
    }

    #[tokio::test]
    async fn queue_overflow_is_flagged() {
        let mut engine = test_engine(0);
        engine.max_queued_bytes = 64;

        let message = Message::method_call(crate::ObjectPath::ROOT, "Ping")
            .with_body(vec![Value::from("a string that does not fit in the queue")]);

        assert!(engine.queue_message(message).is_err());
        assert!(engine.overflowed);
    }
}
