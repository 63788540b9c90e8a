use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::interface::{Interface, Method, Property, SignalDef};
use crate::match_rule::{MatchRule, MatchType};
use crate::message::{Message, MessageKind};
use crate::object::ObjectBuilder;
use crate::org_freedesktop_dbus as fdo;
use crate::proto::Flags;
use crate::value::Value;
use crate::{ObjectPath, Signature};

use super::{CallOptions, Connection, ConnectionBuilder, ReturnValue};

/// The bus side of a socket pair, scripted by each test.
struct MockBus {
    stream: UnixStream,
    buf: Vec<u8>,
    serial: u32,
}

impl MockBus {
    /// Accept the SASL handshake and answer the `Hello` bootstrap call.
    async fn accept(mut stream: UnixStream) -> MockBus {
        let mut buf = Vec::new();

        // The credential NUL byte.
        read_until(&mut stream, &mut buf, |b| !b.is_empty()).await;
        assert_eq!(buf.remove(0), 0);

        // AUTH line.
        let line = read_line(&mut stream, &mut buf).await;
        assert!(line.starts_with(b"AUTH "), "unexpected {line:?}");
        stream.write_all(b"OK 1234deadbeefcafe\r\n").await.unwrap();

        // BEGIN.
        let line = read_line(&mut stream, &mut buf).await;
        assert_eq!(line, b"BEGIN\r\n");

        let mut bus = MockBus {
            stream,
            buf,
            serial: 0,
        };

        // Hello.
        let hello = bus.next_message().await;
        assert_eq!(hello.member(), Some("Hello"));
        let serial = hello.serial().unwrap();

        bus.send(Message::method_return(serial).with_body(vec![":1.0".into()]))
            .await;

        bus
    }

    async fn next_message(&mut self) -> Message {
        loop {
            if let Some(total) = Message::required_len(&self.buf).unwrap() {
                if self.buf.len() >= total {
                    let frame: Vec<u8> = self.buf.drain(..total).collect();
                    return Message::decode(&frame, Vec::new()).unwrap();
                }
            }

            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client hung up");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn send(&mut self, message: Message) {
        self.serial += 1;
        let serial = NonZeroU32::new(self.serial).unwrap();
        let bytes = message.with_serial(serial).encode().unwrap();
        self.stream.write_all(&bytes).await.unwrap();
    }

    /// Answer one `AddMatch` call.
    async fn serve_add_match(&mut self) {
        let message = self.next_message().await;
        assert_eq!(message.member(), Some("AddMatch"));
        let serial = message.serial().unwrap();
        self.send(Message::method_return(serial)).await;
    }
}

async fn read_until(stream: &mut UnixStream, buf: &mut Vec<u8>, done: impl Fn(&[u8]) -> bool) {
    while !done(buf) {
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client hung up");
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn read_line(stream: &mut UnixStream, buf: &mut Vec<u8>) -> Vec<u8> {
    read_until(stream, buf, |b| b.contains(&b'\n')).await;
    let n = buf.iter().position(|&b| b == b'\n').unwrap();
    buf.drain(..=n).collect()
}

async fn connect_pair() -> (Connection, MockBus) {
    let (client, server) = UnixStream::pair().unwrap();

    let bus = tokio::spawn(MockBus::accept(server));
    let connection = ConnectionBuilder::new()
        .negotiate_unix_fd(false)
        .connect_unix_stream(client);

    let (connection, bus) = tokio::join!(connection, bus);
    (connection.unwrap(), bus.unwrap())
}

#[tokio::test]
async fn connect_learns_the_unique_name() {
    let (connection, _bus) = connect_pair().await;
    assert_eq!(connection.unique_name(), Some(":1.0"));
}

#[tokio::test]
async fn call_remote_decodes_replies() {
    let (connection, mut bus) = connect_pair().await;

    let served = tokio::spawn(async move {
        // Empty reply.
        let m = bus.next_message().await;
        let serial = m.serial().unwrap();
        bus.send(Message::method_return(serial)).await;

        // Single value.
        let m = bus.next_message().await;
        let serial = m.serial().unwrap();
        bus.send(Message::method_return(serial).with_body(vec![Value::UInt32(7)]))
            .await;

        // Tuple.
        let m = bus.next_message().await;
        let serial = m.serial().unwrap();
        bus.send(
            Message::method_return(serial).with_body(vec![Value::UInt32(1), "two".into()]),
        )
        .await;

        bus
    });

    let options = || CallOptions::new().destination("org.example");

    let reply = connection
        .call_remote("/a", "Empty", vec![], options())
        .await
        .unwrap();
    assert_eq!(reply, ReturnValue::Empty);

    let reply = connection
        .call_remote("/a", "Single", vec![], options())
        .await
        .unwrap();
    assert_eq!(reply, ReturnValue::Single(Value::UInt32(7)));

    let reply = connection
        .call_remote("/a", "Tuple", vec![], options())
        .await
        .unwrap();
    assert_eq!(
        reply,
        ReturnValue::Tuple(vec![Value::UInt32(1), "two".into()])
    );

    served.await.unwrap();
}

#[tokio::test]
async fn remote_errors_carry_name_and_message() {
    let (connection, mut bus) = connect_pair().await;

    let served = tokio::spawn(async move {
        let m = bus.next_message().await;
        let serial = m.serial().unwrap();
        bus.send(
            Message::error("org.example.Error.Nope", serial)
                .with_body(vec!["not today".into()]),
        )
        .await;
        bus
    });

    let err = connection
        .call_remote(
            "/a",
            "Nope",
            vec![],
            CallOptions::new().destination("org.example"),
        )
        .await
        .unwrap_err();

    assert!(err.is_remote());
    assert_eq!(err.error_name(), Some("org.example.Error.Nope"));
    assert_eq!(err.error_message(), Some("not today"));

    served.await.unwrap();
}

#[tokio::test]
async fn timeout_fires_and_late_reply_is_dropped() {
    let (connection, mut bus) = connect_pair().await;

    let served = tokio::spawn(async move {
        // Hold the serial of the slow call, never replying in time.
        let m = bus.next_message().await;
        assert_eq!(m.member(), Some("SlowOp"));
        let slow_serial = m.serial().unwrap();

        // The next call arrives after the timeout fired; reply to the old
        // serial first, then to the new call.
        let m = bus.next_message().await;
        let serial = m.serial().unwrap();

        bus.send(Message::method_return(slow_serial).with_body(vec!["late".into()]))
            .await;
        bus.send(Message::method_return(serial).with_body(vec!["fresh".into()]))
            .await;

        bus
    });

    let err = connection
        .call_remote(
            "/a",
            "SlowOp",
            vec![],
            CallOptions::new()
                .destination("org.example")
                .timeout(Duration::from_millis(10)),
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout());

    // The connection survives the late reply and keeps serving calls.
    let reply = connection
        .call_remote(
            "/a",
            "FollowUp",
            vec![],
            CallOptions::new().destination("org.example"),
        )
        .await
        .unwrap();

    assert_eq!(reply, ReturnValue::Single(Value::from("fresh")));

    served.await.unwrap();
}

#[tokio::test]
async fn no_reply_expected_resolves_immediately() {
    let (connection, mut bus) = connect_pair().await;

    let reply = connection
        .call_remote(
            "/a",
            "FireAndForget",
            vec![Value::UInt32(1)],
            CallOptions::new().destination("org.example").no_reply(),
        )
        .await
        .unwrap();

    assert_eq!(reply, ReturnValue::Empty);

    let m = bus.next_message().await;
    assert_eq!(m.member(), Some("FireAndForget"));
    assert!(m.flags() & Flags::NO_REPLY_EXPECTED);
}

#[tokio::test]
async fn signals_dispatch_to_matching_handlers_in_order() {
    let (connection, mut bus) = connect_pair().await;

    let bus_task = tokio::spawn(async move {
        bus.serve_add_match().await;

        let path = ObjectPath::new("/org/example/w").unwrap();

        for n in 0..3u32 {
            bus.send(
                Message::signal(path, "Pulse")
                    .with_interface("org.example.Widget")
                    .with_sender(":1.5")
                    .with_body(vec![Value::UInt32(n)]),
            )
            .await;
        }

        // An unrelated signal the rule must not match.
        bus.send(
            Message::signal(path, "Other")
                .with_interface("org.example.Widget")
                .with_sender(":1.5")
                .with_body(vec![Value::UInt32(99)]),
        )
        .await;

        // Serve a final call so the test can synchronize.
        let m = bus.next_message().await;
        let serial = m.serial().unwrap();
        bus.send(Message::method_return(serial)).await;

        bus
    });

    let seen = Arc::new(Mutex::new(Vec::new()));

    let rule = MatchRule::new()
        .message_type(MatchType::Signal)
        .interface("org.example.Widget")
        .member("Pulse");

    let guard = {
        let seen = Arc::clone(&seen);

        connection
            .add_match(rule, move |message: &Message| {
                seen.lock().unwrap().push(message.body()[0].clone());
            })
            .await
            .unwrap()
    };

    // Synchronize: all signals precede this reply on the stream.
    connection
        .call_remote(
            "/a",
            "Sync",
            vec![],
            CallOptions::new().destination("org.example"),
        )
        .await
        .unwrap();

    assert_eq!(
        *seen.lock().unwrap(),
        vec![Value::UInt32(0), Value::UInt32(1), Value::UInt32(2)]
    );

    guard.remove();
    bus_task.await.unwrap();
}

#[tokio::test]
async fn exported_objects_answer_calls_and_emit_property_changes() {
    let (connection, mut bus) = connect_pair().await;

    let iface = Interface::new("org.example.Widget")
        .unwrap()
        .with_method(Method::new("Echo", Signature::STRING, Signature::STRING))
        .with_signal(SignalDef::new("Pulse", Signature::UINT32))
        .with_property(Property::new("foo", Signature::STRING).writeable());

    let object = ObjectBuilder::new(ObjectPath::new("/org/example/w").unwrap())
        .interface(iface)
        .handler("Echo", |invocation| async move {
            Ok(invocation.args)
        })
        .property_value("org.example.Widget", "foo", "bar".into())
        .build()
        .unwrap();

    connection.export(object).await.unwrap();

    // Export announces itself with InterfacesAdded.
    let added = bus.next_message().await;
    assert!(matches!(
        added.kind(),
        MessageKind::Signal { member, .. } if &**member == "InterfacesAdded"
    ));

    // A round trip through the exported method.
    bus.send(
        Message::method_call(ObjectPath::new("/org/example/w").unwrap(), "Echo")
            .with_sender(":1.7")
            .with_body(vec!["hello".into()]),
    )
    .await;

    let reply = bus.next_message().await;
    assert!(matches!(reply.kind(), MessageKind::MethodReturn { .. }));
    assert_eq!(reply.body(), [Value::from("hello")]);
    assert_eq!(reply.destination(), Some(":1.7"));

    // Properties.Set produces the reply and a PropertiesChanged signal.
    bus.send(
        Message::method_call(ObjectPath::new("/org/example/w").unwrap(), "Set")
            .with_interface(fdo::PROPERTIES)
            .with_sender(":1.7")
            .with_body(vec![
                "org.example.Widget".into(),
                "foo".into(),
                Value::variant(Value::from("baz")),
            ]),
    )
    .await;

    let reply = bus.next_message().await;
    assert!(matches!(reply.kind(), MessageKind::MethodReturn { .. }));

    let changed = bus.next_message().await;
    assert!(matches!(
        changed.kind(),
        MessageKind::Signal { member, .. } if &**member == "PropertiesChanged"
    ));

    // Programmatic signal emission validates against the declaration.
    connection
        .emit_signal(
            ObjectPath::new("/org/example/w").unwrap(),
            None,
            "Pulse",
            vec![Value::UInt32(3)],
        )
        .await
        .unwrap();

    let pulse = bus.next_message().await;
    assert_eq!(pulse.member(), Some("Pulse"));
    assert_eq!(pulse.body(), [Value::UInt32(3)]);

    assert!(connection
        .emit_signal(
            ObjectPath::new("/org/example/w").unwrap(),
            None,
            "Pulse",
            vec![Value::from("wrong type")],
        )
        .await
        .is_err());

    // Local property access through the handle.
    let value = connection
        .exported_property(
            ObjectPath::new("/org/example/w").unwrap(),
            "org.example.Widget",
            "foo",
        )
        .await
        .unwrap();
    assert_eq!(value, Some(Value::from("baz")));
}

#[tokio::test]
async fn disconnect_fails_outstanding_calls() {
    let (connection, mut bus) = connect_pair().await;

    let pending = {
        let connection = connection.clone();

        tokio::spawn(async move {
            connection
                .call_remote(
                    "/a",
                    "NeverAnswered",
                    vec![],
                    CallOptions::new().destination("org.example"),
                )
                .await
        })
    };

    // Wait for the call to arrive, then hang up.
    let m = bus.next_message().await;
    assert_eq!(m.member(), Some("NeverAnswered"));
    drop(bus);

    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_disconnected());

    connection.closed().await;
}
