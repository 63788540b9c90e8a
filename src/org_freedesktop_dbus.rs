//! Constants and reply codes for the `org.freedesktop.DBus` interface.

use crate::ObjectPath;

/// Well known destination name of the message bus.
pub const DESTINATION: &str = "org.freedesktop.DBus";

/// Well known interface name of the message bus.
pub const INTERFACE: &str = "org.freedesktop.DBus";

/// Well known object path of the message bus.
pub const PATH: &ObjectPath = ObjectPath::new_const(b"/org/freedesktop/DBus");

/// The `org.freedesktop.DBus.Peer` interface.
pub const PEER: &str = "org.freedesktop.DBus.Peer";

/// The `org.freedesktop.DBus.Introspectable` interface.
pub const INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";

/// The `org.freedesktop.DBus.Properties` interface.
pub const PROPERTIES: &str = "org.freedesktop.DBus.Properties";

/// The `org.freedesktop.DBus.ObjectManager` interface.
pub const OBJECT_MANAGER: &str = "org.freedesktop.DBus.ObjectManager";

/// Error name replied when a call addresses a path with no exported object.
pub(crate) const ERR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";

/// Error name replied when a call addresses an unknown method.
pub(crate) const ERR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";

/// Error name replied when the arguments of a call do not match.
pub(crate) const ERR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";

/// Error name replied when a property does not exist.
pub(crate) const ERR_UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";

/// Error name replied when a read-only property is written.
pub(crate) const ERR_PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";

raw_set! {
    /// The flags to a `RequestName` call.
    #[repr(u32)]
    pub enum NameFlag {
        /// Allow another application which requests the name with
        /// `REPLACE_EXISTING` to take ownership away from this connection.
        ALLOW_REPLACEMENT = 1,
        /// Try to replace the current owner if there is one and the owner
        /// specified `ALLOW_REPLACEMENT`.
        REPLACE_EXISTING = 2,
        /// Fail the request instead of queueing this connection for
        /// ownership when the name is taken.
        DO_NOT_QUEUE = 4,
    }
}

raw_enum! {
    /// The reply to a `RequestName` call.
    #[repr(u32)]
    pub enum NameReply {
        /// The caller is now the primary owner of the name.
        PRIMARY_OWNER = 1,
        /// The name already has an owner and the caller was placed in the
        /// ownership queue.
        IN_QUEUE = 2,
        /// The name already has an owner and `DO_NOT_QUEUE` was specified.
        EXISTS = 3,
        /// The caller already owns the name.
        ALREADY_OWNER = 4,
    }
}

raw_enum! {
    /// The reply to a `ReleaseName` call.
    #[repr(u32)]
    pub enum ReleaseNameReply {
        /// The name has been released.
        RELEASED = 1,
        /// The name does not exist on the bus.
        NON_EXISTENT = 2,
        /// The caller was not the owner of the name.
        NOT_OWNER = 3,
    }
}
