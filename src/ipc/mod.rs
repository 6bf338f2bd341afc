//! Interprocess communication primitives: two-endpoint parcel channels,
//! shared-state notifications, and the message ports the user-space VFS
//! servers are built on.

pub mod channel;
pub mod msgport;
pub mod notification;

pub use self::channel::{Channel, ChannelId, Parcel};
pub use self::msgport::{Msg, MsgId, MsgPort, MsgPortId, MsgState};
pub use self::notification::{Notification, NotificationId};
