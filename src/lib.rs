#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod backend;
mod client;
mod completion;
mod dispatch;
mod error;
mod kv;
mod ledger;
mod message;
mod options;
mod protocol;
mod registry;
mod session;
mod url_list;

pub use client::{Client, Subscription};
pub use error::{EftlError, ErrorCode};
pub use kv::KvMap;
pub use message::{Message, Receipt, ReplyTo};
pub use options::{AckMode, Authorization, ClientOptions, DurableType, SubscriptionOptions};
pub use registry::MessageCallback;
pub use session::ConnectionState;
