//! dp5-client: asynchronous DP5 presence client
//!
//! [`PresenceClient`] keeps a client registered on both tracks and its
//! view of which friends are online current, one epoch at a time. It is
//! generic over the cryptographic engine and over the [`Transport`]
//! carrying its messages; [`HttpTransport`] talks to `dp5-server`.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod state;
pub mod transport;

pub use client::{ClientBuilder, ClientCommand, Dispatch, PresenceClient};
pub use config::{ClientConfig, TrackConfig};
pub use error::{ClientError, Result};
pub use http::{HttpTransport, ServerStatus};
pub use state::{ClientSnapshot, ClientState, FriendRecord, Identity};
pub use transport::{Completion, Continuation, NetworkError, ReplyHandle, Step, Transport};
