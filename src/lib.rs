//! Asterisk Manager Interface (AMI) client for Rust
//!
//! This crate provides an async Rust client for the Asterisk Manager Interface,
//! allowing applications to log in to Asterisk, send actions, drive AsyncAGI
//! channels, originate calls, and receive events.
//!
//! # Architecture
//!
//! The library uses a split reader/writer design:
//! - [`AmiClient`] (Clone + Send): send actions from any task
//! - [`AmiEventStream`]: receive notifications from a background session task
//!
//! Replies are correlated by `ActionID` (actions and originate results) and
//! `CommandID` (AsyncAGI commands), so many requests can be in flight at once.
//! The session task reconnects after a configurable delay; pending requests
//! survive a reconnect.
//!
//! # Examples
//!
//! ## Sending actions
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{AmiAction, AmiClient, AmiConfig, AmiError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), AmiError> {
//!     let config = AmiConfig::new("localhost", 5038, "admin", "secret");
//!     let (client, _events) = AmiClient::connect(config).await?;
//!
//!     let reply = client.action(AmiAction::new("CoreSettings")).await?;
//!     println!("Version: {}", reply.get("AsteriskVersion").unwrap_or("?"));
//!
//!     let uptime = client.get_var(None, "UPTIME").await?;
//!     println!("{}", uptime);
//!     Ok(())
//! }
//! ```
//!
//! ## Originate and AsyncAGI
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{AgiRequest, AmiClient, AmiConfig, OriginateRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (client, _events) =
//!         AmiClient::connect(AmiConfig::new("localhost", 5038, "admin", "secret")).await?;
//!
//!     // Resolves on the terminal OriginateResponse event.
//!     let call = client
//!         .originate(
//!             OriginateRequest::new("PJSIP/1000")
//!                 .field("Application", "AGI")
//!                 .field("Data", "agi:async")
//!                 .variable("CALLERID(name)", "Robot")
//!                 .synchronous(),
//!         )
//!         .await?;
//!     if let Some(done) = call.completed {
//!         done.await?;
//!     }
//!
//!     let agi = client
//!         .agi(AgiRequest::new("PJSIP/1000-00000001", "EXEC Playback demo-congrats").with_completion())
//!         .await?;
//!     agi.accepted.await?;
//!     if let Some(done) = agi.completed {
//!         let exec = done.await?;
//!         println!("{:?}", exec.get("Result"));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Notifications
//!
//! ```rust,no_run
//! use asterisk_ami_tokio::{AmiClient, AmiConfig, Notification};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AmiConfig::new("localhost", 5038, "admin", "secret")
//!         .with_reconnect_delay(Duration::from_secs(5));
//!     let (_client, mut events) = AmiClient::connect(config).await?;
//!
//!     while let Some(item) = events.recv().await {
//!         match item? {
//!             Notification::Event { name, message } if name == "Hangup" => {
//!                 println!("hangup on {}", message.get("Channel").unwrap_or("?"));
//!             }
//!             Notification::AgiSessionStart { env, .. } => {
//!                 println!("AGI session for {:?}", env.get("agi_channel"));
//!             }
//!             other => println!("{}", other.topic()),
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Framing without a socket
//!
//! [`AmiCodec`] and [`codec::encode`] are usable on their own:
//!
//! ```rust
//! use asterisk_ami_tokio::{AmiAction, AmiCodec, Frame};
//!
//! let mut codec = AmiCodec::new();
//! let frames: Vec<Frame> = codec
//!     .feed(b"Asterisk Call Manager/5.0.1\r\nResponse: Success\r\nActionID: 1\r\n\r\n")
//!     .unwrap()
//!     .collect();
//! assert_eq!(frames.len(), 2);
//! assert_eq!(codec.banner(), Some("Asterisk Call Manager/5.0.1"));
//!
//! let wire = asterisk_ami_tokio::codec::encode(&AmiAction::new("Ping").field("ActionID", "1")).unwrap();
//! assert_eq!(wire, "Action: Ping\r\nActionID: 1\r\n\r\n");
//! ```

#[macro_use]
mod macros;

pub mod action;
pub mod codec;
pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod headers;
pub mod message;
pub mod notification;

pub(crate) mod registry;

pub use action::{AgiRequest, AmiAction, FieldValue, OriginateRequest};
pub use codec::{classify, AmiCodec, Frame, Signal};
pub use config::AmiConfig;
pub use connection::{AgiPending, AmiClient, OriginatePending};
pub use constants::DEFAULT_AMI_PORT;
pub use error::{AmiError, AmiResult};
pub use headers::{AmiHeader, ParseAmiHeaderError};
pub use message::{decode_env, AmiMessage, HeaderValue, MessageKind};
pub use notification::{AmiEventStream, ConnectionState, DisconnectReason, Notification};
pub use registry::PendingReply;
