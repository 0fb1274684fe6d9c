#![warn(missing_docs)]

//! A reliable, ordered-where-it-matters transport built on UDP, for zone
//! servers in the Subspace/Continuum family of games.
//!
//! The core manages per-client connection state, a bandwidth-limited send
//! pipeline with five priority tiers, a bounded reorder buffer for reliable
//! packets, big-data/sized-data fragmentation for payloads larger than a
//! single datagram, and a ping responder. Player lifecycle, arena population,
//! and lag collection are supplied by the embedding application through the
//! traits in [`collab`].
//!
//! # Creating a transport
//!
//! Build a [`config::CoreConfig`], wire up the four [`collab`] collaborators
//! into a [`net::Collaborators`], and construct a [`net::CoreTransport`] with
//! [`net::CoreTransport::new`]. Call [`net::CoreTransport::start`] to spawn
//! its worker threads, then feed inbound datagrams to
//! [`net::CoreTransport::on_datagram`] from your own socket-polling loop (see
//! [`io::DatagramIo`]).
//!
//! # Sending data
//!
//! Use [`net::CoreTransport::send_to_one`] for a single connection,
//! [`net::CoreTransport::send_to_set`] for a group, or
//! [`net::CoreTransport::send_with_callback`] when the caller needs to know
//! whether a reliable packet was eventually acked or dropped. Arbitrarily
//! large payloads go through [`net::CoreTransport::send_sized`].
//!
//! # Closing a connection
//!
//! [`lifecycle::check_lagout`] and [`lifecycle::teardown`] run automatically
//! as part of the send worker's periodic pass; nothing else need be done by
//! the embedder beyond honoring [`collab::PlayerManager::kick`].

pub mod bigdata;
pub mod callbacks;
pub mod collab;
pub mod config;
pub mod connection;
pub mod encrypt;
pub mod error;
pub mod io;
pub mod lifecycle;
pub mod limiter;
pub mod net;
pub mod ping;
pub mod pool;
pub mod priority;
pub mod receive;
pub mod reorder;
pub mod send;
pub mod sizedrecv;
pub mod sizedsend;
pub mod stats;
pub mod table;
pub mod wire;

pub use collab::{ArenaManager, KickReason, LagCollector, MainThreadQueue, PlayerId, PlayerManager, Prng};
pub use config::{CoreConfig, ListenConfig, SimplePingPopulationMode};
pub use connection::{Connection, ConnectionState};
pub use encrypt::{Encryptor, NullEncryptor};
pub use error::ConfigError;
pub use limiter::{BandwidthLimiter, LimiterInfo, TokenBucketLimiter};
pub use net::{Collaborators, CoreTransport, PacketHandler, SizedPacketHandler};
pub use priority::{BandwidthPriority, SendFlags};
pub use stats::{ConnectionStats, PopulationStats};
