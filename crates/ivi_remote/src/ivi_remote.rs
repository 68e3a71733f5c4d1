//! IVI Remote
//!
//! Out-of-process transport for feature backends. A backend process serves
//! named [`RemoteSource`]s through a [`SourceHost`]; client processes acquire
//! one by name and mirror it with a [`ReplicaNode`]. Connection urls come from
//! a legacy `server.conf` file via [`RemoteConfig`].

pub mod config;
pub mod error;
pub mod ipc;
pub mod paging;
pub mod protocol;
pub mod replica;
pub mod source;

pub use config::{DEFAULT_SERVER_CONF, Endpoint, RemoteConfig, SERVER_CONF_PATH_ENV, build_default_url, legacy_config_path};
pub use error::{RemoteError, RemoteResult};
pub use paging::{PAGING_MODEL_SIGNATURE, PagingModelSource, RemotePagingModelBackend};
pub use protocol::{CallReturn, NodeError, PendingResult, ReplicaState, from_remote_variant, object_name, to_remote_variant};
pub use replica::{ReplicaHelper, ReplicaNode, ReplicaSignals};
pub use source::{ProxyTransportAdapter, RemoteSource, SourceEvent, SourceHelper, SourceHost, SourceRegistry, serve_connection};
