mod cache;
mod connection;
mod resources;
mod server;

pub(crate) use cache::{new_snapshot, SnapshotCache, SnapshotWriter};
pub(crate) use connection::AdsConnection;
pub(crate) use resources::ResourceType;
pub(crate) use server::AdsServer;
