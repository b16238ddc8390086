use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use inari_net::fabric::{read_verified, DynFabric};
use inari_net::{Connection, Request, Response};
use inari_types::{NodeInfo, RegionDescriptor};

use crate::error::{OverlayError, OverlayResult};

/// A non-owning handle to another node: one connection plus the last
/// observed node-info cell. Everything read through it is one-sided.
pub struct RemoteNode {
    conn: Connection,
    fabric: DynFabric,
    info_region: RegionDescriptor,
    info: Mutex<NodeInfo>,
}

impl RemoteNode {
    pub async fn connect(fabric: DynFabric, host: &str, port: &str) -> OverlayResult<Arc<Self>> {
        let conn = Connection::connect(host, port).await?;
        let info_region = match conn.request(&Request::Init).await? {
            Response::Init { info } => info,
            other => return Err(OverlayError::Protocol(format!("init got {other:?}"))),
        };
        let info = Self::load_info(&fabric, info_region).await?;
        tracing::debug!(peer = conn.peer(), id = ?info.id, "remote node attached");
        Ok(Arc::new(Self {
            conn,
            fabric,
            info_region,
            info: Mutex::new(info),
        }))
    }

    async fn load_info(fabric: &DynFabric, region: RegionDescriptor) -> OverlayResult<NodeInfo> {
        let cell = read_verified(fabric.as_ref(), region).await?;
        Ok(NodeInfo::decode(&cell)?)
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn fabric(&self) -> &DynFabric {
        &self.fabric
    }

    /// Last observed node-info (cheap cached copy).
    pub fn info(&self) -> NodeInfo {
        *self.info.lock()
    }

    /// Re-read the info cell; done on lookup misses and after a resize
    /// notification so a republished table descriptor is picked up.
    pub async fn refresh_info(&self) -> OverlayResult<NodeInfo> {
        // a pushed notification carries the same cell region; either way
        // the authoritative bits come from re-reading the cell
        let _ = self.conn.take_resize();
        let info = Self::load_info(&self.fabric, self.info_region).await?;
        *self.info.lock() = info;
        Ok(info)
    }

    /// Has the node pushed a resize notification since the last refresh?
    pub fn resize_pending(&self) -> bool {
        self.conn.take_resize().is_some()
    }

    /// One-sided read of this node's exported routing-table region.
    pub async fn read_routing_cell(&self) -> OverlayResult<Vec<u8>> {
        let info = self.info();
        Ok(read_verified(self.fabric.as_ref(), info.routing).await?)
    }
}

/// Cache of remote-node handles keyed by dial address. The overlay graph
/// is cyclic (fingers may point anywhere, including back); the cache holds
/// shared non-owning handles instead of an owned graph.
#[derive(Default)]
pub struct NodePool {
    fabric: Option<DynFabric>,
    nodes: tokio::sync::Mutex<HashMap<String, Arc<RemoteNode>>>,
}

impl NodePool {
    pub fn new(fabric: DynFabric) -> Self {
        Self {
            fabric: Some(fabric),
            nodes: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn node(&self, host: &str, port: &str) -> OverlayResult<Arc<RemoteNode>> {
        let key = format!("{host}:{port}");
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.get(&key) {
            return Ok(node.clone());
        }
        let fabric = self
            .fabric
            .clone()
            .ok_or_else(|| OverlayError::Protocol("node pool has no fabric".into()))?;
        let node = RemoteNode::connect(fabric, host, port).await?;
        nodes.insert(key, node.clone());
        Ok(node)
    }

    /// Drop a cached handle whose connection died; the next use redials.
    pub async fn evict(&self, host: &str, port: &str) {
        self.nodes.lock().await.remove(&format!("{host}:{port}"));
    }
}
