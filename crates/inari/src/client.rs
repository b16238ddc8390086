use std::sync::Arc;

use inari_mem::{DefaultHeap, Heap};
use inari_net::fabric::{read_verified, Access, DynFabric, MemoryFabric};
use inari_net::{Request, Response};
use inari_overlay::{ChordResolver, FixedNetwork, NodePool, RemoteNode};
use inari_types::{
    hash128, EntryImage, KeyId, NodeInfo, RegionDescriptor, TuningParams, ENTRY_CELL_BYTES,
};

use crate::error::{ClientError, ClientResult};

/// Times a blob read follows a freshly observed pointer before the lookup
/// is abandoned as racing a hot writer.
const BLOB_CHASE_LIMIT: usize = 64;

/// Caller-facing handle to the store.
///
/// `put`/`remove` are messages to the owning node; `get`/`contains` are
/// pure one-sided reads against the owner's exported table: node-info
/// cell, home entry, placement-word neighbors, then the key/value blob,
/// each validated and retried on torn observation.
pub struct Client {
    fabric: DynFabric,
    params: TuningParams,
    heap: DefaultHeap,
    seed: Arc<RemoteNode>,
    routing: Routing,
}

enum Routing {
    Fixed {
        partitions: u16,
        network: tokio::sync::Mutex<FixedNetwork>,
        pool: NodePool,
    },
    Chord {
        resolver: ChordResolver,
    },
}

impl Client {
    /// Connect through any live node and discover the overlay flavor.
    pub async fn connect(
        fabric: DynFabric,
        host: &str,
        port: &str,
        params: TuningParams,
    ) -> ClientResult<Self> {
        let pool = NodePool::new(fabric.clone());
        let seed = pool.node(host, port).await?;

        let routing = match seed.conn().request(&Request::ChordTable).await? {
            Response::Chord { .. } => Routing::Chord {
                resolver: ChordResolver::new(pool),
            },
            Response::Network { entries, table, .. } => Routing::Fixed {
                partitions: entries,
                network: tokio::sync::Mutex::new(
                    FixedNetwork::load(&fabric, table, entries).await?,
                ),
                pool,
            },
            other => {
                return Err(ClientError::Protocol(format!(
                    "overlay discovery got {other:?}"
                )));
            }
        };

        Ok(Self {
            heap: DefaultHeap::new(fabric.clone(), Access::RemoteRead),
            fabric,
            params,
            seed,
            routing,
        })
    }

    /// The node owning `key`, resolved through the overlay.
    async fn owner(&self, key: &[u8]) -> ClientResult<Arc<RemoteNode>> {
        let id = KeyId::from_hash(hash128(key));
        match &self.routing {
            Routing::Fixed { network, pool, .. } => {
                let entry = *network.lock().await.successor(id)?;
                Ok(pool.node(entry.node.host(), entry.node.port()).await?)
            }
            Routing::Chord { resolver } => {
                let entry = resolver.successor_via(&self.seed, id).await?;
                Ok(resolver
                    .pool()
                    .node(entry.node.host(), entry.node.port())
                    .await?)
            }
        }
    }

    /// Re-read the routing view after a nack; the owner may have changed.
    async fn re_resolve(&self) -> ClientResult<()> {
        if let Routing::Fixed {
            partitions,
            network,
            ..
        } = &self.routing
        {
            let info = self.seed.info();
            let fresh = FixedNetwork::load(&self.fabric, info.routing, *partitions).await?;
            *network.lock().await = fresh;
        }
        Ok(())
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) -> ClientResult<bool> {
        let node = self.owner(key).await?;
        let total = key.len() + value.len();

        let request = if total <= self.params.inline_threshold && total <= u8::MAX as usize {
            let mut data = Vec::with_capacity(total);
            data.extend_from_slice(key);
            data.extend_from_slice(value);
            Request::PutInline {
                key_len: key.len() as u8,
                data,
            }
        } else {
            // register the blob client-side; the server fetches it with a
            // one-sided read before acking
            let mut mem = self.heap.alloc(total)?;
            mem.bytes_mut()[..key.len()].copy_from_slice(key);
            mem.bytes_mut()[key.len()..total].copy_from_slice(value);
            let kv = RegionDescriptor::new(mem.addr(), total as u32, mem.rkey());
            let req = Request::PutRemote {
                key_len: key.len() as u32,
                kv,
            };
            let acked = node.conn().request_ack(&req).await?;
            self.after_write(&node).await?;
            return Ok(acked);
        };

        let acked = node.conn().request_ack(&request).await?;
        if !acked {
            self.re_resolve().await?;
        }
        self.after_write(&node).await?;
        Ok(acked)
    }

    pub async fn remove(&self, key: &[u8]) -> ClientResult<bool> {
        let node = self.owner(key).await?;
        let request = if key.len() <= self.params.inline_threshold && key.len() <= u8::MAX as usize
        {
            Request::DelInline { key: key.to_vec() }
        } else {
            let mut mem = self.heap.alloc(key.len())?;
            mem.copy_from(key);
            let desc = RegionDescriptor::new(mem.addr(), key.len() as u32, mem.rkey());
            let acked = node
                .conn()
                .request_ack(&Request::DelRemote { key: desc })
                .await?;
            self.after_write(&node).await?;
            return Ok(acked);
        };
        let acked = node.conn().request_ack(&request).await?;
        self.after_write(&node).await?;
        Ok(acked)
    }

    pub async fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        let node = self.owner(key).await?;
        match self.lookup_at(&node, key).await {
            Ok(Some(value)) => Ok(Some(value)),
            Ok(None) => {
                // a miss may be a resize we have not observed: refresh the
                // info cell and retry once against the republished table
                let before = node.info();
                let after = node.refresh_info().await?;
                if before == after {
                    return Ok(None);
                }
                self.lookup_at(&node, key).await
            }
            Err(e) => {
                // a failed read usually means the table moved underneath
                // us and its old region is gone; follow the info cell
                tracing::debug!("lookup read failed, refreshing node info: {e}");
                node.refresh_info().await?;
                self.lookup_at(&node, key).await
            }
        }
    }

    pub async fn contains(&self, key: &[u8]) -> ClientResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// The hopscotch read path: home cell, then every neighbor named by
    /// the placement word, then the blob behind the verifying pointer.
    async fn lookup_at(&self, node: &RemoteNode, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        let info = node.info();
        let entries = info.table_entries as usize;
        if entries == 0 {
            return Ok(None);
        }
        let home = (hash128(key) % entries as u128) as usize;

        let home_entry = self.read_entry(&info, home).await?;
        let hop = home_entry.placement;

        for d in 0..self.params.hop_range.min(u32::BITS) {
            if hop & (1 << d) == 0 {
                continue;
            }
            let slot = (home + d as usize) % entries;
            let entry = if slot == home {
                home_entry
            } else {
                self.read_entry(&info, slot).await?
            };
            if let Some(value) = self.read_match(&info, slot, entry, key).await? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    async fn read_entry(&self, info: &NodeInfo, slot: usize) -> ClientResult<EntryImage> {
        let src = info
            .table
            .slice((slot * ENTRY_CELL_BYTES) as u64, ENTRY_CELL_BYTES as u32);
        let cell = read_verified(self.fabric.as_ref(), src).await?;
        Ok(EntryImage::decode(&cell)?)
    }

    /// Fetch the blob a slot points at and compare keys. If the blob does
    /// not match its verifying pointer the referent was overwritten
    /// underneath us: re-read the cell and follow the new pointer.
    async fn read_match(
        &self,
        info: &NodeInfo,
        slot: usize,
        mut entry: EntryImage,
        key: &[u8],
    ) -> ClientResult<Option<Vec<u8>>> {
        for _ in 0..BLOB_CHASE_LIMIT {
            if entry.is_empty() || entry.key_len as usize != key.len() {
                return Ok(None);
            }
            let blob_desc =
                RegionDescriptor::new(entry.ptr.addr, entry.ptr.len, entry.rkey);
            let mut blob = vec![0u8; entry.ptr.len as usize];
            if self.fabric.read(&mut blob, blob_desc).await.is_ok()
                && entry.ptr.verifies(&blob)
            {
                if &blob[..key.len()] == key {
                    return Ok(Some(blob[key.len()..].to_vec()));
                }
                return Ok(None);
            }
            entry = self.read_entry(info, slot).await?;
        }
        Ok(None)
    }

    /// Pick up any resize pushed during a write so the next lookup uses
    /// the republished table.
    async fn after_write(&self, node: &RemoteNode) -> ClientResult<()> {
        if node.resize_pending() {
            node.refresh_info().await?;
        }
        Ok(())
    }

    /// Courtesy disconnect of the seed connection.
    pub async fn close(&self) {
        self.seed.conn().close().await;
    }
}
