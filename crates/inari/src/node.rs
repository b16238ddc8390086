use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Semaphore, SemaphorePermit};

use inari_dht::{Blob, ServerTable};
use inari_mem::{Heap, Mem, MessageHeap, NodeHeap};
use inari_net::fabric::{volatile, Access, DynFabric, MemoryFabric};
use inari_net::wire::{self, Request, Response};
use inari_net::NetError;
use inari_overlay::{
    chord, ChordImage, ChordResolver, ChordTable, FixedNetwork, FixedTable, NodePool, OverlayTable,
};
use inari_types::{
    hash128, KeyId, NodeId, NodeInfo, OverlayKind, RegionDescriptor, TuningParams, NODE_INFO_BYTES,
};

use crate::error::{NodeError, NodeResult};

/// Size of one pre-posted receive buffer.
const MSG_BUFFER_BYTES: usize = 4096;
/// Sub-heaps in the per-thread allocation layer.
const HEAP_SHARDS: usize = 4;
/// Cadence of the Chord stabilize / fix-fingers rounds.
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(250);

/// The node-info cell: the one piece of remote memory every client reads
/// first. Republishing it is how a resize becomes visible.
struct InfoCell {
    mem: Mem,
    info: NodeInfo,
}

impl InfoCell {
    fn new(heap: &dyn Heap, info: NodeInfo) -> NodeResult<Self> {
        let mem = heap.alloc(NODE_INFO_BYTES)?;
        let mut cell = Self { mem, info };
        cell.publish();
        Ok(cell)
    }

    fn publish(&mut self) {
        let bytes = self.info.encode();
        // Safety: the allocation is sized for exactly this cell.
        unsafe { volatile::copy_to(self.mem.as_ptr() as *mut u8, &bytes) };
    }

    fn descriptor(&self) -> RegionDescriptor {
        RegionDescriptor::new(self.mem.addr(), NODE_INFO_BYTES as u32, self.mem.rkey())
    }

    fn set_table(&mut self, entries: u64, table: RegionDescriptor) {
        self.info.table_entries = entries;
        self.info.table = table;
        self.publish();
    }
}

/// The pool of receive buffers a node keeps posted; checkout blocks when
/// all are in flight, bounding concurrent request work.
struct BufferPool {
    sem: Semaphore,
    bufs: Mutex<Vec<Mem>>,
}

impl BufferPool {
    fn new(heap: &dyn Heap, count: usize) -> NodeResult<Self> {
        let bufs = (0..count)
            .map(|_| heap.alloc(MSG_BUFFER_BYTES))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            sem: Semaphore::new(count),
            bufs: Mutex::new(bufs),
        })
    }

    async fn checkout(&self) -> PooledBuffer<'_> {
        let permit = self.sem.acquire().await.expect("buffer pool closed");
        let mem = self.bufs.lock().pop().expect("buffer under permit");
        PooledBuffer {
            mem: Some(mem),
            pool: self,
            _permit: permit,
        }
    }
}

struct PooledBuffer<'a> {
    mem: Option<Mem>,
    pool: &'a BufferPool,
    _permit: SemaphorePermit<'a>,
}

impl PooledBuffer<'_> {
    fn bytes(&self) -> &[u8] {
        self.mem.as_ref().expect("checked out").bytes()
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        self.mem.as_mut().expect("checked out").bytes_mut()
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        if let Some(mem) = self.mem.take() {
            self.pool.bufs.lock().push(mem);
        }
    }
}

struct NodeState {
    fabric: DynFabric,
    params: TuningParams,
    me: Mutex<NodeId>,
    heap: NodeHeap,
    table: Mutex<ServerTable>,
    info: Mutex<InfoCell>,
    overlay: Mutex<OverlayTable>,
    resolver: ChordResolver,
    buffers: BufferPool,
    resize_tx: broadcast::Sender<RegionDescriptor>,
}

/// One server: a table, its info cell, an overlay table and the listeners
/// serving them.
pub struct Node {
    state: Arc<NodeState>,
    host: String,
    port: u16,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Node {
    /// Bring a node up: bind, allocate and export the table and info
    /// cells, start serving, and (optionally) join an existing network
    /// through `seed`.
    pub async fn spawn(
        fabric: DynFabric,
        hosts: &[String],
        port: u16,
        params: TuningParams,
        seed: Option<(String, String)>,
    ) -> NodeResult<Node> {
        let primary = hosts
            .first()
            .cloned()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let listener = TcpListener::bind((primary.as_str(), port)).await?;
        let port = listener.local_addr()?.port();
        let port_str = port.to_string();

        let heap = NodeHeap::new(fabric.clone(), Access::RemoteRead, HEAP_SHARDS);
        let msg_heap = MessageHeap::new(fabric.clone(), Access::LocalOnly);

        let table = ServerTable::new(&heap, &params)?;

        let (me, overlay) = match params.overlay {
            OverlayKind::Chord => {
                let me = NodeId::from_addr(&primary, &port_str);
                (me, OverlayTable::Chord(ChordTable::new(&heap, me)?))
            }
            OverlayKind::Fixed if seed.is_none() => {
                let routing = FixedTable::new(&heap, params.fixed_partitions, &primary, &port_str)?;
                let me = routing.entries()[0].node;
                (me, OverlayTable::Fixed(routing))
            }
            OverlayKind::Fixed => {
                // a joiner starts vacant and adopts the seed's view below
                let routing = FixedTable::vacant(&heap, params.fixed_partitions)?;
                let me = NodeId::new(KeyId(0), &primary, &port_str);
                (me, OverlayTable::Fixed(routing))
            }
        };

        let info = InfoCell::new(
            &heap,
            NodeInfo {
                id: hash128(format!("{primary}:{port_str}").as_bytes()),
                table_entries: table.entries() as u64,
                table: table.descriptor(),
                routing: overlay.descriptor(),
            },
        )?;

        let buffers = BufferPool::new(&msg_heap, params.msg_buffers)?;
        let (resize_tx, _) = broadcast::channel(16);

        let chord_overlay = params.overlay == OverlayKind::Chord;
        let state = Arc::new(NodeState {
            fabric: fabric.clone(),
            params,
            me: Mutex::new(me),
            heap,
            table: Mutex::new(table),
            info: Mutex::new(info),
            overlay: Mutex::new(overlay),
            resolver: ChordResolver::new(NodePool::new(fabric)),
            buffers,
            resize_tx,
        });

        let mut tasks = vec![tokio::spawn(accept_loop(state.clone(), listener))];
        for host in hosts.iter().skip(1) {
            let extra = TcpListener::bind((host.as_str(), port)).await?;
            tasks.push(tokio::spawn(accept_loop(state.clone(), extra)));
        }
        if chord_overlay {
            tasks.push(tokio::spawn(maintenance_loop(state.clone())));
        }

        let node = Node {
            state,
            host: primary,
            port,
            tasks,
        };
        tracing::info!(host = %node.host, port = node.port, id = %node.id(), "node up");

        if let Some((seed_host, seed_port)) = seed {
            node.join(&seed_host, &seed_port).await?;
        }
        Ok(node)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn id(&self) -> KeyId {
        self.state.me.lock().id
    }

    pub fn node_id(&self) -> NodeId {
        *self.state.me.lock()
    }

    pub fn used(&self) -> usize {
        self.state.table.lock().used()
    }

    pub fn table_entries(&self) -> usize {
        self.state.table.lock().entries()
    }

    pub fn load_factor(&self) -> f64 {
        self.state.table.lock().load_factor()
    }

    /// Verify table invariants; panics on violation.
    pub fn check_consistency(&self) {
        self.state.table.lock().check_consistency()
    }

    /// Snapshot of the exported Chord routing table, if this node runs the
    /// Chord overlay.
    pub fn chord_image(&self) -> Option<ChordImage> {
        self.state
            .overlay
            .lock()
            .as_chord()
            .map(|t| t.image().clone())
    }

    /// One explicit stabilization round (also runs periodically).
    pub async fn stabilize(&self) -> NodeResult<()> {
        let me = self.node_id();
        chord::stabilize(&self.state.overlay, &self.state.resolver, me).await?;
        Ok(())
    }

    /// One explicit fix-fingers round (also runs periodically).
    pub async fn fix_fingers(&self) -> NodeResult<()> {
        let me = self.node_id();
        chord::fix_fingers(&self.state.overlay, &self.state.resolver, me).await?;
        Ok(())
    }

    async fn join(&self, seed_host: &str, seed_port: &str) -> NodeResult<()> {
        match self.state.params.overlay {
            OverlayKind::Chord => {
                let me = self.node_id();
                chord::join(
                    &self.state.overlay,
                    &self.state.resolver,
                    me,
                    seed_host,
                    seed_port,
                )
                .await?;
                Ok(())
            }
            OverlayKind::Fixed => self.join_fixed(seed_host, seed_port).await,
        }
    }

    async fn join_fixed(&self, seed_host: &str, seed_port: &str) -> NodeResult<()> {
        let seed = self.state.resolver.pool().node(seed_host, seed_port).await?;

        let (entries, table) = match seed.conn().request(&Request::ChordTable).await? {
            Response::Network { entries, table, .. } => (entries, table),
            other => {
                return Err(NodeError::JoinFailed(format!("table query got {other:?}")));
            }
        };
        let network = FixedNetwork::load(&self.state.fabric, table, entries).await?;

        let port = self.port.to_string();
        let (start, id) = match seed
            .conn()
            .request(&Request::Join {
                host: self.host.clone(),
                port: port.clone(),
            })
            .await?
        {
            Response::JoinReply { start, id } => (start, id),
            Response::Ack { success: false } => {
                return Err(NodeError::JoinFailed("seed refused the join".into()));
            }
            other => {
                return Err(NodeError::JoinFailed(format!("join got {other:?}")));
            }
        };

        let me = NodeId::new(id, &self.host, &port);
        {
            let mut overlay = self.state.overlay.lock();
            let fixed = overlay
                .as_fixed_mut()
                .ok_or_else(|| NodeError::JoinFailed("not a fixed overlay".into()))?;
            fixed.adopt(network.entries())?;
            fixed.claim(start, me)?;
        }
        *self.state.me.lock() = me;
        tracing::info!(%start, %id, "joined fixed network");
        Ok(())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn accept_loop(state: Arc<NodeState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "connection accepted");
                tokio::spawn(serve(state.clone(), stream));
            }
            Err(e) => {
                tracing::warn!("accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn serve(state: Arc<NodeState>, stream: tokio::net::TcpStream) {
    stream.set_nodelay(true).ok();
    let (mut rd, mut wr) = stream.into_split();
    let mut resize_rx = state.resize_tx.subscribe();

    loop {
        // push pending resize notifications between requests; a client
        // only reads while it waits for a response, so this is exactly
        // when they are deliverable
        while let Ok(info) = resize_rx.try_recv() {
            if wire::write_frame(&mut wr, &Response::Resize { info }.encode())
                .await
                .is_err()
            {
                return;
            }
        }

        let frame = match wire::read_frame(&mut rd).await {
            Ok(frame) => frame,
            Err(NetError::ConnectionLost) => return,
            Err(e) => {
                tracing::debug!("dropping connection: {e}");
                return;
            }
        };
        let req = match Request::decode(&frame) {
            Ok(req) => req,
            Err(e) => {
                tracing::warn!("malformed request: {e}");
                return;
            }
        };
        if matches!(req, Request::Disconnect) {
            tracing::debug!("peer disconnected");
            return;
        }

        let resp = match handle(&state, req).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!("request failed: {e}");
                Response::Ack { success: false }
            }
        };
        if wire::write_frame(&mut wr, &resp.encode()).await.is_err() {
            return;
        }
    }
}

async fn handle(state: &Arc<NodeState>, req: Request) -> NodeResult<Response> {
    match req {
        Request::Init => Ok(Response::Init {
            info: state.info.lock().descriptor(),
        }),

        Request::PutInline { key_len, data } => {
            let mut mem = state.heap.alloc(data.len())?;
            mem.copy_from(&data);
            insert_blob(state, mem, data.len(), key_len as usize)
        }

        // two-stage continuation: fetch the blob with a one-sided read,
        // insert when the read completes
        Request::PutRemote { key_len, kv } => {
            let len = kv.len as usize;
            let mut mem = state.heap.alloc(len)?;
            state.fabric.read(&mut mem.bytes_mut()[..len], kv).await?;
            insert_blob(state, mem, len, key_len as usize)
        }

        Request::DelInline { key } => del_bytes(state, &key),

        Request::DelRemote { key } => {
            let len = key.len as usize;
            if len <= MSG_BUFFER_BYTES {
                let mut buf = state.buffers.checkout().await;
                state.fabric.read(&mut buf.bytes_mut()[..len], key).await?;
                del_bytes(state, &buf.bytes()[..len])
            } else {
                let mut mem = state.heap.alloc(len)?;
                state.fabric.read(&mut mem.bytes_mut()[..len], key).await?;
                del_bytes(state, &mem.bytes()[..len])
            }
        }

        Request::Predecessor { node } => {
            let mut overlay = state.overlay.lock();
            Ok(Response::Ack {
                success: overlay
                    .as_chord_mut()
                    .map(|t| t.notify_predecessor(node))
                    .unwrap_or(false),
            })
        }

        Request::Update { index, node } => {
            let applied = state.overlay.lock().update(index as usize, node);
            if let Err(e) = &applied {
                tracing::warn!("routing update rejected: {e}");
            }
            Ok(Response::Ack {
                success: applied.is_ok(),
            })
        }

        Request::Join { host, port } => join_request(state, host, port).await,

        Request::ChordTable => {
            let overlay = state.overlay.lock();
            Ok(match &*overlay {
                OverlayTable::Chord(t) => Response::Chord {
                    table: t.descriptor(),
                },
                OverlayTable::Fixed(t) => Response::Network {
                    kind: OverlayKind::Fixed,
                    entries: t.partitions(),
                    table: t.descriptor(),
                },
            })
        }

        // serve() intercepts these before dispatch
        Request::Disconnect => Ok(Response::Ack { success: true }),
    }
}

fn insert_blob(
    state: &Arc<NodeState>,
    mem: Mem,
    len: usize,
    key_len: usize,
) -> NodeResult<Response> {
    let id = KeyId::from_hash(hash128(&mem.bytes()[..key_len]));
    let me = *state.me.lock();
    if !state.overlay.lock().owns(me.id, id) {
        return Err(NodeError::NotResponsible(id));
    }

    let blob = Blob::new(mem, len, key_len);
    let grown = {
        let mut table = state.table.lock();
        let before = table.descriptor();
        table.insert_or_grow(&state.heap, &state.params, blob)?;
        let after = table.descriptor();
        (before != after).then(|| (table.entries() as u64, after))
    };

    if let Some((entries, table_desc)) = grown {
        let info_desc = {
            let mut info = state.info.lock();
            info.set_table(entries, table_desc);
            info.descriptor()
        };
        let _ = state.resize_tx.send(info_desc);
        tracing::info!(entries, "table resized; info cell republished");
    }
    Ok(Response::Ack { success: true })
}

fn del_bytes(state: &Arc<NodeState>, key: &[u8]) -> NodeResult<Response> {
    let id = KeyId::from_hash(hash128(key));
    let me = *state.me.lock();
    if !state.overlay.lock().owns(me.id, id) {
        return Err(NodeError::NotResponsible(id));
    }
    let removed = state.table.lock().remove(key)?;
    Ok(Response::Ack { success: removed })
}

async fn join_request(
    state: &Arc<NodeState>,
    host: String,
    port: String,
) -> NodeResult<Response> {
    let joined = {
        let mut overlay = state.overlay.lock();
        let Some(fixed) = overlay.as_fixed_mut() else {
            return Ok(Response::Ack { success: false });
        };
        match fixed.join(&host, &port) {
            Ok((index, entry)) => {
                let peers: Vec<NodeId> = fixed
                    .members()
                    .map(|e| e.node)
                    .filter(|n| n.addr() != entry.node.addr())
                    .collect();
                Some((index, entry, peers))
            }
            Err(e) => {
                tracing::warn!("join rejected: {e}");
                None
            }
        }
    };

    let Some((index, entry, peers)) = joined else {
        return Ok(Response::Ack { success: false });
    };

    // tell every member about the new occupant
    let me = *state.me.lock();
    for peer in peers {
        if peer.addr() == me.addr() {
            continue;
        }
        match state.resolver.pool().node(peer.host(), peer.port()).await {
            Ok(remote) => {
                if let Err(e) = remote
                    .conn()
                    .request_ack(&Request::Update {
                        index: index as u32,
                        node: entry.node,
                    })
                    .await
                {
                    tracing::warn!(peer = %peer, "update broadcast failed: {e}");
                }
            }
            Err(e) => tracing::warn!(peer = %peer, "unreachable for update: {e}"),
        }
    }

    Ok(Response::JoinReply {
        start: entry.start,
        id: entry.node.id,
    })
}

async fn maintenance_loop(state: Arc<NodeState>) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let me = *state.me.lock();
        if let Err(e) = chord::stabilize(&state.overlay, &state.resolver, me).await {
            tracing::debug!("stabilize round failed: {e}");
        }
        if let Err(e) = chord::fix_fingers(&state.overlay, &state.resolver, me).await {
            tracing::debug!("fix-fingers round failed: {e}");
        }
    }
}
