//! TCP rendezvous with rank 0 as hub
//!
//! Rank 0 listens on the coordinator address and every other rank connects to
//! it. A collective is one `Arrive` per spoke followed by one `Release` from
//! the hub, so every collective is also a full barrier.
//!
//! The communicator owns a single-threaded tokio runtime and blocks on it, so
//! callers stay synchronous.

use super::protocol::{
    read_message, write_message, ArriveMessage, ErrorMessage, HelloMessage, Message,
    ReleaseMessage, WelcomeMessage, PROTOCOL_VERSION,
};
use super::Communicator;
use crate::util::lock;
use crate::Result;
use anyhow::Context;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// Delay between connection attempts while the hub is not listening yet
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Time a freshly accepted connection gets to send its HELLO
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

enum Links {
    /// Streams to ranks `1..size`, indexed by `rank - 1`
    Hub { peers: Vec<TcpStream> },
    Spoke { hub: TcpStream },
}

/// Communicator over TCP
pub struct TcpCommunicator {
    rank: usize,
    size: usize,
    /// Declared before `runtime` so the streams are dropped first
    links: Mutex<Links>,
    runtime: Runtime,
    /// Number of collectives completed so far
    epoch: AtomicU64,
}

impl TcpCommunicator {
    /// Join the rendezvous at `addr` as `rank` of `size`
    ///
    /// Rank 0 binds `addr` and waits for every other rank; the others retry
    /// connecting until `timeout` elapses.
    pub fn connect(rank: usize, size: usize, addr: &str, timeout: Duration) -> Result<Self> {
        if size == 0 || rank >= size {
            anyhow::bail!("Invalid rank {} for world size {}", rank, size);
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to create communicator runtime")?;

        let deadline = Instant::now() + timeout;
        let links = if rank == 0 {
            runtime.block_on(accept_spokes(size, addr, deadline))?
        } else {
            runtime.block_on(connect_to_hub(rank, size, addr, deadline))?
        };

        Ok(Self {
            rank,
            size,
            links: Mutex::new(links),
            runtime,
            epoch: AtomicU64::new(0),
        })
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_gather(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let mut links = lock(&self.links);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst);

        let gathered = match &mut *links {
            Links::Hub { peers } => self.runtime.block_on(hub_gather(peers, epoch, payload)),
            Links::Spoke { hub } => self
                .runtime
                .block_on(spoke_gather(hub, self.rank, self.size, epoch, payload)),
        };
        gathered.with_context(|| format!("Collective #{} failed on rank {}", epoch, self.rank))
    }
}

async fn accept_spokes(size: usize, addr: &str, deadline: Instant) -> Result<Links> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind rendezvous hub on {}", addr))?;

    info!(addr, expected = size - 1, "Waiting for peer ranks");

    let mut slots: Vec<Option<TcpStream>> = (1..size).map(|_| None).collect();
    let mut joined = 0;

    while joined < size - 1 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let (stream, peer_addr) = tokio::time::timeout(remaining, listener.accept())
            .await
            .map_err(|_| {
                anyhow::anyhow!("Timed out waiting for peers ({} of {} joined)", joined, size - 1)
            })?
            .context("Failed to accept connection")?;

        // A bad connection is dropped; the hub keeps accepting until the deadline
        match handshake(stream, size, &slots, deadline).await {
            Ok((rank, stream)) => {
                slots[rank - 1] = Some(stream);
                joined += 1;
            }
            Err(e) => warn!(peer = %peer_addr, "Rejected connection: {:#}", e),
        }
    }

    let peers = slots.into_iter().flatten().collect();
    Ok(Links::Hub { peers })
}

/// Read and answer one HELLO; returns the rank that joined
async fn handshake(
    mut stream: TcpStream,
    size: usize,
    slots: &[Option<TcpStream>],
    deadline: Instant,
) -> Result<(usize, TcpStream)> {
    let remaining = deadline
        .saturating_duration_since(Instant::now())
        .min(HANDSHAKE_TIMEOUT);
    let hello = match tokio::time::timeout(remaining, read_message(&mut stream)).await {
        Ok(Ok(Message::Hello(hello))) => hello,
        Ok(Ok(other)) => anyhow::bail!("Expected HELLO, got {:?}", other),
        Ok(Err(e)) => return Err(e.context("Handshake failed")),
        Err(_) => anyhow::bail!("Timed out waiting for HELLO"),
    };

    if let Err(e) = validate_hello(&hello, size, slots) {
        let reject = Message::Error(ErrorMessage {
            rank: 0,
            error: e.to_string(),
        });
        let _ = write_message(&mut stream, &reject).await;
        return Err(e);
    }

    write_message(
        &mut stream,
        &Message::Welcome(WelcomeMessage {
            protocol_version: PROTOCOL_VERSION,
            size,
        }),
    )
    .await?;

    stream.set_nodelay(true).ok();
    debug!(rank = hello.rank, host = %hello.hostname, "Peer joined");
    Ok((hello.rank, stream))
}

fn validate_hello(hello: &HelloMessage, size: usize, slots: &[Option<TcpStream>]) -> Result<()> {
    if hello.protocol_version != PROTOCOL_VERSION {
        anyhow::bail!(
            "Protocol version mismatch: hub={}, rank {}={}",
            PROTOCOL_VERSION,
            hello.rank,
            hello.protocol_version
        );
    }
    if hello.size != size {
        anyhow::bail!(
            "World size mismatch: hub={}, rank {}={}",
            size,
            hello.rank,
            hello.size
        );
    }
    if hello.rank == 0 || hello.rank >= size {
        anyhow::bail!("Rank {} out of range for world size {}", hello.rank, size);
    }
    if slots[hello.rank - 1].is_some() {
        anyhow::bail!("Rank {} joined twice", hello.rank);
    }
    Ok(())
}

async fn connect_to_hub(rank: usize, size: usize, addr: &str, deadline: Instant) -> Result<Links> {
    let mut stream = loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => break stream,
            Err(e) if Instant::now() + CONNECT_RETRY_INTERVAL < deadline => {
                debug!(addr, "Hub not reachable yet: {}", e);
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to connect to hub at {}", addr))
            }
        }
    };
    stream.set_nodelay(true).ok();

    let hostname = crate::resolver::node_name();
    write_message(
        &mut stream,
        &Message::Hello(HelloMessage {
            protocol_version: PROTOCOL_VERSION,
            rank,
            size,
            hostname,
        }),
    )
    .await?;

    match read_message(&mut stream).await? {
        Message::Welcome(welcome) if welcome.size == size => {}
        Message::Welcome(welcome) => {
            anyhow::bail!("Hub reports world size {}, expected {}", welcome.size, size)
        }
        Message::Error(err) => anyhow::bail!("Hub rejected rank {}: {}", rank, err.error),
        other => anyhow::bail!("Expected WELCOME from hub, got {:?}", other),
    }

    info!(addr, rank, "Connected to rendezvous hub");
    Ok(Links::Spoke { hub: stream })
}

async fn hub_gather(peers: &mut [TcpStream], epoch: u64, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
    let mut payloads = Vec::with_capacity(peers.len() + 1);
    payloads.push(payload);

    for (index, stream) in peers.iter_mut().enumerate() {
        let rank = index + 1;
        match read_message(stream)
            .await
            .with_context(|| format!("Lost connection to rank {}", rank))?
        {
            Message::Arrive(arrive) if arrive.epoch == epoch && arrive.rank == rank => {
                payloads.push(arrive.payload);
            }
            Message::Arrive(arrive) => anyhow::bail!(
                "Rank {} arrived at collective #{} (rank {}), expected #{}",
                rank,
                arrive.epoch,
                arrive.rank,
                epoch
            ),
            Message::Error(err) => anyhow::bail!("Rank {} failed: {}", err.rank, err.error),
            other => anyhow::bail!("Unexpected message from rank {}: {:?}", rank, other),
        }
    }

    let release = Message::Release(ReleaseMessage {
        epoch,
        payloads: payloads.clone(),
    });
    for (index, stream) in peers.iter_mut().enumerate() {
        write_message(stream, &release)
            .await
            .with_context(|| format!("Failed to release rank {}", index + 1))?;
    }

    Ok(payloads)
}

async fn spoke_gather(
    hub: &mut TcpStream,
    rank: usize,
    size: usize,
    epoch: u64,
    payload: Vec<u8>,
) -> Result<Vec<Vec<u8>>> {
    write_message(hub, &Message::Arrive(ArriveMessage { rank, epoch, payload })).await?;

    match read_message(hub).await.context("Lost connection to hub")? {
        Message::Release(release) if release.epoch == epoch && release.payloads.len() == size => {
            Ok(release.payloads)
        }
        Message::Release(release) => anyhow::bail!(
            "Malformed release for collective #{} (expected #{}, {} payloads)",
            release.epoch,
            epoch,
            release.payloads.len()
        ),
        Message::Error(err) => anyhow::bail!("Rank {} failed: {}", err.rank, err.error),
        other => anyhow::bail!("Unexpected message from hub: {:?}", other),
    }
}
