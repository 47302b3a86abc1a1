use std::{borrow::Cow, io, sync::Arc, time::Duration};

use comms::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg, Payload},
};
use log::{debug, info, warn};
use ml_core::{GradientSync, MlError};
use parking_lot::Mutex;
use tokio::{
    net::{
        TcpListener, TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::{self, Runtime},
    time::{self, Instant},
};

use crate::{Result, WorkerErr};

/// Fixed rendezvous every rank of a run meets at.
pub const RENDEZVOUS_ADDR: &str = "127.0.0.1:23456";
/// How long ranks wait for each other while forming the group.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_INTERVAL: Duration = Duration::from_millis(100);
const ABORT_TIMEOUT: Duration = Duration::from_secs(5);

type NetRx = FrameReceiver<OwnedReadHalf>;
type NetTx = FrameSender<OwnedWriteHalf>;

/// One end of a root-to-peer connection.
struct Link {
    rank: usize,
    rx: NetRx,
    tx: NetTx,
    buf: Vec<f32>,
}

impl Link {
    fn new(rank: usize, stream: TcpStream) -> Self {
        let (rx, tx) = stream.into_split();
        let (rx, tx) = comms::channel(rx, tx);
        Self {
            rank,
            rx,
            tx,
            buf: Vec::new(),
        }
    }
}

enum Role {
    /// Rank 0, connected to every other rank ordered by rank.
    Root { peers: Vec<Link> },
    Peer { root: Link },
}

/// A fixed set of ranks joined in a star around rank 0.
///
/// Every collective is a blocking call driven on a private runtime, so the
/// training loop stays synchronous. A rank that receives `Abort` from a peer
/// while inside a collective fails with `WorkerErr::PeerAborted`; rank 0
/// relays such aborts to everyone else.
pub struct ProcessGroup {
    runtime: Runtime,
    rank: usize,
    world_size: usize,
    role: Role,
}

impl ProcessGroup {
    /// Joins the group of `world_size` ranks meeting at `addr`.
    ///
    /// Rank 0 listens and waits for every other rank to announce itself;
    /// the others connect, retrying until `CONNECT_TIMEOUT`.
    ///
    /// # Errors
    /// Returns `WorkerErr::Config` on an invalid or rejected rank and
    /// `WorkerErr::Io` if the group cannot be formed in time.
    pub fn init<A: ToSocketAddrs>(addr: A, rank: usize, world_size: usize) -> Result<Self> {
        Self::init_with_timeout(addr, rank, world_size, CONNECT_TIMEOUT)
    }

    pub fn init_with_timeout<A: ToSocketAddrs>(
        addr: A,
        rank: usize,
        world_size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        if rank >= world_size {
            return Err(WorkerErr::Config(format!(
                "rank {rank} is out of range for world size {world_size}"
            )));
        }

        let runtime = runtime::Builder::new_current_thread().enable_all().build()?;
        let role = runtime.block_on(async {
            let formed = async {
                if rank == 0 {
                    accept_peers(addr, world_size).await
                } else {
                    join_root(addr, rank, world_size, timeout).await
                }
            };

            time::timeout(timeout, formed).await.map_err(|_| {
                WorkerErr::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("process group not formed within {timeout:?}"),
                ))
            })?
        })?;

        info!(rank = rank, world_size = world_size; "init process group done");
        Ok(Self {
            runtime,
            rank,
            world_size,
            role,
        })
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Replaces `grads` with their element-wise mean over all ranks.
    ///
    /// # Errors
    /// Returns `WorkerErr::ShapeMismatch` if ranks disagree on the length,
    /// `WorkerErr::PeerAborted` if a rank gave up.
    pub fn all_reduce_mean(&mut self, grads: &mut [f32]) -> Result<()> {
        let world_size = self.world_size as f32;
        let Self { runtime, role, .. } = self;

        runtime.block_on(async {
            match role {
                Role::Root { peers } => {
                    for i in 0..peers.len() {
                        let peer = &mut peers[i];
                        let msg = peer.rx.recv_into(&mut peer.buf).await?;
                        match msg {
                            Msg::Data(Payload::Gradient(theirs)) => {
                                if theirs.len() != grads.len() {
                                    return Err(WorkerErr::ShapeMismatch {
                                        what: "gradient",
                                        got: theirs.len(),
                                        expected: grads.len(),
                                    });
                                }
                                grads.iter_mut().zip(theirs).for_each(|(g, t)| *g += t);
                            }
                            other => {
                                let from = peer.rank;
                                let err = unexpected(from, &other);
                                return Err(relay_if_abort(peers, err).await);
                            }
                        }
                    }

                    grads.iter_mut().for_each(|g| *g /= world_size);
                    let msg = Msg::Data(Payload::Gradient(grads));
                    for peer in peers.iter_mut() {
                        peer.tx.send(&msg).await?;
                    }
                    Ok(())
                }
                Role::Peer { root } => {
                    root.tx.send(&Msg::Data(Payload::Gradient(grads))).await?;

                    match root.rx.recv_into(&mut root.buf).await? {
                        Msg::Data(Payload::Gradient(mean)) if mean.len() == grads.len() => {
                            grads.copy_from_slice(mean);
                            Ok(())
                        }
                        Msg::Data(Payload::Gradient(mean)) => Err(WorkerErr::ShapeMismatch {
                            what: "averaged gradient",
                            got: mean.len(),
                            expected: grads.len(),
                        }),
                        other => Err(unexpected(0, &other)),
                    }
                }
            }
        })
    }

    /// Returns once every rank has entered the barrier.
    pub fn barrier(&mut self) -> Result<()> {
        let Self { runtime, role, .. } = self;

        runtime.block_on(async {
            match role {
                Role::Root { peers } => {
                    for i in 0..peers.len() {
                        let peer = &mut peers[i];
                        let msg = peer.rx.recv_into(&mut peer.buf).await?;
                        if !matches!(msg, Msg::Control(Command::Barrier)) {
                            let err = unexpected(peer.rank, &msg);
                            return Err(relay_if_abort(peers, err).await);
                        }
                    }

                    let msg = Msg::Control(Command::Barrier);
                    for peer in peers.iter_mut() {
                        peer.tx.send(&msg).await?;
                    }
                    Ok(())
                }
                Role::Peer { root } => {
                    root.tx.send(&Msg::Control(Command::Barrier)).await?;
                    match root.rx.recv_into(&mut root.buf).await? {
                        Msg::Control(Command::Barrier) => Ok(()),
                        other => Err(unexpected(0, &other)),
                    }
                }
            }
        })
    }

    /// Tells the rest of the group this rank is giving up.
    ///
    /// Best effort: delivery failures are only logged.
    pub fn abort(&mut self, reason: &str) {
        let rank = self.rank;
        let Self { runtime, role, .. } = self;
        let msg = Msg::Control(Command::Abort {
            rank,
            reason: reason.to_string(),
        });

        warn!(rank = rank; "aborting process group: {reason}");
        runtime.block_on(async {
            let links: Vec<&mut Link> = match role {
                Role::Root { peers } => peers.iter_mut().collect(),
                Role::Peer { root } => vec![root],
            };

            for link in links {
                match time::timeout(ABORT_TIMEOUT, link.tx.send(&msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(peer = link.rank; "abort not delivered: {e}"),
                    Err(_) => debug!(peer = link.rank; "abort delivery timed out"),
                }
            }
        });
    }
}

/// Offers a shared `ProcessGroup` to a model as its gradient exchange.
#[derive(Clone)]
pub struct GroupSync(pub Arc<Mutex<ProcessGroup>>);

impl GradientSync for GroupSync {
    fn all_reduce_mean(&mut self, grads: &mut [f32]) -> std::result::Result<(), MlError> {
        self.0
            .lock()
            .all_reduce_mean(grads)
            .map_err(|e| MlError::Sync(Box::new(e)))
    }
}

async fn accept_peers<A: ToSocketAddrs>(addr: A, world_size: usize) -> Result<Role> {
    let listener = TcpListener::bind(addr).await?;
    let mut slots: Vec<Option<Link>> = (1..world_size).map(|_| None).collect();
    let mut joined = 0;

    while joined < slots.len() {
        let (stream, remote) = listener.accept().await?;
        let mut link = Link::new(usize::MAX, stream);

        let (rank, their_world) = match link.rx.recv_into(&mut link.buf).await {
            Ok(Msg::Control(Command::Join { rank, world_size })) => (rank, world_size),
            Ok(other) => {
                warn!("rendezvous from {remote} sent {} instead of join", other.kind());
                continue;
            }
            Err(e) => {
                warn!("rendezvous from {remote} failed: {e}");
                continue;
            }
        };

        let rejection = if their_world != world_size {
            Some(format!("world size {their_world} does not match {world_size}"))
        } else if rank == 0 || rank >= world_size {
            Some(format!("rank {rank} is out of range"))
        } else if slots[rank - 1].is_some() {
            Some(format!("rank {rank} already joined"))
        } else {
            None
        };

        if let Some(reason) = rejection {
            warn!(rank = rank; "rejecting rendezvous: {reason}");
            let _ = link.tx.send(&Msg::Err(Cow::Owned(reason))).await;
            continue;
        }

        debug!(rank = rank; "rank joined from {remote}");
        link.rank = rank;
        slots[rank - 1] = Some(link);
        joined += 1;
    }

    let mut peers: Vec<Link> = slots.into_iter().flatten().collect();
    let ready = Msg::Control(Command::Ready { world_size });
    for peer in peers.iter_mut() {
        peer.tx.send(&ready).await?;
    }

    Ok(Role::Root { peers })
}

async fn join_root<A: ToSocketAddrs>(
    addr: A,
    rank: usize,
    world_size: usize,
    timeout: Duration,
) -> Result<Role> {
    let deadline = Instant::now() + timeout;
    let stream = loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => break stream,
            Err(e) if Instant::now() < deadline => {
                debug!(rank = rank; "rendezvous not reachable yet: {e}");
                time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e.into()),
        }
    };

    let mut root = Link::new(0, stream);
    root.tx
        .send(&Msg::Control(Command::Join { rank, world_size }))
        .await?;

    match root.rx.recv_into(&mut root.buf).await? {
        Msg::Control(Command::Ready { world_size: n }) if n == world_size => {}
        Msg::Err(reason) => {
            return Err(WorkerErr::Config(format!("rendezvous rejected: {reason}")));
        }
        other => return Err(unexpected(0, &other)),
    }

    Ok(Role::Peer { root })
}

fn unexpected(rank: usize, msg: &Msg<'_>) -> WorkerErr {
    match msg {
        Msg::Control(Command::Abort { rank, reason }) => WorkerErr::PeerAborted {
            rank: *rank,
            reason: reason.clone(),
        },
        Msg::Err(detail) => WorkerErr::PeerAborted {
            rank,
            reason: detail.to_string(),
        },
        other => WorkerErr::Protocol {
            rank,
            got: other.kind(),
        },
    }
}

/// On the root, forwards a peer's abort to every other peer before failing.
async fn relay_if_abort(peers: &mut [Link], err: WorkerErr) -> WorkerErr {
    if let WorkerErr::PeerAborted { rank, reason } = &err {
        let msg = Msg::Control(Command::Abort {
            rank: *rank,
            reason: reason.clone(),
        });
        for peer in peers.iter_mut().filter(|p| p.rank != *rank) {
            if let Ok(Err(e)) = time::timeout(ABORT_TIMEOUT, peer.tx.send(&msg)).await {
                debug!(peer = peer.rank; "relay of abort failed: {e}");
            }
        }
    }
    err
}
