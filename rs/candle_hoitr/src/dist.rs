//! Data-parallel process group over TCP.
//!
//! Rank 0 listens on `MASTER_ADDR:MASTER_PORT` and every other rank connects
//! to it. Reductions are gathered and summed on rank 0, then sent back.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use candle_core::{backprop::GradStore, Tensor, Var};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;

#[derive(Debug, Error)]
pub enum DistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error("invalid environment variable {name}: {value:?}")]
    Env { name: &'static str, value: String },
    #[error("invalid dist url {0:?}, expected tcp://host:port")]
    Url(String),
    #[error("rank {rank} sent {got} values, expected {expected}")]
    Length {
        rank: usize,
        got: usize,
        expected: usize,
    },
    #[error("unexpected rank {0} during handshake")]
    Handshake(usize),
    #[error("process group lock poisoned")]
    Poisoned,
}

pub type Result<T> = std::result::Result<T, DistError>;

pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }

    /// Element-wise sum over all ranks, result on every rank
    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()>;

    /// Element-wise sum over all ranks, result on rank 0 only
    fn reduce_sum_to_main(&self, buf: &mut [f32]) -> Result<()>;

    fn barrier(&self) -> Result<()>;
}

/// World of size one
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _buf: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn reduce_sum_to_main(&self, _buf: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

async fn write_frame(stream: &mut TcpStream, buf: &[f32]) -> std::io::Result<()> {
    stream.write_u64(buf.len() as u64).await?;
    stream.write_all(bytemuck::cast_slice(buf)).await?;
    stream.flush().await
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<f32>> {
    let len = stream.read_u64().await? as usize;
    let mut bytes = vec![0u8; len * std::mem::size_of::<f32>()];
    stream.read_exact(&mut bytes).await?;
    Ok(bytemuck::pod_collect_to_vec(&bytes))
}

async fn accept_workers(master: SocketAddr, world_size: usize) -> Result<Vec<TcpStream>> {
    let listener = TcpListener::bind(master).await?;
    let mut peers: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
    for _ in 1..world_size {
        let (mut stream, _) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let peer = stream.read_u64().await? as usize;
        let slot = peers
            .get_mut(peer.wrapping_sub(1))
            .filter(|slot| slot.is_none())
            .ok_or(DistError::Handshake(peer))?;
        *slot = Some(stream);
    }
    Ok(peers.into_iter().flatten().collect())
}

async fn connect_to_master(master: SocketAddr, rank: usize, attempts: usize) -> Result<TcpStream> {
    let mut attempt = 0;
    let mut stream = loop {
        match TcpStream::connect(master).await {
            Ok(stream) => break stream,
            Err(e) if attempt + 1 < attempts => {
                attempt += 1;
                tracing::debug!(rank, attempt, "waiting for rank 0: {e}");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(e) => return Err(e.into()),
        }
    };
    stream.set_nodelay(true)?;
    stream.write_u64(rank as u64).await?;
    Ok(stream)
}

/// Process group with a star topology around rank 0
pub struct TcpProcessGroup {
    rank: usize,
    world_size: usize,
    runtime: Runtime,
    /// Rank 0: one stream per worker, ordered by rank. Workers: the stream to rank 0.
    streams: Mutex<Vec<TcpStream>>,
}

impl TcpProcessGroup {
    const CONNECT_ATTEMPTS: usize = 60;

    pub fn connect(rank: usize, world_size: usize, master: SocketAddr) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let streams = if rank == 0 {
            runtime.block_on(accept_workers(master, world_size))?
        } else {
            vec![runtime.block_on(connect_to_master(master, rank, Self::CONNECT_ATTEMPTS))?]
        };
        Ok(Self {
            rank,
            world_size,
            runtime,
            streams: Mutex::new(streams),
        })
    }

    fn reduce(&self, buf: &mut [f32], broadcast: bool) -> Result<()> {
        let mut streams = self.streams.lock().map_err(|_| DistError::Poisoned)?;
        self.runtime.block_on(async {
            if self.rank == 0 {
                for (i, stream) in streams.iter_mut().enumerate() {
                    let values = read_frame(stream).await?;
                    if values.len() != buf.len() {
                        return Err(DistError::Length {
                            rank: i + 1,
                            got: values.len(),
                            expected: buf.len(),
                        });
                    }
                    buf.iter_mut().zip(values).for_each(|(a, b)| *a += b);
                }
                if broadcast {
                    for stream in streams.iter_mut() {
                        write_frame(stream, buf).await?;
                    }
                }
            } else {
                let stream = &mut streams[0];
                write_frame(stream, buf).await?;
                if broadcast {
                    let values = read_frame(stream).await?;
                    if values.len() != buf.len() {
                        return Err(DistError::Length {
                            rank: 0,
                            got: values.len(),
                            expected: buf.len(),
                        });
                    }
                    buf.copy_from_slice(&values);
                }
            }
            Ok::<(), DistError>(())
        })
    }
}

impl ProcessGroup for TcpProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        self.reduce(buf, true)
    }

    fn reduce_sum_to_main(&self, buf: &mut [f32]) -> Result<()> {
        self.reduce(buf, false)
    }

    fn barrier(&self) -> Result<()> {
        self.reduce(&mut [0.0], true)
    }
}

fn env_usize(name: &'static str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| DistError::Env { name, value }),
        Err(_) => Ok(None),
    }
}

/// Master address from `--dist-url tcp://host:port`, or from
/// `MASTER_ADDR` / `MASTER_PORT` when the url is `env://`
fn master_address(dist_url: &str) -> Result<SocketAddr> {
    let host_port = if let Some(rest) = dist_url.strip_prefix("tcp://") {
        rest.to_string()
    } else if dist_url == "env://" {
        let addr = std::env::var("MASTER_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = std::env::var("MASTER_PORT").unwrap_or_else(|_| "29500".to_string());
        format!("{addr}:{port}")
    } else {
        return Err(DistError::Url(dist_url.to_string()));
    };
    std::net::ToSocketAddrs::to_socket_addrs(&host_port)?
        .next()
        .ok_or_else(|| DistError::Url(dist_url.to_string()))
}

/// Build the process group from `RANK` and `WORLD_SIZE`.
///
/// Without them, or with a world size of one, training runs in a single process.
pub fn init_distributed_mode(dist_url: &str) -> Result<Arc<dyn ProcessGroup>> {
    let (Some(rank), Some(world_size)) = (env_usize("RANK")?, env_usize("WORLD_SIZE")?) else {
        return Ok(Arc::new(SingleProcess));
    };
    if world_size <= 1 {
        return Ok(Arc::new(SingleProcess));
    }
    let master = master_address(dist_url)?;
    Ok(Arc::new(TcpProcessGroup::connect(rank, world_size, master)?))
}

/// Reduce the values of a dictionary over all ranks.
///
/// Every rank must hold the same keys.
pub fn reduce_dict(
    group: &dyn ProcessGroup,
    dict: &BTreeMap<String, f32>,
    average: bool,
) -> Result<BTreeMap<String, f32>> {
    let world_size = group.world_size();
    if world_size < 2 {
        return Ok(dict.clone());
    }
    let mut values: Vec<f32> = dict.values().copied().collect();
    group.all_reduce_sum(&mut values)?;
    if average {
        values.iter_mut().for_each(|v| *v /= world_size as f32);
    }
    Ok(dict.keys().cloned().zip(values).collect())
}

/// Average the gradients of `vars` over all ranks
pub fn average_gradients(group: &dyn ProcessGroup, grads: &mut GradStore, vars: &[Var]) -> Result<()> {
    let world_size = group.world_size();
    if world_size < 2 {
        return Ok(());
    }
    let mut flat = Vec::new();
    for var in vars {
        // Missing gradients count as zero so every rank sends the same layout
        let values = match grads.get(var.as_tensor()) {
            Some(g) => g.flatten_all()?.to_dtype(candle_core::DType::F32)?.to_vec1::<f32>()?,
            None => vec![0.0; var.elem_count()],
        };
        flat.extend(values);
    }
    group.all_reduce_sum(&mut flat)?;

    let mut offset = 0;
    for var in vars {
        let n = var.elem_count();
        let g = Tensor::from_slice(&flat[offset..offset + n], var.dims(), var.device())?
            .affine(1.0 / world_size as f64, 0.0)?
            .to_dtype(var.dtype())?;
        grads.insert(var.as_tensor(), g);
        offset += n;
    }
    Ok(())
}

/// Overwrite `vars` on every rank with the values of rank 0
pub fn broadcast_parameters(group: &dyn ProcessGroup, vars: &[Var]) -> Result<()> {
    if group.world_size() < 2 {
        return Ok(());
    }
    for var in vars {
        let mut values = if group.is_main_process() {
            var.flatten_all()?.to_dtype(candle_core::DType::F32)?.to_vec1::<f32>()?
        } else {
            vec![0.0; var.elem_count()]
        };
        group.all_reduce_sum(&mut values)?;
        let t = Tensor::from_vec(values, var.dims(), var.device())?.to_dtype(var.dtype())?;
        var.set(&t)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_process_reduce_dict_is_identity() {
        let dict: BTreeMap<String, f32> = [("a".to_string(), 1.5), ("b".to_string(), -2.0)].into();
        let reduced = reduce_dict(&SingleProcess, &dict, true).unwrap();
        assert_eq!(reduced, dict);
        assert!(SingleProcess.is_main_process());
    }

    #[test]
    fn test_master_address() {
        let addr = master_address("tcp://127.0.0.1:4567").unwrap();
        assert_eq!(addr.port(), 4567);
        assert!(matches!(master_address("file:///tmp/x"), Err(DistError::Url(_))));
    }

    #[test]
    fn test_tcp_all_reduce_two_ranks() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let master: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

        let worker = std::thread::spawn(move || {
            let group = TcpProcessGroup::connect(1, 2, master).unwrap();
            let mut buf = [3.0f32, 4.0];
            group.all_reduce_sum(&mut buf).unwrap();
            let dict: BTreeMap<String, f32> = [("loss".to_string(), 3.0)].into();
            let reduced = reduce_dict(&group, &dict, true).unwrap();
            let var = Var::new(&[9.0f32, 9.0], &candle_core::Device::Cpu).unwrap();
            broadcast_parameters(&group, &[var.clone()]).unwrap();
            group.barrier().unwrap();
            (buf, reduced["loss"], var.to_vec1::<f32>().unwrap())
        });

        let group = TcpProcessGroup::connect(0, 2, master).unwrap();
        let mut buf = [1.0f32, 2.0];
        group.all_reduce_sum(&mut buf).unwrap();
        let dict: BTreeMap<String, f32> = [("loss".to_string(), 1.0)].into();
        let reduced = reduce_dict(&group, &dict, true).unwrap();
        let var = Var::new(&[1.0f32, -1.0], &candle_core::Device::Cpu).unwrap();
        broadcast_parameters(&group, &[var.clone()]).unwrap();
        group.barrier().unwrap();

        let (worker_buf, worker_loss, worker_var) = worker.join().unwrap();
        assert_eq!(worker_var, vec![1.0, -1.0]);
        assert_eq!(var.to_vec1::<f32>().unwrap(), vec![1.0, -1.0]);
        assert_eq!(buf, [4.0, 6.0]);
        assert_eq!(worker_buf, [4.0, 6.0]);
        assert_eq!(reduced["loss"], 2.0);
        assert_eq!(worker_loss, 2.0);
    }

    #[test]
    fn test_average_gradients_single_process_keeps_grads() {
        let device = candle_core::Device::Cpu;
        let var = Var::new(&[1.0f32, 2.0], &device).unwrap();
        let loss = (var.as_tensor() * 3.0).unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        average_gradients(&SingleProcess, &mut grads, &[var.clone()]).unwrap();
        let g = grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(g, vec![3.0, 3.0]);
    }
}
