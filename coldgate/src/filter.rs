use std::io;
use std::path::PathBuf;

use aya::maps::{AsyncPerfEventArray, HashMap as AyaHashMap, MapData, MapError};
use aya::programs::{xdp::XdpLinkId, ProgramError, Xdp, XdpFlags};
use aya::util::online_cpus;
use aya::Ebpf;
use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use coldgate_common::{CaptureEvent, EVENTS_MAP, PROGRAM_NAME, TARGETS_MAP};

use crate::error::{FilterError, TableError};

/// Per-CPU perf buffers handed to `read_events` at once.
const PERF_BATCH: usize = 16;

/// Room for the event header plus a full Ethernet frame.
const SAMPLE_CAPACITY: usize = CaptureEvent::LEN + 2048;

/// One intercepted SYN as delivered by the kernel.
#[derive(Debug, Clone)]
pub struct CaptureSample {
    pub event: CaptureEvent,
    /// Raw packet bytes the kernel appended after the header.
    pub payload: Bytes,
}

impl CaptureSample {
    /// Split a raw perf sample into header and trailing payload.
    ///
    /// Returns `None` when the sample cannot hold a full header.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < CaptureEvent::LEN {
            return None;
        }
        let event = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const CaptureEvent) };
        Some(Self {
            event,
            payload: Bytes::copy_from_slice(&raw[CaptureEvent::LEN..]),
        })
    }
}

/// Merged capture events from every CPU.
///
/// `None` from `recv` means the filter was closed; an `Err` item means a
/// reader hit an unrecoverable error.
pub type CaptureStream = mpsc::Receiver<Result<CaptureSample, FilterError>>;

/// Key/value view of the in-kernel table of cold destinations.
///
/// Keys and values are host byte order.
pub trait TargetTable: Send + 'static {
    fn insert(&mut self, address: u32, port: u16) -> Result<(), TableError>;
    /// Fails with `TableError::NotFound` when `address` is absent.
    fn remove(&mut self, address: u32) -> Result<(), TableError>;
    fn get(&self, address: u32) -> Result<Option<u16>, TableError>;
}

/// What a successful attach hands over to the manager.
pub struct Attachment<T> {
    pub table: T,
    pub events: CaptureStream,
}

/// Loads and attaches the capture program.
pub trait PacketFilter: Send + 'static {
    type Table: TargetTable;

    fn attach(&mut self, ifname: &str) -> Result<Attachment<Self::Table>, FilterError>;

    /// Release everything `attach` acquired, newest first.  Idempotent.
    fn close(&mut self);
}

// ── aya backend ───────────────────────────────────────────────────────────────

/// XDP program loaded from an eBPF object on disk.
pub struct XdpFilter {
    object: PathBuf,
    ebpf: Option<Ebpf>,
    link: Option<XdpLinkId>,
    shutdown: Option<watch::Sender<bool>>,
    readers: Vec<JoinHandle<()>>,
}

impl XdpFilter {
    pub fn new(object: impl Into<PathBuf>) -> Self {
        Self {
            object: object.into(),
            ebpf: None,
            link: None,
            shutdown: None,
            readers: Vec::new(),
        }
    }

    fn open_readers(
        &mut self,
        mut perf: AsyncPerfEventArray<MapData>,
    ) -> Result<CaptureStream, FilterError> {
        let cpus = online_cpus()
            .map_err(|(what, err)| FilterError::Load(format!("{what}: {err}")))?;
        let (tx, rx) = mpsc::channel(1024);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        for cpu in cpus {
            let buf = perf
                .open(cpu, None)
                .map_err(|e| FilterError::Load(format!("perf buffer for cpu {cpu}: {e}")))?;
            let tx = tx.clone();
            let shutdown = shutdown_rx.clone();
            self.readers
                .push(tokio::spawn(read_cpu_events(cpu, buf, tx, shutdown)));
        }

        self.shutdown = Some(shutdown_tx);
        Ok(rx)
    }
}

impl PacketFilter for XdpFilter {
    type Table = XdpTargetTable;

    fn attach(&mut self, ifname: &str) -> Result<Attachment<XdpTargetTable>, FilterError> {
        if self.ebpf.is_some() {
            return Err(FilterError::AlreadyAttached);
        }

        tracing::debug!("Raising memlock limit");
        raise_memlock_limit()?;

        tracing::debug!(object = %self.object.display(), "Loading eBPF object");
        let mut ebpf =
            Ebpf::load_file(&self.object).map_err(|e| FilterError::Load(e.to_string()))?;

        let program: &mut Xdp = ebpf
            .program_mut(PROGRAM_NAME)
            .ok_or_else(|| FilterError::Load(format!("program {PROGRAM_NAME} not found")))?
            .try_into()
            .map_err(|e: ProgramError| FilterError::Load(e.to_string()))?;
        program
            .load()
            .map_err(|e| FilterError::Load(e.to_string()))?;

        tracing::debug!(ifname, "Attaching XDP program (generic mode)");
        let link = program
            .attach(ifname, XdpFlags::SKB_MODE)
            .map_err(|e| match e {
                ProgramError::UnknownInterface { .. } => {
                    FilterError::InterfaceNotFound(ifname.to_string())
                }
                other => FilterError::Attach {
                    ifname: ifname.to_string(),
                    reason: other.to_string(),
                },
            })?;

        let targets = ebpf
            .take_map(TARGETS_MAP)
            .ok_or_else(|| FilterError::Load(format!("map {TARGETS_MAP} not found")))?;
        let table = AyaHashMap::<_, u32, u16>::try_from(targets)
            .map_err(|e| FilterError::Load(e.to_string()))?;

        let events = ebpf
            .take_map(EVENTS_MAP)
            .ok_or_else(|| FilterError::Load(format!("map {EVENTS_MAP} not found")))?;
        let perf = AsyncPerfEventArray::try_from(events)
            .map_err(|e| FilterError::Load(e.to_string()))?;

        self.ebpf = Some(ebpf);
        self.link = Some(link);
        let events = self.open_readers(perf)?;

        Ok(Attachment {
            table: XdpTargetTable(table),
            events,
        })
    }

    fn close(&mut self) {
        // Perf readers first: their channel closing ends the drain worker.
        if let Some(shutdown) = self.shutdown.take() {
            tracing::debug!("Stopping perf readers");
            let _ = shutdown.send(true);
        }
        self.readers.clear();

        let Some(mut ebpf) = self.ebpf.take() else {
            return;
        };

        // The link depends on the loaded program, so it goes before the image.
        if let Some(link) = self.link.take() {
            tracing::debug!("Detaching XDP link");
            let program: Option<&mut Xdp> = ebpf
                .program_mut(PROGRAM_NAME)
                .and_then(|p| p.try_into().ok());
            match program.map(|p| p.detach(link)) {
                Some(Ok(())) => {}
                Some(Err(e)) => tracing::warn!("Detaching XDP link failed: {}", e),
                None => tracing::warn!("XDP program vanished before detach"),
            }
        }

        tracing::debug!("Unloading eBPF object");
        drop(ebpf);
    }
}

impl Drop for XdpFilter {
    fn drop(&mut self) {
        self.close();
    }
}

/// `TARGETS` hash map taken from the loaded object.
pub struct XdpTargetTable(AyaHashMap<MapData, u32, u16>);

impl TargetTable for XdpTargetTable {
    fn insert(&mut self, address: u32, port: u16) -> Result<(), TableError> {
        self.0
            .insert(address, port, 0)
            .map_err(|e| TableError::Map(e.to_string()))
    }

    fn remove(&mut self, address: u32) -> Result<(), TableError> {
        match self.0.remove(&address) {
            Ok(()) => Ok(()),
            Err(e) if is_missing_key(&e) => Err(TableError::NotFound),
            Err(e) => Err(TableError::Map(e.to_string())),
        }
    }

    fn get(&self, address: u32) -> Result<Option<u16>, TableError> {
        match self.0.get(&address, 0) {
            Ok(port) => Ok(Some(port)),
            Err(e) if is_missing_key(&e) => Ok(None),
            Err(e) => Err(TableError::Map(e.to_string())),
        }
    }
}

/// Lookups report ENOENT as `KeyNotFound`, deletes as a raw syscall error.
fn is_missing_key(err: &MapError) -> bool {
    match err {
        MapError::KeyNotFound => true,
        MapError::SyscallError(e) => e.io_error.kind() == io::ErrorKind::NotFound,
        _ => false,
    }
}

async fn read_cpu_events(
    cpu: u32,
    mut buf: aya::maps::perf::AsyncPerfEventArrayBuffer<MapData>,
    tx: mpsc::Sender<Result<CaptureSample, FilterError>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffers = (0..PERF_BATCH)
        .map(|_| BytesMut::with_capacity(SAMPLE_CAPACITY))
        .collect::<Vec<_>>();

    loop {
        let events = tokio::select! {
            _ = shutdown.changed() => return,
            res = buf.read_events(&mut buffers) => res,
        };

        let events = match events {
            Ok(events) => events,
            Err(e) => {
                let _ = tx
                    .send(Err(FilterError::EventRead(format!("cpu {cpu}: {e}"))))
                    .await;
                return;
            }
        };

        if events.lost > 0 {
            tracing::warn!(cpu, lost = events.lost, "Perf buffer overflowed");
        }

        for raw in buffers.iter().take(events.read) {
            match CaptureSample::parse(raw) {
                Some(sample) => {
                    if tx.send(Ok(sample)).await.is_err() {
                        return;
                    }
                }
                None => tracing::warn!(cpu, len = raw.len(), "Short perf sample skipped"),
            }
        }
    }
}

/// Needed on kernels without memcg-based accounting for BPF memory.
fn raise_memlock_limit() -> Result<(), FilterError> {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        return Err(FilterError::ResourceLimit(io::Error::last_os_error()));
    }
    Ok(())
}

// ── In-memory backend for tests ───────────────────────────────────────────────
