use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::Level;

use coldgate_common::CaptureEvent;

use crate::codec::ControlMessage;
use crate::error::{FilterError, TableError};
use crate::filter::{Attachment, CaptureSample, CaptureStream, PacketFilter, TargetTable};
use crate::sequencer::ReadyProbe;
use crate::state::AgentStats;

/// Mutation interface the session uses to keep the kernel table current.
pub trait TargetSink: Send + Sync + 'static {
    fn set_target(&self, address: u32, port: u16) -> Result<(), TableError>;
    fn remove_target(&self, address: u32) -> Result<(), TableError>;
}

/// Owns the packet filter and, once attached, the in-kernel target table.
///
/// Capture events are turned into `CaptureRequest`s on `requests`; a capture
/// stream failure is reported once on `fatal`.  Both senders move into the
/// drain worker on `start`, so the channels close when the worker exits.
pub struct TargetManager<F: PacketFilter> {
    filter: Mutex<F>,
    table: Mutex<Option<F::Table>>,
    ready: AtomicBool,
    requests: Mutex<Option<mpsc::Sender<ControlMessage>>>,
    fatal: Mutex<Option<mpsc::UnboundedSender<FilterError>>>,
    stats: Arc<AgentStats>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<F: PacketFilter> TargetManager<F> {
    pub fn new(
        filter: F,
        requests: mpsc::Sender<ControlMessage>,
        fatal: mpsc::UnboundedSender<FilterError>,
        stats: Arc<AgentStats>,
    ) -> Self {
        Self {
            filter: Mutex::new(filter),
            table: Mutex::new(None),
            ready: AtomicBool::new(false),
            requests: Mutex::new(Some(requests)),
            fatal: Mutex::new(Some(fatal)),
            stats,
        }
    }

    /// Attach the filter to `ifname` and start draining its capture events.
    ///
    /// Must run inside a tokio runtime.
    pub fn start(&self, ifname: &str) -> Result<(), FilterError> {
        let Attachment { table, events } = lock(&self.filter).attach(ifname)?;
        let (Some(requests), Some(fatal)) = (lock(&self.requests).take(), lock(&self.fatal).take())
        else {
            return Err(FilterError::AlreadyAttached);
        };
        *lock(&self.table) = Some(table);
        self.ready.store(true, Ordering::Release);
        tracing::info!("Capture filter attached to {}", ifname);

        let stats = self.stats.clone();
        tokio::spawn(async move {
            if let Err(e) = drain_events(events, requests, stats).await {
                tracing::error!("Capture stream failed: {}", e);
                let _ = fatal.send(e);
            }
        });

        Ok(())
    }

    pub fn set_target(&self, address: u32, port: u16) -> Result<(), TableError> {
        let mut table = lock(&self.table);
        let table = table.as_mut().ok_or(TableError::Unavailable)?;
        table.insert(address, port)?;
        tracing::debug!("Target set: {}:{}", Ipv4Addr::from(address), port);
        Ok(())
    }

    /// Removing an address that is not in the table succeeds.
    pub fn remove_target(&self, address: u32) -> Result<(), TableError> {
        let mut table = lock(&self.table);
        let table = table.as_mut().ok_or(TableError::Unavailable)?;
        match table.remove(address) {
            Ok(()) | Err(TableError::NotFound) => {
                tracing::debug!("Target removed: {}", Ipv4Addr::from(address));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn lookup_target(&self, address: u32) -> Result<Option<u16>, TableError> {
        let table = lock(&self.table);
        table.as_ref().ok_or(TableError::Unavailable)?.get(address)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Release the filter.  The capture stream closes as a consequence and
    /// the drain worker exits on its own.
    pub fn close(&self) {
        self.ready.store(false, Ordering::Release);
        lock(&self.filter).close();
        lock(&self.table).take();
        tracing::info!("Capture filter released");
    }
}

impl<F: PacketFilter> TargetSink for TargetManager<F> {
    fn set_target(&self, address: u32, port: u16) -> Result<(), TableError> {
        TargetManager::set_target(self, address, port)
    }

    fn remove_target(&self, address: u32) -> Result<(), TableError> {
        TargetManager::remove_target(self, address)
    }
}

impl<F: PacketFilter> ReadyProbe for TargetManager<F> {
    fn is_ready(&self) -> bool {
        TargetManager::is_ready(self)
    }
}

/// Read-only view of the kernel table for the status API.
pub trait TableView: ReadyProbe + Send + Sync + 'static {
    fn lookup_target(&self, address: u32) -> Result<Option<u16>, TableError>;
}

impl<F: PacketFilter> TableView for TargetManager<F> {
    fn lookup_target(&self, address: u32) -> Result<Option<u16>, TableError> {
        TargetManager::lookup_target(self, address)
    }
}

/// Destination of an intercepted SYN, converted to host order.
pub fn capture_request(event: &CaptureEvent) -> ControlMessage {
    ControlMessage::CaptureRequest {
        address: u32::from_be(event.dst_addr),
        port: u16::from_be(event.dst_port),
    }
}

/// Drain worker.  Returns `Ok` when the stream is closed.
async fn drain_events(
    mut events: CaptureStream,
    requests: mpsc::Sender<ControlMessage>,
    stats: Arc<AgentStats>,
) -> Result<(), FilterError> {
    while let Some(item) = events.recv().await {
        let sample = item?;
        AgentStats::bump(&stats.captures_total);
        log_capture(&sample);

        let request = capture_request(&sample.event);
        match requests.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                tracing::warn!("Request queue full, dropping {}", msg);
                AgentStats::bump(&stats.capture_requests_dropped);
            }
            Err(TrySendError::Closed(msg)) => {
                tracing::warn!("Session gone, dropping {}", msg);
                AgentStats::bump(&stats.capture_requests_dropped);
            }
        }
    }

    tracing::debug!("Capture stream closed");
    Ok(())
}

fn log_capture(sample: &CaptureSample) {
    if !tracing::enabled!(Level::DEBUG) {
        return;
    }
    let e = &sample.event;
    tracing::debug!(
        "TCP: {}:{} -> {}:{} seq={}",
        Ipv4Addr::from(u32::from_be(e.src_addr)),
        u16::from_be(e.src_port),
        Ipv4Addr::from(u32::from_be(e.dst_addr)),
        u16::from_be(e.dst_port),
        u32::from_be(e.seq),
    );
    if !sample.payload.is_empty() {
        tracing::debug!("\n{}", hex_dump(&sample.payload));
    }
}

/// Canonical hex dump: offset, 16 hex bytes, ASCII column.
fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4 + 16);
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", row * 16);
        for i in 0..16 {
            match chunk.get(i) {
                Some(b) => {
                    let _ = write!(out, "{b:02x} ");
                }
                None => out.push_str("   "),
            }
            if i == 7 {
                out.push(' ');
            }
        }
        out.push_str(" |");
        for &b in chunk {
            out.push(if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            });
        }
        out.push_str("|\n");
    }
    out
}
