#![no_std]

/// Name of the XDP program inside the compiled object.
pub const PROGRAM_NAME: &str = "coldgate";

/// Hash map of cold destinations: host-order IPv4 address -> host-order port.
pub const TARGETS_MAP: &str = "TARGETS";

/// Perf event array carrying intercepted SYNs to userspace.
pub const EVENTS_MAP: &str = "EVENTS";

/// Upper bound on simultaneously cold destinations.
pub const TARGETS_MAX_ENTRIES: u32 = 128;

/// Header of every perf sample emitted for an intercepted SYN.
///
/// All fields are copied verbatim from the packet and therefore stay in
/// network byte order; userspace converts them.  The kernel appends the raw
/// packet bytes directly after this header, so the header size must stay at
/// exactly 16 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureEvent {
    /// Source IPv4 address in network byte order.
    pub src_addr: u32,
    /// Destination IPv4 address in network byte order.
    pub dst_addr: u32,
    /// Source TCP port in network byte order.
    pub src_port: u16,
    /// Destination TCP port in network byte order.
    pub dst_port: u16,
    /// TCP sequence number in network byte order.
    pub seq: u32,
}

impl CaptureEvent {
    pub const LEN: usize = core::mem::size_of::<CaptureEvent>();
}

const _: () = assert!(CaptureEvent::LEN == 16);

#[cfg(feature = "user")]
unsafe impl aya::Pod for CaptureEvent {}
