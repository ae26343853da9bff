#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::{xdp_action, BPF_F_NO_PREALLOC},
    macros::{map, xdp},
    maps::{HashMap, PerfEventArray},
    programs::XdpContext,
};
use coldgate_common::{CaptureEvent, TARGETS_MAX_ENTRIES};
use core::ptr;
use network_types::{
    eth::{EthHdr, EtherType},
    ip::{IpProto, Ipv4Hdr},
    tcp::TcpHdr,
};

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 13] = *b"Dual MIT/GPL\0";

/// Cold destinations, written by userspace.  Key and value are host order.
#[map]
static TARGETS: HashMap<u32, u16> =
    HashMap::with_max_entries(TARGETS_MAX_ENTRIES, BPF_F_NO_PREALLOC);

#[map]
static EVENTS: PerfEventArray<CaptureEvent> = PerfEventArray::new(0);

/// XDP entry point.
///
/// Drops the initial SYN of any TCP connection towards a cold destination and
/// reports it (header plus the whole packet) to userspace.  Everything else
/// passes untouched.
#[xdp]
pub fn coldgate(ctx: XdpContext) -> u32 {
    let data = ctx.data();
    let data_end = ctx.data_end();

    // -- Ethernet ----------------------------------------------------------
    let eth_end = data + EthHdr::LEN;
    if eth_end > data_end {
        return xdp_action::XDP_ABORTED;
    }
    let eth_hdr = data as *const EthHdr;
    let ether_type = unsafe { ptr::read_unaligned(ptr::addr_of!((*eth_hdr).ether_type)) };
    if ether_type != EtherType::Ipv4 {
        return xdp_action::XDP_PASS;
    }

    // -- IPv4 --------------------------------------------------------------
    let ip_start = eth_end;
    if ip_start + Ipv4Hdr::LEN > data_end {
        return xdp_action::XDP_ABORTED;
    }
    let ip_hdr = ip_start as *const Ipv4Hdr;
    let proto = unsafe { ptr::read_unaligned(ptr::addr_of!((*ip_hdr).proto)) };
    if proto != IpProto::Tcp {
        return xdp_action::XDP_PASS;
    }
    let ihl = unsafe { (*ip_hdr).ihl() } as usize;
    let raw_src_addr = unsafe { ptr::read_unaligned(ptr::addr_of!((*ip_hdr).src_addr)) };
    let raw_dst_addr = unsafe { ptr::read_unaligned(ptr::addr_of!((*ip_hdr).dst_addr)) };

    // -- TCP ---------------------------------------------------------------
    let tcp_start = ip_start + ihl * 4;
    if tcp_start + TcpHdr::LEN > data_end {
        return xdp_action::XDP_ABORTED;
    }
    let tcp_hdr = tcp_start as *const TcpHdr;
    let (syn, ack) = unsafe { ((*tcp_hdr).syn(), (*tcp_hdr).ack()) };
    if syn == 0 || ack != 0 {
        return xdp_action::XDP_PASS;
    }
    let raw_src_port = unsafe { ptr::read_unaligned(ptr::addr_of!((*tcp_hdr).source)) };
    let raw_dst_port = unsafe { ptr::read_unaligned(ptr::addr_of!((*tcp_hdr).dest)) };
    let raw_seq = unsafe { ptr::read_unaligned(ptr::addr_of!((*tcp_hdr).seq)) };

    // -- Target lookup -----------------------------------------------------
    let key = u32::from_be(raw_dst_addr);
    let port = match unsafe { TARGETS.get(&key) } {
        Some(port) => *port,
        None => return xdp_action::XDP_PASS,
    };
    if port != u16::from_be(raw_dst_port) {
        return xdp_action::XDP_PASS;
    }

    // -- Emit event --------------------------------------------------------
    // Header fields stay in network byte order; userspace converts them.
    // The upper 32 bits of the flags ask the kernel to append that many
    // bytes of packet data after the header.
    let event = CaptureEvent {
        src_addr: raw_src_addr,
        dst_addr: raw_dst_addr,
        src_port: raw_src_port,
        dst_port: raw_dst_port,
        seq: raw_seq,
    };
    let pkt_len = (data_end - data) as u32;
    EVENTS.output(&ctx, &event, pkt_len);

    xdp_action::XDP_DROP
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
