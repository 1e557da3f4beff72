//! Kernel-facing primitives for the TPROXY listener: binding sockets with
//! `IP_TRANSPARENT` and recovering the original destination via
//! `SO_ORIGINAL_DST` (TCP, through `getsockopt`) / `IP_RECVORIGDSTADDR`
//! (UDP, through ancillary `recvmsg` data).
//!
//! Grounded directly on the tproxy listener in
//! `other_examples/.../rd-std-src-transparent-tproxy.rs`, which documents
//! the same two shadowsocks-rust-derived code paths this module adapts.

mod addr;
mod tproxy;

pub use addr::TargetAddr;
pub use tproxy::{
    bind_tcp_transparent, bind_udp_transparent, original_dst_tcp, recv_dest_from, recv_dest_from_async, send_from_async,
};
