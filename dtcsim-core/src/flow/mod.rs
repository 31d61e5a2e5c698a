pub mod icmp_flow;
pub mod tcp_flow;
pub mod udp_flow;
