use crate::types::Pmtu;

/// Packets a request occupies on the wire. A zero length request still
/// consumes one PSN.
pub(crate) fn calculate_packet_cnt(pmtu: Pmtu, total_len: u32) -> u32 {
    total_len.div_ceil(u32::from(&pmtu)).max(1)
}

#[inline]
pub(crate) fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}
