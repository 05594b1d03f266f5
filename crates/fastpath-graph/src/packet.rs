//! Packets and their annotation slots

use bytes::{Bytes, BytesMut};

/// Annotation slots carried by every packet
pub const NUM_ANNOTATIONS: usize = 8;

/// Well-known annotation slots
pub mod anno {
    pub const TIMESTAMP: usize = 0;
    pub const IFACE_IN: usize = 1;
    pub const IFACE_OUT: usize = 2;
    pub const FLOW_ID: usize = 3;
    pub const DIGEST: usize = 4;
}

/// Where a packet goes after a classifying element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacketOut {
    Port(usize),
    Drop,
}

impl Default for PacketOut {
    fn default() -> Self {
        PacketOut::Port(0)
    }
}

/// One packet: payload, annotations, per-packet routing decision
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    data: BytesMut,
    anno: [u64; NUM_ANNOTATIONS],
    out: PacketOut,
}

impl Packet {
    pub fn new(data: BytesMut) -> Self {
        Self { data, anno: [0; NUM_ANNOTATIONS], out: PacketOut::default() }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(BytesMut::from(data))
    }

    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy of the payload for handing to a device
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    #[inline(always)]
    pub fn anno(&self, slot: usize) -> u64 {
        self.anno[slot]
    }

    #[inline(always)]
    pub fn set_anno(&mut self, slot: usize, value: u64) {
        self.anno[slot] = value;
    }

    #[inline(always)]
    pub fn output(&self) -> PacketOut {
        self.out
    }

    /// Send this packet to `port` of the current element
    #[inline(always)]
    pub fn set_output(&mut self, port: usize) {
        self.out = PacketOut::Port(port);
    }

    /// Drop this packet at the current element
    #[inline(always)]
    pub fn drop_packet(&mut self) {
        self.out = PacketOut::Drop;
    }

    pub(crate) fn reset_output(&mut self) {
        self.out = PacketOut::default();
    }
}

/// Set of annotation slots (bitmask over `NUM_ANNOTATIONS`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AnnoSet(u32);

impl AnnoSet {
    pub const EMPTY: AnnoSet = AnnoSet(0);

    pub fn of(slots: &[usize]) -> Self {
        slots.iter().fold(Self::EMPTY, |set, &s| set.with(s))
    }

    pub fn with(self, slot: usize) -> Self {
        assert!(slot < NUM_ANNOTATIONS, "annotation slot {slot} out of range");
        AnnoSet(self.0 | (1 << slot))
    }

    pub fn contains(self, slot: usize) -> bool {
        slot < NUM_ANNOTATIONS && self.0 & (1 << slot) != 0
    }

    pub fn union(self, other: AnnoSet) -> Self {
        AnnoSet(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..NUM_ANNOTATIONS).filter(move |&s| self.contains(s))
    }
}
