//! Packet batches

use crate::packet::Packet;

/// Ordered group of packets moving through the graph together.
///
/// A batch is owned by exactly one place at a time: the work queue, an
/// element's open offload task, or the caller of `free_batch`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketBatch {
    id: u64,
    packets: Vec<Packet>,
}

impl PacketBatch {
    pub fn new(packets: Vec<Packet>) -> Self {
        Self { id: 0, packets }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(Vec::with_capacity(capacity))
    }

    /// Graph-assigned id, 0 until admitted
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn push(&mut self, packet: Packet) {
        self.packets.push(packet);
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    pub fn packets_mut(&mut self) -> &mut [Packet] {
        &mut self.packets
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Packet> {
        self.packets.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Packet> {
        self.packets.iter_mut()
    }

    /// Total payload bytes
    pub fn bytes(&self) -> usize {
        self.packets.iter().map(Packet::len).sum()
    }

    pub(crate) fn take_packets(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.packets)
    }

    pub(crate) fn set_packets(&mut self, packets: Vec<Packet>) {
        self.packets = packets;
    }
}

impl From<Vec<Packet>> for PacketBatch {
    fn from(packets: Vec<Packet>) -> Self {
        Self::new(packets)
    }
}

impl IntoIterator for PacketBatch {
    type Item = Packet;
    type IntoIter = std::vec::IntoIter<Packet>;

    fn into_iter(self) -> Self::IntoIter {
        self.packets.into_iter()
    }
}
