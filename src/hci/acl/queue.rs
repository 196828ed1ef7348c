use std::collections::{HashMap, VecDeque};

use super::*;

/// Unsent ACL data packet.
struct Queued {
    pkt: AclDataPacket,
    cid: Cid,
    /// Global enqueue order used to keep High priority packets in FIFO order
    /// across links.
    seq: u64,
}

impl Queued {
    #[inline(always)]
    fn is_first(&self) -> bool {
        self.pkt.boundary().is_first()
    }
}

/// Outbound packet queues of one logical link.
struct LinkQueue {
    typ: LinkType,
    pool: usize,
    high: VecDeque<Queued>,
    low: VecDeque<Queued>,
    /// Priority of the PDU whose first fragment was sent, but whose remaining
    /// fragments are still queued. Fragments of different PDUs must not
    /// interleave on one link ([Vol 1] Part A, Section 3.5.5.2.2).
    partial: Option<Priority>,
}

impl LinkQueue {
    #[inline]
    fn queue(&mut self, pri: Priority) -> &mut VecDeque<Queued> {
        match pri {
            Priority::High => &mut self.high,
            Priority::Low => &mut self.low,
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.high.len() + self.low.len()
    }

    /// Removes the oldest complete PDU of channel `cid` from the Low priority
    /// queue. Returns the number of removed packets.
    fn drop_oldest(&mut self, cid: Cid) -> usize {
        // Leading continuation fragments belong to a partially sent PDU
        let Some(i) = (self.low.iter()).position(|q| q.cid == cid && q.is_first()) else {
            return 0;
        };
        let mut n = 1;
        while self.low.get(i + n).map_or(false, |q| !q.is_first()) {
            n += 1;
        }
        self.low.drain(i..i + n);
        n
    }
}

/// Outbound ACL data packet scheduler. High priority packets are sent in
/// FIFO order across all links. Low priority packets use round-robin
/// scheduling to share the controller's buffer among all links.
pub(super) struct Scheduler {
    links: HashMap<ConnHandle, LinkQueue>,
    /// Order in which links get to send their next Low priority packet.
    order: VecDeque<ConnHandle>,
    next_seq: u64,
    max_chan_len: usize,
}

impl Scheduler {
    /// Creates a scheduler that limits the Low priority queue of each
    /// `(handle, channel)` pair to `max_chan_len` packets.
    #[must_use]
    pub fn new(max_chan_len: usize) -> Self {
        Self {
            links: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
            max_chan_len: max_chan_len.max(1),
        }
    }

    /// Returns the type of a registered link.
    #[inline]
    #[must_use]
    pub fn link_type(&self, hdl: ConnHandle) -> Option<LinkType> {
        self.links.get(&hdl).map(|q| q.typ)
    }

    /// Returns the total number of queued packets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.values().map(LinkQueue::len).sum()
    }

    /// Registers a new link that sends its packets from buffer pool `pool`.
    /// Returns `false` if the link is already registered.
    pub fn register(&mut self, hdl: ConnHandle, typ: LinkType, pool: usize) -> bool {
        if self.links.contains_key(&hdl) {
            return false;
        }
        self.links.insert(
            hdl,
            LinkQueue {
                typ,
                pool,
                high: VecDeque::new(),
                low: VecDeque::new(),
                partial: None,
            },
        );
        self.order.push_back(hdl);
        true
    }

    /// Removes link registration. Returns the number of discarded packets or
    /// `None` if the link is not registered.
    pub fn remove(&mut self, hdl: ConnHandle) -> Option<usize> {
        let q = self.links.remove(&hdl)?;
        if let Some(i) = self.order.iter().position(|&other| other == hdl) {
            self.order.remove(i);
        }
        Some(q.len())
    }

    /// Appends the fragments of one PDU to the queue of a registered link.
    /// For Low priority, the oldest PDUs of the same channel are dropped to
    /// keep the channel queue within its limit. Returns the number of dropped
    /// packets.
    pub fn push(
        &mut self,
        hdl: ConnHandle,
        cid: Cid,
        pri: Priority,
        pkts: impl ExactSizeIterator<Item = AclDataPacket>,
    ) -> usize {
        let Some(q) = self.links.get_mut(&hdl) else {
            return 0;
        };
        let mut dropped = 0;
        if pri == Priority::Low {
            let mut n = q.low.iter().filter(|q| q.cid == cid).count();
            while n + pkts.len() > self.max_chan_len {
                let d = q.drop_oldest(cid);
                if d == 0 {
                    break;
                }
                (n, dropped) = (n - d, dropped + d);
            }
        }
        let queue = q.queue(pri);
        for pkt in pkts {
            self.next_seq += 1;
            queue.push_back(Queued {
                pkt,
                cid,
                seq: self.next_seq,
            });
        }
        dropped
    }

    /// Removes every queued PDU whose first fragment satisfies the predicate.
    /// The remaining fragments of a partially sent PDU are never removed.
    /// Returns the number of removed packets.
    pub fn retain(&mut self, mut f: impl FnMut(&AclDataPacket, Cid) -> bool) -> usize {
        let mut n = 0;
        for q in self.links.values_mut() {
            for queue in [&mut q.high, &mut q.low] {
                let mut remove = false;
                queue.retain(|q| {
                    if q.is_first() {
                        remove = !f(&q.pkt, q.cid);
                    }
                    n += usize::from(remove);
                    !remove
                });
            }
        }
        n
    }

    /// Removes the next packet to send. `credit` specifies which buffer pools
    /// can accept another packet. Returns the pool index and the packet.
    pub fn pop(&mut self, credit: [bool; 2]) -> Option<(usize, AclDataPacket)> {
        // Pools with High priority packets held back by a partial Low PDU
        let mut held = [false; 2];
        let mut high: Option<(u64, ConnHandle)> = None;
        for (&hdl, q) in &self.links {
            let Some(front) = q.high.front() else { continue };
            if !credit[q.pool] {
                continue;
            }
            if q.partial == Some(Priority::Low) {
                held[q.pool] = true;
                continue;
            }
            if high.map_or(true, |(seq, _)| front.seq < seq) {
                high = Some((front.seq, hdl));
            }
        }
        if let Some((_, hdl)) = high {
            return self.pop_from(hdl, Priority::High);
        }
        let i = self.order.iter().position(|hdl| {
            self.links.get(hdl).map_or(false, |q| {
                credit[q.pool] && !q.low.is_empty() && (!held[q.pool] || q.partial.is_some())
            })
        })?;
        let hdl = self.order[i];
        self.order.rotate_left(i + 1);
        self.pop_from(hdl, Priority::Low)
    }

    fn pop_from(&mut self, hdl: ConnHandle, pri: Priority) -> Option<(usize, AclDataPacket)> {
        let q = self.links.get_mut(&hdl)?;
        let pool = q.pool;
        let queue = q.queue(pri);
        let pkt = queue.pop_front()?.pkt;
        let more = queue.front().map_or(false, |q| !q.is_first());
        q.partial = more.then_some(pri);
        Some((pool, pkt))
    }
}
