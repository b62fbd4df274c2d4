use super::util;

// Tags reserved by the collective operations; point-to-point users must
// stay below this range.
pub const TAG_BCAST: u32 = u32::MAX;
pub const TAG_REDUCE: u32 = u32::MAX - 1;
pub const TAG_GATHER: u32 = u32::MAX - 2;

/// Interface for a group of processes that can exchange messages over a
/// network. The underlying transport can in principle be TCP, shared
/// channels, or a higher level abstraction like MPI.
///
pub trait Communicator {
    /// Must be implemented to return the rank of this process within the
    /// communicator.
    fn rank(&self) -> usize;

    /// Must be implemented to return the number of peer processes in this
    /// communicator.
    fn size(&self) -> usize;

    /// Must be implemented to send a message to a peer. This method must
    /// return immediately, in other words it is not allowed to block until
    /// a matching receive is posted.
    fn send(&self, rank: usize, tag: u32, message: Vec<u8>);

    /// Must be implemented to receive the next message carrying the given
    /// tag from the given peer, blocking until one arrives. Messages from
    /// other peers or with other tags that arrive in the meantime must be
    /// held back, not dropped.
    fn recv(&self, rank: usize, tag: u32) -> Vec<u8>;

    /// The symmetric two-endpoint exchange at the heart of the buffer
    /// engine: endpoint `t` sends `send[t]` to `peer[t]` and receives the
    /// matching message back from the same peer. A `None` peer (outside a
    /// non-periodic boundary) transfers nothing and yields an empty
    /// buffer. When both peers are this rank itself (periodic wrap onto a
    /// single rank along an axis) the transport is short-circuited and
    /// each endpoint receives the opposite endpoint's send buffer.
    ///
    fn exchange_paired(
        &self,
        peer: [Option<usize>; 2],
        send_tag: [u32; 2],
        recv_tag: [u32; 2],
        send: [Vec<u8>; 2],
    ) -> [Vec<u8>; 2] {
        let me = self.rank();

        if peer == [Some(me), Some(me)] {
            let [a, b] = send;
            return [b, a];
        }

        let [send_0, send_1] = send;
        if let Some(rank) = peer[0] {
            self.send(rank, send_tag[0], send_0);
        }
        if let Some(rank) = peer[1] {
            self.send(rank, send_tag[1], send_1);
        }

        let recv_0 = peer[0].map_or_else(Vec::new, |rank| self.recv(rank, recv_tag[0]));
        let recv_1 = peer[1].map_or_else(Vec::new, |rank| self.recv(rank, recv_tag[1]));
        [recv_0, recv_1]
    }

    /// Implements a binomial tree broadcast from the root node. The message
    /// buffer must be `Some` if this is the root node, and it must be `None`
    /// otherwise.
    ///
    fn broadcast(&self, value: Option<Vec<u8>>) -> Vec<u8> {
        let r = self.rank();
        let p = self.size();

        let value = match value {
            Some(value) => value,
            None => self.recv(r & (r - 1), TAG_BCAST),
        };
        for level in (0..util::ceil_log2(p)).rev() {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 && r + one < p {
                self.send(r + one, TAG_BCAST, value.clone())
            }
        }
        value
    }

    /// Implements a binomial tree reduce. All ranks return `None` except for
    /// the root.
    ///
    fn reduce<F>(&self, f: F, mut value: Vec<u8>) -> Option<Vec<u8>>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Vec<u8>,
    {
        let r = self.rank();
        let p = self.size();

        for level in 0..util::ceil_log2(p) {
            let one = 1 << level;
            let two = 1 << (level + 1);

            if r % two == 0 {
                if r + one < p {
                    value = f(value, self.recv(r + one, TAG_REDUCE))
                }
            } else {
                self.send(r - one, TAG_REDUCE, value);
                return None;
            }
        }
        Some(value)
    }

    /// Implements an all-reduce (symmetric fold) operation over a commutative
    /// binary operator.
    ///
    fn all_reduce<F>(&self, f: F, value: Vec<u8>) -> Vec<u8>
    where
        F: Fn(Vec<u8>, Vec<u8>) -> Vec<u8>,
    {
        self.broadcast(self.reduce(f, value))
    }

    /// Collect one buffer from every rank, in rank order. Every rank
    /// returns the full list.
    ///
    fn all_gather(&self, value: Vec<u8>) -> Vec<Vec<u8>> {
        let me = self.rank();
        let p = self.size();

        for rank in 0..p {
            if rank != me {
                self.send(rank, TAG_GATHER, value.clone());
            }
        }
        (0..p)
            .map(|rank| {
                if rank == me {
                    value.clone()
                } else {
                    self.recv(rank, TAG_GATHER)
                }
            })
            .collect()
    }

    /// A rendezvous: no rank returns before every rank has entered.
    ///
    fn barrier(&self) {
        self.all_reduce(|a, _| a, Vec::new());
    }
}
