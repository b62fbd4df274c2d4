use std::cell::RefCell;

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::comm::Communicator;

struct Envelope {
    src: usize,
    tag: u32,
    bytes: Vec<u8>,
}

/// An in-process communicator: every rank runs on its own thread and the
/// transport is a crossbeam channel mesh. This is the rank group used by
/// the tests and the demo driver; it implements the same contract as the
/// TCP transport, including out-of-order delivery (messages that arrive
/// before a matching receive is posted are stashed, never dropped).
///
pub struct LocalCommunicator {
    rank: usize,
    peers: Vec<Sender<Envelope>>,
    inbox: Receiver<Envelope>,
    stash: RefCell<Vec<Envelope>>,
}

/// Create a fully-connected group of `size` local ranks. Each returned
/// communicator belongs on exactly one thread.
///
pub fn local_group(size: usize) -> Vec<LocalCommunicator> {
    let (senders, inboxes): (Vec<_>, Vec<_>) = (0..size).map(|_| unbounded()).unzip();

    inboxes
        .into_iter()
        .enumerate()
        .map(|(rank, inbox)| LocalCommunicator {
            rank,
            peers: senders.clone(),
            inbox,
            stash: RefCell::new(Vec::new()),
        })
        .collect()
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, tag: u32, message: Vec<u8>) {
        self.peers[rank]
            .send(Envelope {
                src: self.rank,
                tag,
                bytes: message,
            })
            .expect("peer rank has hung up");
    }

    fn recv(&self, rank: usize, tag: u32) -> Vec<u8> {
        let mut stash = self.stash.borrow_mut();
        if let Some(position) = stash.iter().position(|e| e.src == rank && e.tag == tag) {
            return stash.remove(position).bytes;
        }
        loop {
            let envelope = self.inbox.recv().expect("all peer ranks have hung up");
            if envelope.src == rank && envelope.tag == tag {
                return envelope.bytes;
            }
            stash.push(envelope);
        }
    }
}

// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use std::thread;

    #[test]
    fn tagged_delivery_is_order_independent() {
        let mut group = local_group(2);
        let b = group.pop().unwrap();
        let a = group.pop().unwrap();

        let worker = thread::spawn(move || {
            b.send(0, 7, vec![7]);
            b.send(0, 3, vec![3]);
            b.recv(0, 1)
        });

        // receive in the opposite order from the send order
        assert_eq!(a.recv(1, 3), vec![3]);
        assert_eq!(a.recv(1, 7), vec![7]);
        a.send(1, 1, vec![1]);
        assert_eq!(worker.join().unwrap(), vec![1]);
    }

    #[test]
    fn collectives_agree_across_ranks() {
        let group = local_group(4);
        let workers: Vec<_> = group
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let value = vec![comm.rank() as u8];
                    let total = comm.all_reduce(
                        |a, b| vec![a[0] + b[0]],
                        value.clone(),
                    );
                    let gathered = comm.all_gather(value);
                    comm.barrier();
                    (total, gathered)
                })
            })
            .collect();

        for worker in workers {
            let (total, gathered) = worker.join().unwrap();
            assert_eq!(total, vec![6]);
            assert_eq!(gathered, vec![vec![0], vec![1], vec![2], vec![3]]);
        }
    }

    #[test]
    fn paired_exchange_short_circuits_on_self() {
        let group = local_group(1);
        let comm = &group[0];
        let out = comm.exchange_paired(
            [Some(0), Some(0)],
            [10, 11],
            [11, 10],
            [vec![1], vec![2]],
        );
        assert_eq!(out, [vec![2], vec![1]]);
    }
}
