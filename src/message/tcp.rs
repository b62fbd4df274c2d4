use std::cell::RefCell;
use std::io::prelude::*;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;

use super::comm::Communicator;
use super::util;

struct Envelope {
    src: usize,
    tag: u32,
    bytes: Vec<u8>,
}

/// A `Communicator` over plain TCP. Each message opens a short-lived
/// connection carrying a fixed envelope (source rank, tag, length) ahead
/// of the payload; sends are drained by a background thread so the send
/// call never blocks on the peer.
///
pub struct TcpCommunicator {
    rank: usize,
    num_peers: usize,
    listener: TcpListener,
    stash: RefCell<Vec<Envelope>>,
    send_sink: Option<mpsc::Sender<(usize, u32, Vec<u8>)>>,
    send_thread: Option<thread::JoinHandle<()>>,
}

impl TcpCommunicator {
    pub fn new(rank: usize, peers: Vec<SocketAddr>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(peers[rank])?;
        let num_peers = peers.len();
        let (send_sink, recv_sink): (
            mpsc::Sender<(usize, u32, Vec<u8>)>,
            mpsc::Receiver<(usize, u32, Vec<u8>)>,
        ) = mpsc::channel();
        let my_rank = rank;
        let send_thread = thread::spawn(move || {
            for (peer, tag, message) in recv_sink {
                let mut stream = TcpStream::connect(peers[peer]).expect("peer is listening");
                stream.write_all(&my_rank.to_le_bytes()).unwrap();
                stream.write_all(&tag.to_le_bytes()).unwrap();
                stream.write_all(&message.len().to_le_bytes()).unwrap();
                stream.write_all(&message).unwrap();
            }
        });
        Ok(Self {
            rank,
            num_peers,
            listener,
            stash: RefCell::new(Vec::new()),
            send_sink: Some(send_sink),
            send_thread: Some(send_thread),
        })
    }

    fn recv_any(&self) -> Envelope {
        let (mut stream, _) = self.listener.accept().expect("listener accepts");
        let src = util::read_usize(&mut stream).expect("envelope source");
        let tag = u32::from_le_bytes(util::read_bytes_array(&mut stream).expect("envelope tag"));
        let size = util::read_usize(&mut stream).expect("envelope length");
        let bytes = util::read_bytes_vec(&mut stream, size).expect("payload");
        Envelope { src, tag, bytes }
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.num_peers
    }

    fn send(&self, rank: usize, tag: u32, message: Vec<u8>) {
        self.send_sink
            .as_ref()
            .unwrap()
            .send((rank, tag, message))
            .unwrap()
    }

    fn recv(&self, rank: usize, tag: u32) -> Vec<u8> {
        let mut stash = self.stash.borrow_mut();
        if let Some(position) = stash.iter().position(|e| e.src == rank && e.tag == tag) {
            return stash.remove(position).bytes;
        }
        loop {
            let envelope = self.recv_any();
            if envelope.src == rank && envelope.tag == tag {
                return envelope.bytes;
            }
            stash.push(envelope);
        }
    }
}

impl Drop for TcpCommunicator {
    fn drop(&mut self) {
        self.send_sink.take().unwrap();
        self.send_thread.take().unwrap().join().unwrap();
    }
}
